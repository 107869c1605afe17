//! Access to maps shared with the eBPF side.
//!
//! The event processor only needs three operations on kernel maps:
//! looking a map up by name, reading a value and deleting a key.
//! [`MapProvider`] and [`KernelMap`] describe exactly that, so that the
//! processing logic can run against the real eBPF object ([`EbpfMaps`])
//! or against an in-memory table in tests.

use std::{
    collections::HashMap,
    io, mem,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    sync::{Arc, Mutex, PoisonError},
};

use aya::{
    Ebpf,
    maps::{Map, MapData, ProgramArray},
    sys::SyscallError,
};
use aya_obj::generated::{bpf_attr, bpf_cmd};
use libc::SYS_bpf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map {0} is not a program array")]
    UnexpectedMapType(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid key size {0}")]
    InvalidKeySize(usize),
    #[error("syscall {call} failed")]
    Syscall {
        call: &'static str,
        #[source]
        io_error: io::Error,
    },
    #[error(transparent)]
    Aya(aya::maps::MapError),
}

/// Lookup of kernel maps by name.
pub trait MapProvider: Send + Sync {
    fn get_map(&self, name: &str) -> Result<Arc<dyn KernelMap>, MapError>;
}

/// Minimal key-value interface of a kernel map. Keys and values are raw bytes
/// in the layout expected by the eBPF side.
pub trait KernelMap: Send + Sync {
    fn get_value(&self, key: &[u8]) -> Result<Vec<u8>, MapError>;
    fn delete_key(&self, key: &[u8]) -> Result<(), MapError>;
}

/// [`MapProvider`] backed by a loaded [`aya::Ebpf`] object.
///
/// Maps are taken out of the object the first time they're requested and
/// cached afterwards, since aya allows taking each map only once.
pub struct EbpfMaps {
    bpf: Mutex<Ebpf>,
    used_maps: Mutex<HashMap<String, Arc<dyn KernelMap>>>,
}

impl EbpfMaps {
    pub fn new(bpf: Ebpf) -> Self {
        Self {
            bpf: Mutex::new(bpf),
            used_maps: Mutex::new(HashMap::new()),
        }
    }
}

impl MapProvider for EbpfMaps {
    fn get_map(&self, name: &str) -> Result<Arc<dyn KernelMap>, MapError> {
        let mut used_maps = self.used_maps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = used_maps.get(name) {
            return Ok(map.clone());
        }
        let map_resource = self
            .bpf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_map(name)
            .ok_or_else(|| MapError::MapNotFound(name.to_string()))?;
        let map: Arc<dyn KernelMap> = Arc::new(ProgramArrayMap::new(name, map_resource)?);
        used_maps.insert(name.to_string(), map.clone());
        Ok(map)
    }
}

/// A `BPF_MAP_TYPE_PROG_ARRAY` used for tail calls. Keys are `u32` indexes,
/// lookups from userspace return the id of the installed program.
pub struct ProgramArrayMap {
    array: Mutex<ProgramArray<MapData>>,
    /// aya doesn't expose lookups on program arrays
    lookup_fd: OwnedFd,
}

impl ProgramArrayMap {
    fn new(name: &str, map: Map) -> Result<Self, MapError> {
        let Map::ProgramArray(data) = &map else {
            return Err(MapError::UnexpectedMapType(name.to_string()));
        };
        let lookup_fd = data
            .fd()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|io_error| MapError::Syscall {
                call: "dup",
                io_error,
            })?;
        let array = ProgramArray::try_from(map).map_err(MapError::Aya)?;
        Ok(Self {
            array: Mutex::new(array),
            lookup_fd,
        })
    }
}

impl KernelMap for ProgramArrayMap {
    fn get_value(&self, key: &[u8]) -> Result<Vec<u8>, MapError> {
        let key = index_key(key)?;
        let mut value = [0u8; 4];

        let mut attr = unsafe { mem::zeroed::<bpf_attr>() };
        let u = unsafe { &mut attr.__bindgen_anon_2 };
        u.map_fd = self.lookup_fd.as_raw_fd() as u32;
        u.key = key.as_ptr() as u64;
        u.__bindgen_anon_1.value = value.as_mut_ptr() as u64;

        let ret = unsafe {
            libc::syscall(
                SYS_bpf,
                bpf_cmd::BPF_MAP_LOOKUP_ELEM,
                &mut attr,
                mem::size_of::<bpf_attr>(),
            )
        };
        if ret < 0 {
            return Err(syscall_error("bpf_map_lookup_elem", io::Error::last_os_error()));
        }
        Ok(value.to_vec())
    }

    fn delete_key(&self, key: &[u8]) -> Result<(), MapError> {
        let index = u32::from_ne_bytes(index_key(key)?);
        self.array
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_index(&index)
            .map_err(from_aya_error)
    }
}

fn index_key(key: &[u8]) -> Result<[u8; 4], MapError> {
    key.try_into()
        .map_err(|_| MapError::InvalidKeySize(key.len()))
}

fn syscall_error(call: &'static str, io_error: io::Error) -> MapError {
    if io_error.raw_os_error() == Some(libc::ENOENT) {
        MapError::KeyNotFound
    } else {
        MapError::Syscall { call, io_error }
    }
}

fn from_aya_error(err: aya::maps::MapError) -> MapError {
    match err {
        aya::maps::MapError::SyscallError(SyscallError { call, io_error }) => {
            syscall_error(call, io_error)
        }
        err => MapError::Aya(err),
    }
}
