use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result, bail};
use ktrace_core::config::ModuleConfig;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/ktrace/ktrace.ini";

/// Tracing session configuration, one [`ModuleConfig`] per `INI` section.
#[derive(Debug, Clone, Default)]
pub struct KtraceConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl KtraceConfig {
    /// Load the configuration from `config_file`, which must exist.
    pub fn from_file(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    /// Load the configuration from the content of an `INI` file.
    pub fn from_ini_str(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str(content).context("Error parsing configuration")?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let mod_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    mod_config.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self { configs }
    }

    /// Get a module configuration, empty if the section is missing.
    pub fn get_module_config(&self, module: &str) -> ModuleConfig {
        self.configs.get(module).cloned().unwrap_or_default()
    }

    /// Update a single value of a module configuration.
    pub fn set(&mut self, module: &str, key: &str, value: &str) {
        log::debug!("Changing configuration {}.{}={}", module, key, value);
        self.configs
            .entry(module.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}
