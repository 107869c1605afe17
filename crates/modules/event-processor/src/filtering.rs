//! # Events filtering
//!
//! Decides whether an event is interesting for the rest of the system
//! or if it should be dropped before spending any work on it.
//!
//! Two independent filter families are supported, both configured per event:
//! - return value filters: accepted values, rejected values and strict
//!   lower/upper bounds
//! - argument filters: accepted and rejected patterns for the textual form of
//!   an argument. Patterns ending with [`WILDCARD`] match by prefix.
//!
//! An event is dropped as soon as one family rejects it.

use std::{collections::HashMap, str::FromStr};

use ktrace_core::event::{Args, EventContext, EventId};
use thiserror::Error;

pub const WILDCARD: char = '*';

/// Return value filter of a single event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetFilter {
    /// If not empty, the return value must be one of these
    pub equal: Vec<i64>,
    /// The return value must not be any of these
    pub not_equal: Vec<i64>,
    /// The return value must be strictly greater than this
    pub greater: Option<i64>,
    /// The return value must be strictly less than this
    pub less: Option<i64>,
}

impl RetFilter {
    pub fn matches(&self, retval: i64) -> bool {
        if !self.equal.is_empty() && !self.equal.contains(&retval) {
            return false;
        }
        if self.not_equal.contains(&retval) {
            return false;
        }
        if self.greater.is_some_and(|greater| retval <= greater) {
            return false;
        }
        if self.less.is_some_and(|less| retval >= less) {
            return false;
        }
        true
    }

    pub fn apply(&mut self, condition: RetCondition) {
        match condition {
            RetCondition::Equal(value) => self.equal.push(value),
            RetCondition::NotEqual(value) => self.not_equal.push(value),
            RetCondition::Greater(value) => self.greater = Some(value),
            RetCondition::Less(value) => self.less = Some(value),
        }
    }
}

/// Filter on the textual value of a single argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgFilter {
    pub equal: Vec<String>,
    pub not_equal: Vec<String>,
}

impl ArgFilter {
    pub fn matches(&self, value: &str) -> bool {
        if !self.equal.is_empty() && !self.equal.iter().any(|p| pattern_matches(p, value)) {
            return false;
        }
        !self.not_equal.iter().any(|p| pattern_matches(p, value))
    }

    pub fn apply(&mut self, condition: ArgCondition) {
        match condition {
            ArgCondition::Equal(pattern) => self.equal.push(pattern),
            ArgCondition::NotEqual(pattern) => self.not_equal.push(pattern),
        }
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix(WILDCARD) {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    }
}

/// All the filters of a tracing session.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub retval_enabled: bool,
    pub retval: HashMap<EventId, RetFilter>,
    pub args_enabled: bool,
    pub args: HashMap<EventId, HashMap<String, ArgFilter>>,
}

impl Filters {
    /// Returns false if the event should be dropped.
    pub fn should_process(&self, ctx: &EventContext, args: &Args) -> bool {
        if self.retval_enabled {
            if let Some(filter) = self.retval.get(&ctx.event_id) {
                if !filter.matches(ctx.retval) {
                    return false;
                }
            }
        }

        if self.args_enabled {
            if let Some(filters) = self.args.get(&ctx.event_id) {
                for (arg_name, filter) in filters {
                    // arguments missing from the event are neither accepted nor rejected
                    let Some(value) = args.get(arg_name) else {
                        continue;
                    };
                    if !filter.matches(&value.to_string()) {
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConditionError {
    #[error("missing operator in '{0}', expected one of '=', '!=', '>', '<'")]
    MissingOperator(String),
    #[error("invalid number in '{0}'")]
    InvalidNumber(String),
}

/// A single return value condition, as written in configuration: `=0`, `!=-1`,
/// `>0`, `<4096`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCondition {
    Equal(i64),
    NotEqual(i64),
    Greater(i64),
    Less(i64),
}

impl FromStr for RetCondition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (constructor, value): (fn(i64) -> Self, &str) = if let Some(v) = s.strip_prefix("!=") {
            (RetCondition::NotEqual, v)
        } else if let Some(v) = s.strip_prefix('=') {
            (RetCondition::Equal, v)
        } else if let Some(v) = s.strip_prefix('>') {
            (RetCondition::Greater, v)
        } else if let Some(v) = s.strip_prefix('<') {
            (RetCondition::Less, v)
        } else {
            return Err(ConditionError::MissingOperator(s.to_string()));
        };
        value
            .trim()
            .parse()
            .map(constructor)
            .map_err(|_| ConditionError::InvalidNumber(s.to_string()))
    }
}

/// A single argument condition: `=pattern` or `!=pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgCondition {
    Equal(String),
    NotEqual(String),
}

impl FromStr for ArgCondition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pattern) = s.strip_prefix("!=") {
            Ok(ArgCondition::NotEqual(pattern.to_string()))
        } else if let Some(pattern) = s.strip_prefix('=') {
            Ok(ArgCondition::Equal(pattern.to_string()))
        } else {
            Err(ConditionError::MissingOperator(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::{Pid, time::Timestamp};
    use ktrace_core::event::ArgValue;

    use super::*;

    fn ctx(event_id: EventId, retval: i64) -> EventContext {
        EventContext {
            ts: Timestamp::from(0),
            pid: Pid::from_raw(10),
            host_pid: Pid::from_raw(10),
            mnt_id: 4026531841,
            event_id,
            retval,
            argnum: 0,
        }
    }

    fn retval_filters(filter: RetFilter) -> Filters {
        Filters {
            retval_enabled: true,
            retval: HashMap::from([(EventId::OPEN, filter)]),
            ..Default::default()
        }
    }

    #[test]
    fn reject_list_only() {
        let filters = retval_filters(RetFilter {
            not_equal: vec![-2, -13],
            ..Default::default()
        });
        for retval in [-13, -2, -1, 0, 3] {
            let expected = retval != -2 && retval != -13;
            assert_eq!(
                filters.should_process(&ctx(EventId::OPEN, retval), &Args::new()),
                expected,
                "retval {retval}"
            );
        }
    }

    #[test]
    fn accept_list() {
        let filters = retval_filters(RetFilter {
            equal: vec![0],
            ..Default::default()
        });
        assert!(filters.should_process(&ctx(EventId::OPEN, 0), &Args::new()));
        assert!(!filters.should_process(&ctx(EventId::OPEN, 3), &Args::new()));
    }

    #[test]
    fn bounds_are_strict() {
        let filter = RetFilter {
            equal: vec![],
            not_equal: vec![5],
            greater: Some(0),
            less: Some(10),
        };
        for retval in -3..15 {
            let expected = 0 < retval && retval < 10 && retval != 5;
            assert_eq!(filter.matches(retval), expected, "retval {retval}");
        }
    }

    #[test]
    fn bound_at_zero_is_not_unset() {
        let filter = RetFilter {
            less: Some(0),
            ..Default::default()
        };
        assert!(filter.matches(-1));
        assert!(!filter.matches(0));
        assert!(RetFilter::default().matches(0));
    }

    #[test]
    fn other_events_and_disabled_filters_pass() {
        let mut filters = retval_filters(RetFilter {
            equal: vec![0],
            ..Default::default()
        });
        assert!(filters.should_process(&ctx(EventId::SOCKET, -1), &Args::new()));
        filters.retval_enabled = false;
        assert!(filters.should_process(&ctx(EventId::OPEN, -1), &Args::new()));
    }

    #[test]
    fn wildcard_patterns() {
        let filter = ArgFilter {
            equal: vec!["/tmp/*".to_string(), "/etc/passwd".to_string()],
            not_equal: vec![],
        };
        assert!(filter.matches("/tmp/a"));
        assert!(filter.matches("/tmp/"));
        assert!(filter.matches("/etc/passwd"));
        assert!(!filter.matches("/etc/passwd2"));
        assert!(!filter.matches("/tm"));
    }

    #[test]
    fn argument_filters() {
        let mut event_filters = HashMap::new();
        event_filters.insert(
            "pathname".to_string(),
            ArgFilter {
                equal: vec!["/usr/*".to_string()],
                not_equal: vec!["/usr/bin/secret".to_string()],
            },
        );
        let filters = Filters {
            args_enabled: true,
            args: HashMap::from([(EventId::OPEN, event_filters)]),
            ..Default::default()
        };
        let event = ctx(EventId::OPEN, 0);
        let with_path = |path: &str| Args::from([("pathname".to_string(), ArgValue::from(path))]);

        assert!(filters.should_process(&event, &with_path("/usr/bin/ls")));
        assert!(!filters.should_process(&event, &with_path("/usr/bin/secret")));
        assert!(!filters.should_process(&event, &with_path("/bin/ls")));
        // missing arguments are skipped
        assert!(filters.should_process(&event, &Args::new()));
    }

    #[test]
    fn numeric_arguments_use_textual_form() {
        let filters = Filters {
            args_enabled: true,
            args: HashMap::from([(
                EventId::OPEN,
                HashMap::from([(
                    "flags".to_string(),
                    ArgFilter {
                        equal: vec!["6*".to_string()],
                        not_equal: vec![],
                    },
                )]),
            )]),
            ..Default::default()
        };
        let event = ctx(EventId::OPEN, 0);
        let flags = |flags: u32| Args::from([("flags".to_string(), ArgValue::UInt32(flags))]);
        assert!(filters.should_process(&event, &flags(64)));
        assert!(!filters.should_process(&event, &flags(2)));
    }

    #[test]
    fn parse_conditions() {
        assert_eq!("=0".parse(), Ok(RetCondition::Equal(0)));
        assert_eq!("!=-1".parse(), Ok(RetCondition::NotEqual(-1)));
        assert_eq!(" >5".parse(), Ok(RetCondition::Greater(5)));
        assert_eq!("<4096".parse(), Ok(RetCondition::Less(4096)));
        assert!("5".parse::<RetCondition>().is_err());
        assert!("=abc".parse::<RetCondition>().is_err());

        assert_eq!(
            "=/tmp/*".parse(),
            Ok(ArgCondition::Equal("/tmp/*".to_string()))
        );
        assert_eq!(
            "!=ls".parse(),
            Ok(ArgCondition::NotEqual("ls".to_string()))
        );
        assert!("ls".parse::<ArgCondition>().is_err());
    }
}
