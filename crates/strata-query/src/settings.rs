//! Section-based driver settings.
//!
//! Store settings live in sections named after the store kind (`mysql`,
//! `redis`, `mongodb`, ...) or after a named instance of it. A key is
//! looked up in the instance section first, then in `<base>_<section>`,
//! then in the base section itself:
//!
//! ```toml
//! [redis]
//! host = "10.0.0.1"
//! port = 6379
//!
//! [redis_cache]
//! db = 2
//! ```
//!
//! Here `value("redis", "cache", "host")` yields `10.0.0.1`.

use crate::error::{DataError, Result};
use ::config::{Config, Environment, File, FileFormat};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "STRATA";

/// `STRATA_REDIS__HOST` overrides `host` in `[redis]`
fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    inner: Config,
}

impl DriverSettings {
    pub fn from_config(inner: Config) -> Self {
        Self { inner }
    }

    /// Parse TOML text, with `STRATA_<SECTION>__<KEY>` environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let inner = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(env_source())
            .build()?;
        Ok(Self { inner })
    }

    /// Load a settings file (format by extension), with
    /// `STRATA_<SECTION>__<KEY>` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading driver settings from {}", path.display());
        let inner = Config::builder()
            .add_source(File::from(path))
            .add_source(env_source())
            .build()?;
        Ok(Self { inner })
    }

    fn lookup(&self, section: &str, key: &str) -> Option<String> {
        self.inner
            .get_string(&format!("{}.{}", section, key))
            .ok()
            .filter(|v| !v.is_empty())
    }

    /// Resolve `key` for `section` with base-section fallback.
    ///
    /// An empty `section` means `base`. Empty values count as missing.
    pub fn value(&self, base: &str, section: &str, key: &str) -> Option<String> {
        let section = if section.is_empty() { base } else { section };
        if let Some(v) = self.lookup(section, key) {
            return Some(v);
        }
        if section == base {
            return None;
        }
        let prefix = format!("{}_", base);
        if !section.starts_with(&prefix) {
            if let Some(v) = self.lookup(&format!("{}{}", prefix, section), key) {
                return Some(v);
            }
        }
        self.lookup(base, key)
    }

    pub fn value_or(&self, base: &str, section: &str, key: &str, default: &str) -> String {
        self.value(base, section, key)
            .unwrap_or_else(|| default.to_string())
    }

    /// Like [`value`](Self::value) but a missing key is an error
    pub fn require(&self, base: &str, section: &str, key: &str) -> Result<String> {
        self.value(base, section, key).ok_or_else(|| {
            DataError::invalid_configuration(format!(
                "config section [{}] missing key {}",
                if section.is_empty() { base } else { section },
                key
            ))
        })
    }

    /// Parse the resolved value; a value that does not parse is an error
    pub fn parsed<T>(&self, base: &str, section: &str, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let looked_up = if section.is_empty() { base } else { section };
        match self.value(base, section, key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| {
                DataError::invalid_configuration(format!(
                    "config section [{}] key {}: {}",
                    looked_up, key, e
                ))
            }),
        }
    }
}

/// Connect, read and write timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(3),
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
        }
    }
}

/// Parse `"10s, 1000ms, 2s"` into connect/read/write timeouts.
///
/// Entries use the `humantime` grammar (`1500ms`, `2s`, `1m 30s`).
/// Missing, unparsable and zero entries keep the value from `defaults`.
pub fn parse_timeouts(spec: &str, defaults: Timeouts) -> Timeouts {
    let mut timeouts = defaults;
    for (i, part) in spec.split(',').enumerate() {
        let d = match humantime::parse_duration(part.trim()) {
            Ok(d) if !d.is_zero() => d,
            Ok(_) => continue,
            Err(e) => {
                if !part.trim().is_empty() {
                    debug!("ignoring timeout entry {:?}: {}", part.trim(), e);
                }
                continue;
            }
        };
        match i {
            0 => timeouts.connect = d,
            1 => timeouts.read = d,
            2 => timeouts.write = d,
            _ => break,
        }
    }
    timeouts
}
