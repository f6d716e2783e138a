//! Module configuration supplied by the application.
//!
//! The library path and flags come from the embedding application; this type
//! only gives that input one shape, readable from TOML or from the
//! environment.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ModuleError, ModuleResult};
use crate::pkcs11::ModuleOptions;

pub const ENV_LIBRARY_PATH: &str = "PKCS11_LIBRARY_PATH";
pub const ENV_USE_OS_LOCKING: &str = "PKCS11_USE_OS_LOCKING";
pub const ENV_USE_GET_FUNCTION_LIST: &str = "PKCS11_USE_GET_FUNCTION_LIST";

/// Where to find a PKCS#11 module and how to initialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Absolute path, or a name resolved through the platform library search.
    pub library_path: PathBuf,
    /// Whether the application calls the module from several threads.
    #[serde(default)]
    pub use_os_locking: bool,
    /// `false` resolves entry points by symbol instead of `C_GetFunctionList`.
    #[serde(default = "default_use_get_function_list")]
    pub use_get_function_list: bool,
}

fn default_use_get_function_list() -> bool {
    true
}

impl ModuleConfig {
    pub fn new(library_path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: library_path.into(),
            use_os_locking: false,
            use_get_function_list: default_use_get_function_list(),
        }
    }

    pub fn options(&self) -> ModuleOptions {
        ModuleOptions::new(self.use_os_locking, self.use_get_function_list)
    }

    pub fn from_toml_str(content: &str) -> ModuleResult<Self> {
        let config: Self = toml::from_str(content).map_err(ModuleError::config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ModuleResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| ModuleError::config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Reads `PKCS11_LIBRARY_PATH`, `PKCS11_USE_OS_LOCKING` and
    /// `PKCS11_USE_GET_FUNCTION_LIST` from the process environment.
    /// Returns `Ok(None)` when no library path is set.
    pub fn from_env() -> ModuleResult<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ModuleConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> ModuleResult<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(library_path) = lookup(ENV_LIBRARY_PATH).filter(|p| !p.trim().is_empty()) else {
            return Ok(None);
        };
        let mut config = Self::new(library_path.trim());
        if let Some(value) = lookup(ENV_USE_OS_LOCKING) {
            config.use_os_locking = parse_flag(ENV_USE_OS_LOCKING, &value)?;
        }
        if let Some(value) = lookup(ENV_USE_GET_FUNCTION_LIST) {
            config.use_get_function_list = parse_flag(ENV_USE_GET_FUNCTION_LIST, &value)?;
        }
        Ok(Some(config))
    }

    fn validate(&self) -> ModuleResult<()> {
        if self.library_path.as_os_str().is_empty() {
            return Err(ModuleError::config("library_path must not be empty"));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> ModuleResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ModuleError::config(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}
