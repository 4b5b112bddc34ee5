//! Scripting subsystem configuration (`scripting.toml`).

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, ScriptingError};

/// Top-level configuration for [`crate::Scripting`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    pub python: PythonConfig,
    pub lua: LuaConfig,
    pub deferred: DeferredConfig,
}

/// Embedded Python runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Directory searched for the runtime library.
    /// `None` uses the platform loader's default search.
    pub library_dir: Option<PathBuf>,

    /// Base name of the runtime library, without platform prefix or suffix.
    pub library_name: String,

    /// Runtime home directory, for installs that ship the standard library
    /// next to the host.
    pub home: Option<PathBuf>,

    /// Host API module imported at bootstrap and injected into every script.
    pub host_module: String,

    /// Bootstrap the runtime as part of [`crate::Scripting::load`] instead of
    /// on first script creation.
    pub bootstrap_on_load: bool,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            library_dir: None,
            library_name: "python3".to_string(),
            home: None,
            host_module: "studio_host".to_string(),
            bootstrap_on_load: true,
        }
    }
}

/// Embedded Lua runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LuaConfig {
    /// Name of the host table injected into every script.
    pub host_module: String,
}

impl Default for LuaConfig {
    fn default() -> Self {
        Self {
            host_module: "studio".to_string(),
        }
    }
}

/// Deferred call queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    /// Name given to the consumer thread.
    pub thread_name: String,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            thread_name: "scripting-defer".to_string(),
        }
    }
}

impl ScriptingConfig {
    /// Parse a configuration document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|err| ScriptingError::Config(err.to_string()))
    }

    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(source) => Self::from_toml_str(&source).map_err(|err| match err {
                ScriptingError::Config(msg) => {
                    ScriptingError::Config(format!("{}: {msg}", path.display()))
                }
                other => other,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    path = %path.display(),
                    "No scripting config found; using defaults"
                );
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}
