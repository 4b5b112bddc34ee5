//! Error types for studio-scripting

use std::path::PathBuf;
use thiserror::Error;

use crate::script::ScriptLanguage;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, ScriptingError>;

/// Failure to bind a runtime library's entry points.
#[derive(Error, Debug)]
pub enum BindError {
    /// The shared library could not be opened
    #[error("could not load library {path}: {source}")]
    LibraryOpen {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// A required entry point is missing from the library
    #[error("failed to import symbol {symbol} from {library}")]
    MissingSymbol { symbol: &'static str, library: String },
}

impl BindError {
    /// Name of the missing symbol, when that is the cause.
    pub fn missing_symbol(&self) -> Option<&'static str> {
        match self {
            Self::MissingSymbol { symbol, .. } => Some(symbol),
            Self::LibraryOpen { .. } => None,
        }
    }
}

/// Main error type for studio-scripting
#[derive(Error, Debug)]
pub enum ScriptingError {
    /// Runtime binding errors
    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    /// Deferred-call thread could not be started
    #[error("failed to spawn deferred call thread: {0}")]
    Thread(#[source] std::io::Error),

    /// Subsystem was already loaded
    #[error("scripting subsystem is already loaded")]
    AlreadyLoaded,

    /// Runtime bootstrap step failed
    #[error("{language} bootstrap failed: {reason}")]
    Bootstrap {
        language: ScriptLanguage,
        reason: String,
    },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_symbol_names_the_symbol() {
        let err = BindError::MissingSymbol {
            symbol: "Py_InitializeEx",
            library: "libpython3.so".to_string(),
        };
        assert_eq!(err.missing_symbol(), Some("Py_InitializeEx"));
        assert_eq!(
            err.to_string(),
            "failed to import symbol Py_InitializeEx from libpython3.so"
        );
    }

    #[test]
    fn bind_error_converts_into_scripting_error() {
        let err: ScriptingError = BindError::MissingSymbol {
            symbol: "PyErr_Print",
            library: "stub".to_string(),
        }
        .into();
        assert!(matches!(err, ScriptingError::Bind(_)));
        assert!(err.to_string().contains("PyErr_Print"));
    }

    #[test]
    fn bootstrap_error_names_language_and_reason() {
        let err = ScriptingError::Bootstrap {
            language: ScriptLanguage::Python,
            reason: "interpreter did not initialize".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Python bootstrap failed: interpreter did not initialize"
        );
    }
}
