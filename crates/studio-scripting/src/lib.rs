//! Scripting host bridge for the studio application.
//!
//! This crate hosts externally supplied scripting runtimes (Lua, Python)
//! inside a long-lived multi-threaded host. It provides:
//!
//! - `binder`: runtime resolution of a foreign library's entry points into a
//!   typed table, all-or-nothing
//! - `deferred`: a single-consumer FIFO of deferred calls on a dedicated thread
//! - `detach`: bookkeeping for callback records removed from live scripts
//! - `script`: the `Script` record and the per-language `ScriptBackend` trait
//! - `lua` / `python`: the language backends (feature-gated)
//! - `subsystem`: the [`Scripting`] façade that owns all of the above
//!
//! # Usage
//!
//! ```ignore
//! use studio_scripting::{Scripting, ScriptingConfig};
//!
//! let mut scripting = Scripting::new(ScriptingConfig::default());
//! scripting.load()?;
//! if let Some(script) = scripting.create_script("/scripts/intro.lua") {
//!     scripting.emit(&script, "tick", "0.016");
//!     scripting.destroy_script(script);
//! }
//! scripting.unload();
//! ```

pub mod binder;
pub mod config;
pub mod deferred;
pub mod detach;
pub mod error;
#[cfg(feature = "lua")]
pub mod lua;
#[cfg(feature = "python")]
pub mod python;
pub mod script;
pub mod subsystem;

pub use config::{DeferredConfig, LuaConfig, PythonConfig, ScriptingConfig};
pub use deferred::{DeferredCall, DeferredQueue, DeferredSender};
pub use detach::{CallbackGuard, CallbackId, CallbackRecord, DetachedCallbacks};
pub use error::{BindError, Result, ScriptingError};
#[cfg(feature = "lua")]
pub use lua::LuaBackend;
#[cfg(feature = "python")]
pub use python::PythonBackend;
pub use script::{
    Script, ScriptBackend, ScriptId, ScriptLanguage, ScriptPath, ScriptState, SearchPathSet,
};
pub use subsystem::Scripting;

/// Name of the optional function a script may define to run once its
/// host surface has been injected.
pub const LOAD_HOOK: &str = "script_load";

/// Name of the optional function a script may define to run at unload.
pub const UNLOAD_HOOK: &str = "script_unload";

/// Name of the constant injected into every script holding its directory.
pub const SCRIPT_DIR_CONSTANT: &str = "__script_dir__";

/// Host log levels shared by every backend's logging surface.
pub mod log_level {
    pub const ERROR: i64 = 100;
    pub const WARNING: i64 = 200;
    pub const INFO: i64 = 300;
    pub const DEBUG: i64 = 400;
}

/// Forward one line of script output to the host log.
pub(crate) fn script_log(level: i64, script: &str, message: &str) {
    let message = message.trim_end_matches(['\r', '\n']);
    if message.is_empty() {
        return;
    }
    match level {
        l if l <= log_level::ERROR => tracing::error!(target: "script", script, "{message}"),
        l if l <= log_level::WARNING => tracing::warn!(target: "script", script, "{message}"),
        l if l <= log_level::INFO => tracing::info!(target: "script", script, "{message}"),
        _ => tracing::debug!(target: "script", script, "{message}"),
    }
}
