//! Lua backend over an embedded `mlua` state.
//!
//! All scripts share one Lua state. Each script runs in its own environment
//! table that falls back to the shared globals, so scripts see the standard
//! library but do not clobber each other's top-level names.

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Function, Lua, RegistryKey, Table, Value, Variadic};
use parking_lot::Mutex;

use crate::config::LuaConfig;
use crate::detach::CallbackRecord;
use crate::log_level;
use crate::script::{Script, ScriptBackend, ScriptId, ScriptLanguage, SearchPathSet};

type Handlers = Arc<Mutex<Vec<(Arc<CallbackRecord>, RegistryKey)>>>;

struct LuaScript {
    env: RegistryKey,
    handlers: Handlers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    Unavailable,
}

struct LuaState {
    phase: Phase,
    lua: Option<Lua>,
    host: Option<RegistryKey>,
    search_paths: SearchPathSet,
    scripts: HashMap<ScriptId, LuaScript>,
}

/// Backend for `.lua` scripts.
pub struct LuaBackend {
    config: LuaConfig,
    state: Mutex<LuaState>,
}

impl LuaBackend {
    pub fn new(config: LuaConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LuaState {
                phase: Phase::Uninitialized,
                lua: None,
                host: None,
                search_paths: SearchPathSet::new(),
                scripts: HashMap::new(),
            }),
        }
    }

    fn ensure_ready(&self, state: &mut LuaState) -> bool {
        match state.phase {
            Phase::Ready => true,
            Phase::Unavailable => false,
            Phase::Uninitialized => {
                let lua = Lua::new();
                match install_host(&lua) {
                    Ok(host) => {
                        state.host = Some(host);
                        state.lua = Some(lua);
                        state.phase = Phase::Ready;
                        tracing::debug!(
                            host_module = %self.config.host_module,
                            "Lua runtime ready"
                        );
                        true
                    }
                    Err(err) => {
                        tracing::warn!(
                            language = "Lua",
                            error = %err,
                            "Failed to initialize Lua runtime"
                        );
                        state.phase = Phase::Unavailable;
                        false
                    }
                }
            }
        }
    }

    fn run_script(
        &self,
        lua: &Lua,
        host: &RegistryKey,
        script: &Script,
    ) -> mlua::Result<LuaScript> {
        let source = std::fs::read_to_string(script.path()).map_err(mlua::Error::external)?;
        let handlers: Handlers = Arc::default();

        let env = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.set("__index", lua.globals())?;
        env.set_metatable(Some(meta));

        env.set(self.config.host_module.as_str(), lua.registry_value::<Table>(host)?)?;
        env.set(crate::SCRIPT_DIR_CONSTANT, script.dir())?;

        let dir = script.dir().to_string();
        env.set(
            "get_script_path",
            lua.create_function(move |_, ()| Ok(dir.clone()))?,
        )?;

        let owner = script.path().to_string();
        let registered = Arc::clone(&handlers);
        env.set(
            "on",
            lua.create_function(move |lua, (event, handler): (String, Function)| {
                let key = lua.create_registry_value(handler.clone())?;
                let record = CallbackRecord::new(event, owner.as_str(), ScriptLanguage::Lua);
                registered.lock().push((record, key));
                Ok(handler)
            })?,
        )?;

        lua.load(source.trim_start_matches('\u{FEFF}'))
            .set_name(format!("@{}", script.path()))
            .set_environment(env.clone())
            .exec()?;

        if let Value::Function(hook) = env.get::<_, Value>(crate::LOAD_HOOK)? {
            hook.call::<_, ()>(())?;
        }

        Ok(LuaScript {
            env: lua.create_registry_value(env)?,
            handlers,
        })
    }
}

/// Build the host table and route `print` to the host log. Returns the
/// registry handle of the host table.
fn install_host(lua: &Lua) -> mlua::Result<RegistryKey> {
    let host = lua.create_table()?;
    host.set(
        "log",
        lua.create_function(|_, (level, message): (i64, String)| {
            crate::script_log(level, "lua", &message);
            Ok(())
        })?,
    )?;
    host.set("LOG_ERROR", log_level::ERROR)?;
    host.set("LOG_WARNING", log_level::WARNING)?;
    host.set("LOG_INFO", log_level::INFO)?;
    host.set("LOG_DEBUG", log_level::DEBUG)?;

    let print = lua.create_function(|lua, args: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut line = String::new();
        for (index, value) in args.into_iter().enumerate() {
            if index > 0 {
                line.push('\t');
            }
            line.push_str(&tostring.call::<_, String>(value)?);
        }
        crate::script_log(log_level::INFO, "lua", &line);
        Ok(())
    })?;
    lua.globals().set("print", print)?;

    lua.create_registry_value(host)
}

fn release(lua: &Lua, script: LuaScript) -> Vec<Arc<CallbackRecord>> {
    let handlers = std::mem::take(&mut *script.handlers.lock());
    let mut records = Vec::with_capacity(handlers.len());
    for (record, key) in handlers {
        if let Err(err) = lua.remove_registry_value(key) {
            tracing::debug!(error = %err, "Failed to release Lua callback");
        }
        records.push(record);
    }
    if let Err(err) = lua.remove_registry_value(script.env) {
        tracing::debug!(error = %err, "Failed to release Lua script environment");
    }
    records
}

impl ScriptBackend for LuaBackend {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Lua
    }

    fn bootstrap(&self) -> bool {
        let mut state = self.state.lock();
        self.ensure_ready(&mut state)
    }

    fn is_ready(&self) -> bool {
        self.state.lock().phase == Phase::Ready
    }

    fn add_search_path(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return false;
        }
        let mut state = self.state.lock();
        if state.search_paths.contains(dir) || !self.ensure_ready(&mut state) {
            return false;
        }
        let Some(lua) = state.lua.as_ref() else {
            return false;
        };

        let appended = (|| -> mlua::Result<()> {
            let package: Table = lua.globals().get("package")?;
            let current: String = package.get("path")?;
            package.set("path", format!("{current};{dir}?.lua"))
        })();

        match appended {
            Ok(()) => state.search_paths.insert(dir),
            Err(err) => {
                tracing::warn!(path = dir, error = %err, "Failed to extend Lua package.path");
                false
            }
        }
    }

    fn search_path(&self) -> Vec<String> {
        let state = self.state.lock();
        let Some(lua) = state.lua.as_ref() else {
            return Vec::new();
        };
        let path = lua
            .globals()
            .get::<_, Table>("package")
            .and_then(|package| package.get::<_, String>("path"));
        match path {
            Ok(path) => path
                .split(';')
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn import_script(&self, script: &Script) -> bool {
        let mut state = self.state.lock();
        if !self.ensure_ready(&mut state) {
            tracing::warn!(script = script.path(), "Lua runtime is unavailable");
            return false;
        }
        let (Some(lua), Some(host)) = (state.lua.as_ref(), state.host.as_ref()) else {
            return false;
        };

        match self.run_script(lua, host, script) {
            Ok(loaded) => {
                state.scripts.insert(script.id(), loaded);
                tracing::debug!(script = script.path(), "Loaded Lua script");
                true
            }
            Err(err) => {
                tracing::warn!(script = script.path(), error = %err, "Failed to load Lua script");
                lua.expire_registry_values();
                false
            }
        }
    }

    fn release_script(&self, script: &Script) -> Vec<Arc<CallbackRecord>> {
        let mut state = self.state.lock();
        let Some(loaded) = state.scripts.remove(&script.id()) else {
            return Vec::new();
        };
        let Some(lua) = state.lua.as_ref() else {
            return std::mem::take(&mut *loaded.handlers.lock())
                .into_iter()
                .map(|(record, _)| record)
                .collect();
        };

        let hook = lua
            .registry_value::<Table>(&loaded.env)
            .and_then(|env| env.get::<_, Value>(crate::UNLOAD_HOOK));
        match hook {
            Ok(Value::Function(hook)) => {
                if let Err(err) = hook.call::<_, ()>(()) {
                    tracing::warn!(
                        script = script.path(),
                        error = %err,
                        "Lua script unload hook failed"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(script = script.path(), error = %err, "Lua script environment lost");
            }
        }

        let records = release(lua, loaded);
        lua.expire_registry_values();
        records
    }

    fn emit(&self, script: &Script, event: &str, payload: &str) -> usize {
        let state = self.state.lock();
        let (Some(lua), Some(loaded)) = (state.lua.as_ref(), state.scripts.get(&script.id())) else {
            return 0;
        };

        // Snapshot first: a callback may register more callbacks.
        let targets: Vec<_> = loaded
            .handlers
            .lock()
            .iter()
            .filter(|(record, _)| record.event() == event)
            .filter_map(|(record, key)| {
                let guard = record.enter()?;
                let handler = lua.registry_value::<Function>(key).ok()?;
                Some((guard, handler))
            })
            .collect();

        let mut ran = 0;
        for (guard, handler) in targets {
            if let Err(err) = handler.call::<_, ()>(payload) {
                tracing::warn!(
                    script = script.path(),
                    event = guard.event(),
                    error = %err,
                    "Lua callback failed"
                );
            }
            ran += 1;
        }
        ran
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.search_paths.clear();
        if !state.scripts.is_empty() {
            tracing::warn!(count = state.scripts.len(), "Lua scripts still loaded at shutdown");
        }
        let scripts: Vec<_> = state.scripts.drain().map(|(_, script)| script).collect();
        if let Some(lua) = state.lua.as_ref() {
            for script in scripts {
                release(lua, script);
            }
        }
        state.host = None;
        state.lua = None;
        // The next bootstrap builds a fresh state.
        if state.phase == Phase::Ready {
            state.phase = Phase::Uninitialized;
        }
    }
}

impl std::fmt::Debug for LuaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LuaBackend")
            .field("phase", &state.phase)
            .field("scripts", &state.scripts.len())
            .finish_non_exhaustive()
    }
}
