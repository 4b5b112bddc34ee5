//! Python backend over an embedded CPython runtime.
//!
//! The interpreter library is bound at runtime through [`crate::binder`];
//! nothing links against CPython at build time. Every call into the
//! interpreter from host threads happens under a [`gil::GilGuard`].

#![allow(unsafe_code)]

mod ffi;
mod gil;
mod host;

use std::collections::HashMap;
use std::ffi::{CString, c_char};
use std::ptr::null_mut;
use std::sync::Arc;

use parking_lot::Mutex;

use self::ffi::{PyObject, PyPtr, PythonApi};
use self::gil::GilGuard;
use crate::config::PythonConfig;
use crate::detach::CallbackRecord;
use crate::error::ScriptingError;
use crate::script::{Script, ScriptBackend, ScriptId, ScriptLanguage, SearchPathSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    /// Bootstrap failed; not retried.
    Unavailable,
    /// Torn down by `shutdown`; not re-initialized.
    Finalized,
}

struct Handler {
    record: Arc<CallbackRecord>,
    callable: PyPtr,
}

struct LoadedModule {
    name: CString,
    module: PyPtr,
    handlers: Vec<Handler>,
}

struct PythonState {
    phase: Phase,
    /// Whether this backend initialized the interpreter (and so finalizes it).
    owns_runtime: bool,
    home: Option<String>,
    host: Option<PyPtr>,
    search_paths: SearchPathSet,
    modules: HashMap<ScriptId, LoadedModule>,
}

/// Backend for `.py` scripts.
pub struct PythonBackend {
    config: PythonConfig,
    host_name: CString,
    state: Mutex<PythonState>,
}

impl PythonBackend {
    pub fn new(config: PythonConfig) -> Self {
        let host_name = CString::new(config.host_module.as_str())
            .unwrap_or_else(|_| c"studio_host".to_owned());
        let home = config.home.as_ref().map(|home| home.to_string_lossy().into_owned());
        Self {
            config,
            host_name,
            state: Mutex::new(PythonState {
                phase: Phase::Uninitialized,
                owns_runtime: false,
                home,
                host: None,
                search_paths: SearchPathSet::new(),
                modules: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &PythonConfig {
        &self.config
    }

    /// Bootstrap with `home` as the runtime home directory, unless the
    /// runtime is already up. Returns whether the runtime is usable.
    pub fn bootstrap_with_home(&self, home: Option<&str>) -> bool {
        let mut state = self.state.lock();
        if let Some(home) = home.filter(|home| !home.is_empty()) {
            if state.phase == Phase::Uninitialized {
                state.home = Some(home.to_string());
            }
        }
        self.ensure_ready(&mut state).is_some()
    }

    fn ensure_ready(&self, state: &mut PythonState) -> Option<&'static PythonApi> {
        match state.phase {
            Phase::Ready => host::runtime().map(host::PythonRuntime::api),
            Phase::Unavailable | Phase::Finalized => None,
            Phase::Uninitialized => match self.initialize(state) {
                Ok(api) => {
                    state.phase = Phase::Ready;
                    Some(api)
                }
                Err(err) => {
                    tracing::warn!(
                        language = "Python",
                        error = %err,
                        "Failed to load Python runtime"
                    );
                    state.phase = Phase::Unavailable;
                    None
                }
            },
        }
    }

    fn initialize(&self, state: &mut PythonState) -> Result<&'static PythonApi, ScriptingError> {
        let library_dir = self
            .config
            .library_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        let runtime = host::bind(&library_dir, &self.config.library_name)?;
        let api = runtime.api();

        let bootstrap_error = |reason: &str| ScriptingError::Bootstrap {
            language: ScriptLanguage::Python,
            reason: reason.to_string(),
        };

        // SAFETY: `api` is a complete binding of the interpreter library.
        // After initialization the main thread state is released, so all
        // later work goes through `GilGuard`.
        unsafe {
            if (api.Py_IsInitialized)() == 0 {
                if let Some(home) = state.home.as_deref() {
                    set_home(api, home).map_err(|reason| bootstrap_error(&reason))?;
                }
                (api.Py_InitializeEx)(0);
                if (api.Py_IsInitialized)() == 0 {
                    return Err(bootstrap_error("interpreter did not initialize"));
                }
                (api.PyEval_SaveThread)();
                state.owns_runtime = true;
            }

            let gil = GilGuard::acquire(api);
            match self.install_host(api) {
                Ok(host) => state.host = Some(host),
                Err(reason) => {
                    drop(gil);
                    if state.owns_runtime {
                        finalize(api);
                        state.owns_runtime = false;
                    }
                    return Err(bootstrap_error(&reason));
                }
            }
        }

        tracing::info!(library = %runtime.library_path().display(), "Loaded Python runtime");
        Ok(api)
    }

    /// Create, import and wire up the host module. The GIL must be held.
    unsafe fn install_host(&self, api: &PythonApi) -> Result<PyPtr, String> {
        let name = self.config.host_module.as_str();
        // SAFETY: GIL held per the caller.
        unsafe {
            if !host::install_host_module(api, &self.host_name) {
                api.print_error();
                return Err(format!("could not create host module {name}"));
            }
            let module = (api.PyImport_ImportModule)(self.host_name.as_ptr());
            let Some(module) = PyPtr::new(module) else {
                api.print_error();
                return Err(format!("error importing {name}"));
            };
            if !host::run_source(api, "__studio_bootstrap__", &host::stream_redirect_source(name)) {
                (api.Py_DecRef)(module.as_ptr());
                return Err("output redirect failed".to_string());
            }
            Ok(module)
        }
    }

    /// Import `script` and inject the host surface. The GIL must be held.
    unsafe fn import_module(
        &self,
        api: &PythonApi,
        host: PyPtr,
        script: &Script,
    ) -> Option<LoadedModule> {
        let name = CString::new(script.file()).ok()?;
        // SAFETY: GIL held per the caller.
        unsafe {
            let name_obj = (api.PyUnicode_FromString)(name.as_ptr());
            if name_obj.is_null() {
                api.print_error();
                return None;
            }
            let module = (api.PyImport_Import)(name_obj);
            (api.Py_DecRef)(name_obj);
            let Some(module) = PyPtr::new(module) else {
                api.print_error();
                return None;
            };

            let mut loaded = LoadedModule {
                name,
                module,
                handlers: Vec::new(),
            };
            let injected = inject_surface(api, module, host, &self.host_name, script.dir())
                && call_hook(api, module, c"script_load").is_ok();
            claim_pending(&mut loaded, script);

            if injected {
                Some(loaded)
            } else {
                release_module(api, loaded);
                None
            }
        }
    }
}

/// Point the runtime at its home directory before initialization.
unsafe fn set_home(api: &PythonApi, home: &str) -> Result<(), String> {
    let home_c = CString::new(home).map_err(|_| format!("invalid home path {home}"))?;
    // SAFETY: pre-initialization calls permitted by the runtime. The decoded
    // string must outlive the interpreter, so it is never freed.
    unsafe {
        let wide = (api.Py_DecodeLocale)(home_c.as_ptr(), null_mut());
        if wide.is_null() {
            return Err(format!("could not decode home path {home}"));
        }
        (api.Py_SetPythonHome)(wide);
    }
    Ok(())
}

/// Take the lock without releasing it afterwards and finalize.
unsafe fn finalize(api: &PythonApi) {
    // SAFETY: the interpreter is initialized; the lock state dies with it.
    unsafe {
        (api.PyGILState_Ensure)();
        if (api.Py_FinalizeEx)() != 0 {
            tracing::warn!(language = "Python", "Python runtime reported errors while finalizing");
        }
    }
}

unsafe fn set_attr(
    api: &PythonApi,
    target: PyPtr,
    name: *const c_char,
    value: *mut PyObject,
) -> bool {
    // SAFETY: GIL held per the caller.
    unsafe { !value.is_null() && (api.PyObject_SetAttrString)(target.as_ptr(), name, value) == 0 }
}

unsafe fn inject_surface(
    api: &PythonApi,
    module: PyPtr,
    host: PyPtr,
    host_name: &CString,
    dir: &str,
) -> bool {
    // SAFETY: GIL held per the caller.
    unsafe {
        if !set_attr(api, module, host_name.as_ptr(), host.as_ptr()) {
            api.print_error();
            return false;
        }
        let dir = api.new_string(dir);
        let ok = set_attr(api, module, c"__script_dir__".as_ptr(), dir);
        api.xdecref(dir);
        if !ok || !host::add_script_functions(api, module) {
            api.print_error();
            return false;
        }
    }
    true
}

/// Call `module.<name>()` if the script defines it. Errors raised by the
/// hook are reported and returned.
unsafe fn call_hook(api: &PythonApi, module: PyPtr, name: &std::ffi::CStr) -> Result<bool, ()> {
    // SAFETY: GIL held per the caller.
    unsafe {
        if (api.PyObject_HasAttrString)(module.as_ptr(), name.as_ptr()) == 0 {
            return Ok(false);
        }
        let func = (api.PyObject_GetAttrString)(module.as_ptr(), name.as_ptr());
        if func.is_null() {
            api.print_error();
            return Err(());
        }
        if (api.PyCallable_Check)(func) == 0 {
            (api.Py_DecRef)(func);
            return Ok(false);
        }
        let result = (api.PyObject_CallObject)(func, null_mut());
        (api.Py_DecRef)(func);
        if result.is_null() {
            api.print_error();
            return Err(());
        }
        (api.Py_DecRef)(result);
    }
    Ok(true)
}

/// Move callbacks the module registered through `on()` into its handler list.
fn claim_pending(loaded: &mut LoadedModule, script: &Script) {
    let Some(runtime) = host::runtime() else {
        return;
    };
    for (event, callable) in runtime.take_pending(loaded.module) {
        let record = CallbackRecord::new(event, script.path(), ScriptLanguage::Python);
        tracing::trace!(
            script = script.path(),
            event = record.event(),
            "Registered Python callback"
        );
        loaded.handlers.push(Handler { record, callable });
    }
}

/// Drop every reference the backend holds for a module and forget it in
/// `sys.modules`, so the next import executes the file afresh.
unsafe fn release_module(api: &PythonApi, loaded: LoadedModule) -> Vec<Arc<CallbackRecord>> {
    // SAFETY: GIL held per the caller.
    unsafe {
        let modules = (api.PyImport_GetModuleDict)();
        if !modules.is_null() && (api.PyDict_DelItemString)(modules, loaded.name.as_ptr()) != 0 {
            (api.PyErr_Clear)();
        }
        let mut records = Vec::with_capacity(loaded.handlers.len());
        for handler in loaded.handlers {
            (api.Py_DecRef)(handler.callable.as_ptr());
            records.push(handler.record);
        }
        (api.Py_DecRef)(loaded.module.as_ptr());
        records
    }
}

impl ScriptBackend for PythonBackend {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Python
    }

    fn bootstrap(&self) -> bool {
        let mut state = self.state.lock();
        self.ensure_ready(&mut state).is_some()
    }

    fn is_ready(&self) -> bool {
        self.state.lock().phase == Phase::Ready
    }

    fn add_search_path(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return false;
        }
        let mut state = self.state.lock();
        if state.search_paths.contains(dir) {
            return false;
        }
        let Some(api) = self.ensure_ready(&mut state) else {
            return false;
        };

        // SAFETY: the runtime is ready; `sys.path` is a borrowed reference.
        let appended = unsafe {
            let _gil = GilGuard::acquire(api);
            let sys_path = (api.PySys_GetObject)(c"path".as_ptr());
            let entry = api.new_string(dir);
            let ok = !sys_path.is_null()
                && !entry.is_null()
                && (api.PyList_Append)(sys_path, entry) == 0;
            api.xdecref(entry);
            if !ok {
                api.print_error();
            }
            ok
        };

        if appended {
            state.search_paths.insert(dir);
        }
        appended
    }

    fn search_path(&self) -> Vec<String> {
        let state = self.state.lock();
        if state.phase != Phase::Ready {
            return Vec::new();
        }
        let Some(api) = host::runtime().map(host::PythonRuntime::api) else {
            return Vec::new();
        };

        // SAFETY: the runtime is ready; list items are borrowed references.
        unsafe {
            let _gil = GilGuard::acquire(api);
            let sys_path = (api.PySys_GetObject)(c"path".as_ptr());
            if sys_path.is_null() {
                return Vec::new();
            }
            let len = (api.PyList_Size)(sys_path);
            if len < 0 {
                api.print_error();
                return Vec::new();
            }
            (0..len)
                .filter_map(|index| {
                    let item = (api.PyList_GetItem)(sys_path, index);
                    if item.is_null() {
                        (api.PyErr_Clear)();
                        return None;
                    }
                    api.string(item)
                })
                .collect()
        }
    }

    fn import_script(&self, script: &Script) -> bool {
        let mut state = self.state.lock();
        let Some(api) = self.ensure_ready(&mut state) else {
            tracing::warn!(script = script.path(), "Python runtime is unavailable");
            return false;
        };
        let Some(host) = state.host else {
            return false;
        };

        // SAFETY: the runtime is ready.
        let loaded = unsafe {
            let _gil = GilGuard::acquire(api);
            self.import_module(api, host, script)
        };

        match loaded {
            Some(loaded) => {
                tracing::debug!(
                    script = script.path(),
                    callbacks = loaded.handlers.len(),
                    "Loaded Python script"
                );
                state.modules.insert(script.id(), loaded);
                true
            }
            None => {
                tracing::warn!(script = script.path(), "Failed to load Python script");
                false
            }
        }
    }

    fn release_script(&self, script: &Script) -> Vec<Arc<CallbackRecord>> {
        let mut state = self.state.lock();
        let Some(mut loaded) = state.modules.remove(&script.id()) else {
            return Vec::new();
        };
        let Some(api) = self.ensure_ready(&mut state) else {
            return loaded.handlers.into_iter().map(|handler| handler.record).collect();
        };

        // SAFETY: the runtime is ready; the module reference is owned.
        unsafe {
            let _gil = GilGuard::acquire(api);
            claim_pending(&mut loaded, script);
            if call_hook(api, loaded.module, c"script_unload").is_err() {
                tracing::warn!(script = script.path(), "Python script unload hook failed");
            }
            claim_pending(&mut loaded, script);
            release_module(api, loaded)
        }
    }

    fn emit(&self, script: &Script, event: &str, payload: &str) -> usize {
        let mut state = self.state.lock();
        if state.phase != Phase::Ready {
            return 0;
        }
        let Some(api) = host::runtime().map(host::PythonRuntime::api) else {
            return 0;
        };
        let Some(loaded) = state.modules.get_mut(&script.id()) else {
            return 0;
        };

        // SAFETY: the runtime is ready; handler references are owned by the
        // module record and outlive the calls.
        unsafe {
            let _gil = GilGuard::acquire(api);
            claim_pending(loaded, script);

            let mut ran = 0;
            for handler in &loaded.handlers {
                if handler.record.event() != event {
                    continue;
                }
                let Some(_call) = handler.record.enter() else {
                    continue;
                };
                let args = (api.PyTuple_New)(1);
                let value = api.new_string(payload);
                if args.is_null() || value.is_null() {
                    api.xdecref(value);
                    api.xdecref(args);
                    api.print_error();
                    continue;
                }
                (api.PyTuple_SetItem)(args, 0, value);
                let result = (api.PyObject_CallObject)(handler.callable.as_ptr(), args);
                (api.Py_DecRef)(args);
                if result.is_null() {
                    api.print_error();
                } else {
                    (api.Py_DecRef)(result);
                }
                ran += 1;
            }
            ran
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.search_paths.clear();

        let phase = state.phase;
        match phase {
            Phase::Ready => {
                if let Some(api) = host::runtime().map(host::PythonRuntime::api) {
                    // SAFETY: the runtime is ready; every reference released
                    // here is owned by the backend.
                    unsafe {
                        let gil = GilGuard::acquire(api);
                        let leftover = state.modules.len();
                        if leftover > 0 {
                            tracing::warn!(
                                count = leftover,
                                "Python scripts still loaded at shutdown"
                            );
                        }
                        for (_, loaded) in state.modules.drain() {
                            release_module(api, loaded);
                        }
                        if let Some(runtime) = host::runtime() {
                            runtime.clear_pending();
                        }
                        if let Some(host) = state.host.take() {
                            (api.Py_DecRef)(host.as_ptr());
                        }
                        drop(gil);

                        if state.owns_runtime && (api.Py_IsInitialized)() != 0 {
                            finalize(api);
                        }
                    }
                }
                state.owns_runtime = false;
                state.phase = Phase::Finalized;
                tracing::debug!("Python runtime finalized");
            }
            Phase::Uninitialized => state.phase = Phase::Finalized,
            Phase::Unavailable | Phase::Finalized => {}
        }
    }
}

impl std::fmt::Debug for PythonBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PythonBackend")
            .field("phase", &state.phase)
            .field("scripts", &state.modules.len())
            .finish_non_exhaustive()
    }
}
