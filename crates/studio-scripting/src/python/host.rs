//! Process-wide interpreter binding and the native functions scripts call.
//!
//! The C trampolines receive no context besides their `self` object, so the
//! bound API table and the queue of callbacks registered through `on()` live
//! here, next to them, for the life of the process.

use std::ffi::{CStr, CString, c_char, c_int};
use std::ptr::{null, null_mut};
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::ffi::{METH_NOARGS, METH_VARARGS, MethodDefs, PyMethodDef, PyObject, PyPtr, PythonApi};
use crate::binder::{BoundLibrary, bind_runtime};
use crate::error::BindError;
use crate::log_level;

/// A callback registered by a script, not yet claimed by the backend.
struct PendingCallback {
    module: usize,
    event: String,
    handler: PyPtr,
}

pub(crate) struct PythonRuntime {
    library: BoundLibrary<PythonApi>,
    pending: Mutex<Vec<PendingCallback>>,
}

impl PythonRuntime {
    pub(crate) fn api(&self) -> &PythonApi {
        &self.library
    }

    pub(crate) fn library_path(&self) -> &std::path::Path {
        self.library.path()
    }

    /// Claim the callbacks `module` registered since the last call.
    pub(crate) fn take_pending(&self, module: PyPtr) -> Vec<(String, PyPtr)> {
        let mut pending = self.pending.lock();
        let mut claimed = Vec::new();
        pending.retain_mut(|entry| {
            if entry.module == module.addr() {
                claimed.push((std::mem::take(&mut entry.event), entry.handler));
                false
            } else {
                true
            }
        });
        claimed
    }

    /// Release every unclaimed handler.
    ///
    /// # Safety
    ///
    /// The GIL must be held.
    pub(crate) unsafe fn clear_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        for entry in &pending {
            // SAFETY: the GIL is held; the entry owns one reference.
            unsafe { (self.api().Py_DecRef)(entry.handler.as_ptr()) };
        }
        pending.len()
    }
}

static RUNTIME: OnceLock<PythonRuntime> = OnceLock::new();

pub(crate) fn runtime() -> Option<&'static PythonRuntime> {
    RUNTIME.get()
}

/// Bind the interpreter library once per process. Later calls return the
/// existing binding regardless of arguments.
pub(crate) fn bind(
    library_dir: &str,
    library_name: &str,
) -> Result<&'static PythonRuntime, BindError> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    // SAFETY: the configured library is a CPython runtime whose exports
    // follow the C API declared by `PythonApi`.
    let library = unsafe { bind_runtime::<PythonApi>(library_dir, library_name) }?;
    Ok(RUNTIME.get_or_init(|| PythonRuntime {
        library,
        pending: Mutex::new(Vec::new()),
    }))
}

fn api() -> Option<&'static PythonApi> {
    runtime().map(PythonRuntime::api)
}

// ===== Native functions =====

unsafe extern "C" fn host_log(_module: *mut PyObject, args: *mut PyObject) -> *mut PyObject {
    let Some(api) = api() else {
        return null_mut();
    };
    let mut level: c_int = 0;
    let mut message: *const c_char = null();
    // SAFETY: called by the interpreter with the GIL held; the format
    // matches the out-pointers passed.
    unsafe {
        if (api.PyArg_ParseTuple)(args, c"is:log".as_ptr(), &raw mut level, &raw mut message) == 0 {
            return null_mut();
        }
        let message = CStr::from_ptr(message).to_string_lossy();
        crate::script_log(i64::from(level), "python", &message);
        api.none()
    }
}

unsafe extern "C" fn script_dir(module: *mut PyObject, _args: *mut PyObject) -> *mut PyObject {
    let Some(api) = api() else {
        return null_mut();
    };
    // SAFETY: GIL held; `module` is the script module the function is bound to.
    unsafe { (api.PyObject_GetAttrString)(module, c"__script_dir__".as_ptr()) }
}

unsafe extern "C" fn register_callback(
    module: *mut PyObject,
    args: *mut PyObject,
) -> *mut PyObject {
    let Some(runtime) = runtime() else {
        return null_mut();
    };
    let api = runtime.api();
    let mut event: *const c_char = null();
    let mut handler: *mut PyObject = null_mut();
    // SAFETY: GIL held; the format matches the out-pointers passed. The
    // handler reference is borrowed from `args` until increfed below.
    unsafe {
        if (api.PyArg_ParseTuple)(args, c"sO:on".as_ptr(), &raw mut event, &raw mut handler) == 0 {
            return null_mut();
        }
        if (api.PyCallable_Check)(handler) == 0 {
            (api.PyErr_SetString)(*api.PyExc_TypeError, c"on() handler must be callable".as_ptr());
            return null_mut();
        }
        let Some(handler_ptr) = PyPtr::new(handler) else {
            return null_mut();
        };
        let event = CStr::from_ptr(event).to_string_lossy().into_owned();

        // One reference for the registration, one returned to the caller.
        (api.Py_IncRef)(handler);
        (api.Py_IncRef)(handler);
        runtime.pending.lock().push(PendingCallback {
            module: module as usize,
            event,
            handler: handler_ptr,
        });
        handler
    }
}

static HOST_METHODS: MethodDefs<1> = MethodDefs([PyMethodDef {
    ml_name: c"log".as_ptr(),
    ml_meth: Some(host_log),
    ml_flags: METH_VARARGS,
    ml_doc: c"log(level, message): write a line to the host log".as_ptr(),
}]);

static SCRIPT_METHODS: MethodDefs<2> = MethodDefs([
    PyMethodDef {
        ml_name: c"get_script_path".as_ptr(),
        ml_meth: Some(script_dir),
        ml_flags: METH_NOARGS,
        ml_doc: c"Gets the script path".as_ptr(),
    },
    PyMethodDef {
        ml_name: c"on".as_ptr(),
        ml_meth: Some(register_callback),
        ml_flags: METH_VARARGS,
        ml_doc: c"on(event, fn): call fn(payload) whenever the host fires event".as_ptr(),
    },
]);

// ===== Module setup =====

unsafe fn add_functions(
    api: &PythonApi,
    target: *mut PyObject,
    defs: impl Iterator<Item = *mut PyMethodDef>,
    bind_self: bool,
) -> bool {
    for def in defs {
        // SAFETY: GIL held; `def` points into a static table.
        unsafe {
            let owner = if bind_self { target } else { null_mut() };
            let func = (api.PyCFunction_NewEx)(def, owner, null_mut());
            if func.is_null() {
                return false;
            }
            let status = (api.PyObject_SetAttrString)(target, (*def).ml_name, func);
            (api.Py_DecRef)(func);
            if status != 0 {
                return false;
            }
        }
    }
    true
}

/// Create the native host module and register it in `sys.modules`.
///
/// # Safety
///
/// The GIL must be held.
pub(crate) unsafe fn install_host_module(api: &PythonApi, name: &CStr) -> bool {
    // SAFETY: GIL held per the caller.
    unsafe {
        let module = (api.PyModule_New)(name.as_ptr());
        if module.is_null() {
            return false;
        }

        let mut ok = add_functions(api, module, HOST_METHODS.iter(), false);
        let constants = [
            (c"LOG_ERROR", log_level::ERROR),
            (c"LOG_WARNING", log_level::WARNING),
            (c"LOG_INFO", log_level::INFO),
            (c"LOG_DEBUG", log_level::DEBUG),
        ];
        for (constant, value) in constants {
            if !ok {
                break;
            }
            let value = (api.PyLong_FromLongLong)(value);
            ok = !value.is_null()
                && (api.PyObject_SetAttrString)(module, constant.as_ptr(), value) == 0;
            api.xdecref(value);
        }

        if ok {
            let modules = (api.PyImport_GetModuleDict)();
            ok = !modules.is_null()
                && (api.PyDict_SetItemString)(modules, name.as_ptr(), module) == 0;
        }
        (api.Py_DecRef)(module);
        ok
    }
}

/// Bind the per-script helpers (`get_script_path`, `on`) into `module`.
///
/// # Safety
///
/// The GIL must be held.
pub(crate) unsafe fn add_script_functions(api: &PythonApi, module: PyPtr) -> bool {
    // SAFETY: GIL held per the caller.
    unsafe { add_functions(api, module.as_ptr(), SCRIPT_METHODS.iter(), true) }
}

/// Execute `source` in a fresh namespace through `builtins.exec`.
///
/// # Safety
///
/// The GIL must be held.
pub(crate) unsafe fn run_source(api: &PythonApi, name: &str, source: &str) -> bool {
    let Ok(source) = CString::new(source) else {
        return false;
    };
    // SAFETY: GIL held per the caller; every new reference is released on
    // all paths below.
    unsafe {
        let builtins = (api.PyImport_ImportModule)(c"builtins".as_ptr());
        let exec = if builtins.is_null() {
            null_mut()
        } else {
            (api.PyObject_GetAttrString)(builtins, c"exec".as_ptr())
        };
        let globals = (api.PyDict_New)();
        let code = (api.PyUnicode_FromString)(source.as_ptr());
        let module_name = api.new_string(name);
        let args = (api.PyTuple_New)(2);

        let mut result = null_mut();
        let ready = [exec, globals, code, module_name, args]
            .iter()
            .all(|object| !object.is_null());
        if ready {
            (api.PyDict_SetItemString)(globals, c"__name__".as_ptr(), module_name);
            (api.Py_IncRef)(code);
            (api.Py_IncRef)(globals);
            // PyTuple_SetItem steals the references taken just above.
            (api.PyTuple_SetItem)(args, 0, code);
            (api.PyTuple_SetItem)(args, 1, globals);
            result = (api.PyObject_CallObject)(exec, args);
        }

        let ok = !result.is_null();
        if !ok {
            api.print_error();
        }
        for object in [result, args, module_name, code, globals, exec, builtins] {
            api.xdecref(object);
        }
        ok
    }
}

/// Line-buffered replacements for `sys.stdout` / `sys.stderr` writing to the
/// host log, plus the argument vector some modules expect to exist.
pub(crate) fn stream_redirect_source(host_module: &str) -> String {
    format!(
        r#"
import os
import sys
import {host_module} as _host

class _HostStream(object):
    def __init__(self, level):
        self._level = level
        self._pending = ''

    def write(self, message):
        self._pending += message
        while '\n' in self._pending:
            line, self._pending = self._pending.split('\n', 1)
            _host.log(self._level, line)
        return len(message)

    def flush(self):
        if self._pending:
            _host.log(self._level, self._pending)
            self._pending = ''

os.environ['PYTHONUNBUFFERED'] = '1'
if not getattr(sys, 'argv', None):
    sys.argv = ['']
sys.stdout = _HostStream(_host.LOG_INFO)
sys.stderr = _HostStream(_host.LOG_ERROR)
"#
    )
}
