//! CPython C API surface, bound at runtime.
//!
//! Only entry points from the stable ABI are used, so any CPython 3.x
//! shared library that exports them can be bound.

use std::ffi::{c_char, c_int, c_longlong};
use std::ptr::NonNull;

/// Opaque `PyObject`.
#[repr(C)]
pub struct PyObject {
    _private: [u8; 0],
}

/// Opaque `PyThreadState`.
#[repr(C)]
pub struct PyThreadState {
    _private: [u8; 0],
}

#[cfg(windows)]
pub type WChar = u16;
#[cfg(not(windows))]
pub type WChar = i32;

pub type PyGILStateState = c_int;

pub type PyCFunction = unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject;

pub const METH_VARARGS: c_int = 0x0001;
pub const METH_NOARGS: c_int = 0x0004;

#[repr(C)]
pub struct PyMethodDef {
    pub ml_name: *const c_char,
    pub ml_meth: Option<PyCFunction>,
    pub ml_flags: c_int,
    pub ml_doc: *const c_char,
}

/// Method definitions handed to `PyCFunction_NewEx`, which keeps borrowing
/// them for the lifetime of the created function objects.
pub struct MethodDefs<const N: usize>(pub [PyMethodDef; N]);

// SAFETY: the definitions are immutable statics of C string literals and
// function pointers; the runtime only ever reads them.
unsafe impl<const N: usize> Sync for MethodDefs<N> {}

impl<const N: usize> MethodDefs<N> {
    pub fn iter(&'static self) -> impl Iterator<Item = *mut PyMethodDef> {
        self.0.iter().map(|def| std::ptr::from_ref(def).cast_mut())
    }
}

crate::symbol_table! {
    /// Every CPython entry point the backend calls.
    pub struct PythonApi {
        Py_InitializeEx: unsafe extern "C" fn(c_int),
        Py_IsInitialized: unsafe extern "C" fn() -> c_int,
        Py_FinalizeEx: unsafe extern "C" fn() -> c_int,
        Py_SetPythonHome: unsafe extern "C" fn(*const WChar),
        Py_DecodeLocale: unsafe extern "C" fn(*const c_char, *mut usize) -> *mut WChar,
        PyEval_SaveThread: unsafe extern "C" fn() -> *mut PyThreadState,
        PyGILState_Ensure: unsafe extern "C" fn() -> PyGILStateState,
        PyGILState_Release: unsafe extern "C" fn(PyGILStateState),
        PyErr_Occurred: unsafe extern "C" fn() -> *mut PyObject,
        PyErr_Print: unsafe extern "C" fn(),
        PyErr_Clear: unsafe extern "C" fn(),
        PyErr_SetString: unsafe extern "C" fn(*mut PyObject, *const c_char),
        PyImport_Import: unsafe extern "C" fn(*mut PyObject) -> *mut PyObject,
        PyImport_ImportModule: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
        PyImport_GetModuleDict: unsafe extern "C" fn() -> *mut PyObject,
        PyModule_New: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
        PyCFunction_NewEx:
            unsafe extern "C" fn(*mut PyMethodDef, *mut PyObject, *mut PyObject) -> *mut PyObject,
        PyObject_GetAttrString: unsafe extern "C" fn(*mut PyObject, *const c_char) -> *mut PyObject,
        PyObject_SetAttrString:
            unsafe extern "C" fn(*mut PyObject, *const c_char, *mut PyObject) -> c_int,
        PyObject_HasAttrString: unsafe extern "C" fn(*mut PyObject, *const c_char) -> c_int,
        PyObject_CallObject: unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject,
        PyCallable_Check: unsafe extern "C" fn(*mut PyObject) -> c_int,
        PyDict_New: unsafe extern "C" fn() -> *mut PyObject,
        PyDict_SetItemString:
            unsafe extern "C" fn(*mut PyObject, *const c_char, *mut PyObject) -> c_int,
        PyDict_DelItemString: unsafe extern "C" fn(*mut PyObject, *const c_char) -> c_int,
        PySys_GetObject: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
        PyList_Append: unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> c_int,
        PyList_Size: unsafe extern "C" fn(*mut PyObject) -> isize,
        PyList_GetItem: unsafe extern "C" fn(*mut PyObject, isize) -> *mut PyObject,
        PyTuple_New: unsafe extern "C" fn(isize) -> *mut PyObject,
        PyTuple_SetItem: unsafe extern "C" fn(*mut PyObject, isize, *mut PyObject) -> c_int,
        PyUnicode_FromString: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
        PyUnicode_AsUTF8AndSize: unsafe extern "C" fn(*mut PyObject, *mut isize) -> *const c_char,
        PyLong_FromLongLong: unsafe extern "C" fn(c_longlong) -> *mut PyObject,
        PyArg_ParseTuple: unsafe extern "C" fn(*mut PyObject, *const c_char, ...) -> c_int,
        Py_IncRef: unsafe extern "C" fn(*mut PyObject),
        Py_DecRef: unsafe extern "C" fn(*mut PyObject),
        _Py_NoneStruct: *mut PyObject,
        PyExc_TypeError: *mut *mut PyObject,
    }
}

// SAFETY: the table holds process-global entry points and addresses of
// process-global runtime objects; using them is governed by the GIL, not by
// which thread holds the table.
unsafe impl Send for PythonApi {}
// SAFETY: as above.
unsafe impl Sync for PythonApi {}

impl PythonApi {
    /// New reference to `None`.
    pub unsafe fn none(&self) -> *mut PyObject {
        // SAFETY: caller holds the GIL.
        unsafe { (self.Py_IncRef)(self._Py_NoneStruct) };
        self._Py_NoneStruct
    }

    /// Report and clear a pending runtime error. Returns whether one was
    /// pending.
    pub unsafe fn print_error(&self) -> bool {
        // SAFETY: caller holds the GIL.
        unsafe {
            if (self.PyErr_Occurred)().is_null() {
                return false;
            }
            (self.PyErr_Print)();
        }
        true
    }

    /// Release a possibly null reference.
    pub unsafe fn xdecref(&self, object: *mut PyObject) {
        if !object.is_null() {
            // SAFETY: caller holds the GIL and owns the reference.
            unsafe { (self.Py_DecRef)(object) };
        }
    }

    /// UTF-8 contents of a `str` object.
    pub unsafe fn string(&self, object: *mut PyObject) -> Option<String> {
        let mut len: isize = 0;
        // SAFETY: caller holds the GIL; `object` is a live reference.
        let data = unsafe { (self.PyUnicode_AsUTF8AndSize)(object, &raw mut len) };
        if data.is_null() {
            // SAFETY: as above.
            unsafe { (self.PyErr_Clear)() };
            return None;
        }
        let len = usize::try_from(len).ok()?;
        // SAFETY: the runtime guarantees `len` valid bytes at `data`.
        let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// New `str` object from a Rust string. Null on failure (or interior NUL).
    pub unsafe fn new_string(&self, value: &str) -> *mut PyObject {
        match std::ffi::CString::new(value) {
            // SAFETY: caller holds the GIL.
            Ok(value) => unsafe { (self.PyUnicode_FromString)(value.as_ptr()) },
            Err(_) => std::ptr::null_mut(),
        }
    }
}

/// An owned (strong) reference, moved between threads only while the GIL
/// serializes every use of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyPtr(NonNull<PyObject>);

// SAFETY: see type docs; every dereference happens under the GIL.
unsafe impl Send for PyPtr {}

impl PyPtr {
    pub fn new(object: *mut PyObject) -> Option<Self> {
        NonNull::new(object).map(Self)
    }

    pub fn as_ptr(self) -> *mut PyObject {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}
