use std::marker::PhantomData;

use super::ffi::{PyGILStateState, PythonApi};

/// Holds the interpreter's global lock for the current thread.
///
/// Nested acquisition is allowed; each guard releases exactly the state it
/// acquired, on every exit path.
pub(crate) struct GilGuard<'a> {
    api: &'a PythonApi,
    state: PyGILStateState,
    // The lock state belongs to the acquiring thread.
    _not_send: PhantomData<*const ()>,
}

impl<'a> GilGuard<'a> {
    /// # Safety
    ///
    /// The interpreter must be initialized.
    pub(crate) unsafe fn acquire(api: &'a PythonApi) -> Self {
        // SAFETY: forwarded from the caller.
        let state = unsafe { (api.PyGILState_Ensure)() };
        Self {
            api,
            state,
            _not_send: PhantomData,
        }
    }
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: paired with the `PyGILState_Ensure` in `acquire`, on the
        // same thread.
        unsafe { (self.api.PyGILState_Release)(self.state) };
    }
}
