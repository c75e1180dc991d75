//! The exception slot and the `PyErr_*` functions over it.

use crate::{
    api::{Borrowed, ErrorValue},
    cpython_api,
    error::BridgeResult,
};
use core::ffi::{CStr, c_char, c_int};
use pybridge_common::lock::PyMutex;
use pybridge_vm::{ObjectId, PyException};

/// The current exception, if one is set.
///
/// Native code sees an error as a sentinel return plus a set slot. Managed
/// code sees it as a raised exception; [`check_and_raise`] moves it back.
///
/// [`check_and_raise`]: Self::check_and_raise
#[derive(Debug, Default)]
pub struct ExceptionState {
    current: PyMutex<Option<PyException>>,
}

impl ExceptionState {
    pub fn set_exception(&self, exc: PyException) {
        let previous = self.current.lock().replace(exc);
        if let Some(previous) = previous {
            trace!("exception slot overwrote {previous}");
        }
    }

    pub fn occurred(&self) -> Option<PyException> {
        self.current.lock().clone()
    }

    pub fn clear(&self) {
        self.current.lock().take();
    }

    /// Takes the current exception out of the slot.
    pub fn fetch(&self) -> Option<PyException> {
        self.current.lock().take()
    }

    /// Raises the pending exception, if any, clearing the slot.
    pub fn check_and_raise(&self) -> BridgeResult<()> {
        match self.fetch() {
            Some(exc) => Err(exc.into()),
            None => Ok(()),
        }
    }
}

fn message_from(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: native callers pass NUL-terminated strings.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

cpython_api! {
    #[api(export = "PyErr_Occurred", error = ErrorValue::CannotFail, gil = None)]
    /// The type of the pending exception, borrowed, or NULL.
    pub fn err_occurred(bridge) -> Option<Borrowed> {
        Ok(bridge.errors.occurred().map(|exc| Borrowed(exc.exc_type)))
    }
}

cpython_api! {
    #[api(export = "PyErr_Clear", error = ErrorValue::CannotFail, gil = None)]
    pub fn err_clear(bridge) -> () {
        bridge.errors.clear();
        Ok(())
    }
}

cpython_api! {
    #[api(export = "PyErr_SetString", error = ErrorValue::CannotFail, gil = None)]
    pub fn err_set_string(bridge, w_type: ObjectId, message: *const c_char) -> () {
        let exc = bridge.heap.new_exception(w_type, message_from(message));
        bridge.errors.set_exception(exc);
        Ok(())
    }
}

cpython_api! {
    #[api(export = "PyErr_SetNone", error = ErrorValue::CannotFail, gil = None)]
    pub fn err_set_none(bridge, w_type: ObjectId) -> () {
        bridge.errors.set_exception(bridge.heap.new_exception(w_type, ""));
        Ok(())
    }
}

cpython_api! {
    #[api(export = "PyErr_BadInternalCall", error = ErrorValue::Int(0), gil = None)]
    pub fn err_bad_internal_call(bridge) -> c_int {
        Err(bridge
            .heap
            .new_system_error("bad argument to internal function")
            .into())
    }
}

cpython_api! {
    #[api(export = "PyErr_NoMemory", error = ErrorValue::Null, gil = None)]
    pub fn err_no_memory(bridge) -> Option<ObjectId> {
        Err(bridge.heap.new_memory_error().into())
    }
}

cpython_api! {
    #[api(export = "PyErr_ExceptionMatches", error = ErrorValue::CannotFail, gil = None)]
    pub fn err_exception_matches(bridge, w_type: ObjectId) -> c_int {
        let matches = bridge
            .errors
            .occurred()
            .is_some_and(|exc| bridge.heap.exception_matches(&exc, w_type));
        Ok(matches.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bridge, Settings};
    use pybridge_vm::Heap;
    use std::sync::Arc;

    #[test]
    fn test_slot() {
        let heap = Heap::new();
        let state = ExceptionState::default();
        assert!(state.check_and_raise().is_ok());
        state.set_exception(heap.new_value_error("first"));
        state.set_exception(heap.new_type_error("second"));
        assert_eq!(state.occurred().unwrap().message, "second");
        assert!(state.check_and_raise().is_err());
        assert!(state.occurred().is_none());
    }

    #[test]
    fn test_set_and_fetch_from_native() {
        let bridge = Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap();
        bridge.enter(|| {
            let value_error = bridge.heap.ctx.exceptions.value_error;
            let exc_type = bridge.as_pyobj(value_error).unwrap().as_ptr();
            unsafe {
                assert!(err_occurred_wrapper().is_null());
                err_set_string_wrapper(exc_type, c"bad value".as_ptr());
                assert_eq!(err_occurred_wrapper(), exc_type);
                assert_eq!(err_exception_matches_wrapper(exc_type), 1);
            }
            let exc = bridge.errors.occurred().unwrap();
            assert_eq!(exc.message, "bad value");

            let exception = bridge
                .as_pyobj(bridge.heap.ctx.exceptions.exception_type)
                .unwrap();
            assert_eq!(
                unsafe { err_exception_matches_wrapper(exception.as_ptr()) },
                1
            );
            unsafe { err_clear_wrapper() };
            assert!(bridge.errors.occurred().is_none());

            assert!(unsafe { err_no_memory_wrapper() }.is_null());
            let exc = bridge.errors.fetch().unwrap();
            assert_eq!(exc.exc_type, bridge.heap.ctx.exceptions.memory_error);
            assert_eq!(unsafe { err_bad_internal_call_wrapper() }, 0);
            assert!(bridge.errors.fetch().is_some());
        });
    }
}
