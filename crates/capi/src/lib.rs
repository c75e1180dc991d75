//! Process-level entry points for embedding: runtime startup and shutdown,
//! and the global execution lock as native threads see it.
//!
//! Everything else native code calls lives in [`pybridge_cpyext`]; linking
//! this crate as a `cdylib` exports both.

#![allow(non_snake_case)]

#[macro_use]
extern crate log;

use core::ffi::{c_int, c_void};
pub use pybridge_cpyext;
use pybridge_cpyext::{
    ApiFunction, Bridge, BridgeError, OrFatal, Settings, api::ErrorValue, cpython_api,
};
use pybridge_vm::Heap;
use std::sync::Arc;

/// `PyGILState_STATE`: the lock was already held.
pub const PYGILSTATE_LOCKED: c_int = 0;
/// `PyGILState_STATE`: the lock was taken by `PyGILState_Ensure`.
pub const PYGILSTATE_UNLOCKED: c_int = 1;

/// Creates the heap and bridge, configured from `PYBRIDGE_*` variables, and
/// installs the bridge process-wide. The calling thread holds the execution
/// lock afterwards. Calling it again is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn Py_Initialize() {
    if Bridge::installed().is_some() {
        return;
    }
    let settings = Settings::from_env();
    let bridge = Bridge::new(Arc::new(Heap::new()), settings).or_fatal();
    bridge.install();
    bridge.gil.acquire();
    info!("native bridge initialized ({:?})", bridge.settings.type_init);
}

#[unsafe(no_mangle)]
pub extern "C" fn Py_IsInitialized() -> c_int {
    Bridge::installed().is_some().into()
}

/// Uninstalls the bridge and releases every mirror native code no longer
/// holds. Objects native code still references are left alone.
#[unsafe(no_mangle)]
pub extern "C" fn Py_Finalize() {
    let Some(bridge) = Bridge::uninstall() else {
        return;
    };
    let released = bridge.enter(|| {
        let stats = bridge.heap.collect();
        let released = bridge.drain_dead();
        debug!("final collection: {stats:?}");
        released
    });
    if !bridge.gil.release() {
        debug!("finalized from a thread that does not hold the execution lock");
    }
    info!(
        "native bridge finalized; released {released} links, {} remain",
        bridge.links.len()
    );
}

cpython_api! {
    #[api(export = "PyEval_SaveThread", error = ErrorValue::CannotFail, gil = Release)]
    /// Gives up the execution lock around blocking native work. The returned
    /// thread state is opaque and always NULL.
    pub fn save_thread(bridge) -> *mut c_void {
        Ok(core::ptr::null_mut())
    }
}

cpython_api! {
    #[api(export = "PyEval_RestoreThread", error = ErrorValue::CannotFail, gil = Acquire)]
    pub fn restore_thread(bridge, tstate: *mut c_void) -> () {
        Ok(())
    }
}

cpython_api! {
    #[api(export = "PyGILState_Ensure", error = ErrorValue::CannotFail, gil = None)]
    /// Takes the execution lock unless this thread already holds it.
    pub fn gil_state_ensure(bridge) -> c_int {
        if bridge.gil.is_held_by_current_thread() {
            return Ok(PYGILSTATE_LOCKED);
        }
        bridge.gil.acquire();
        Ok(PYGILSTATE_UNLOCKED)
    }
}

cpython_api! {
    #[api(export = "PyGILState_Release", error = ErrorValue::CannotFail, gil = None)]
    /// Undoes the matching `PyGILState_Ensure`.
    pub fn gil_state_release(bridge, state: c_int) -> () {
        if state == PYGILSTATE_UNLOCKED && !bridge.gil.release() {
            return Err(BridgeError::LockNotHeld);
        }
        Ok(())
    }
}

pub static FUNCTIONS: &[&ApiFunction] = &[
    &SAVE_THREAD,
    &RESTORE_THREAD,
    &GIL_STATE_ENSURE,
    &GIL_STATE_RELEASE,
];

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the installed bridge is process-wide.
    #[test]
    fn test_lifecycle_and_lock() {
        assert_eq!(Py_IsInitialized(), 0);
        Py_Initialize();
        Py_Initialize();
        assert_eq!(Py_IsInitialized(), 1);
        let bridge = Bridge::installed().unwrap();
        assert!(bridge.gil.is_held_by_current_thread());

        unsafe {
            let tstate = save_thread_wrapper();
            assert!(!bridge.gil.is_locked());
            restore_thread_wrapper(tstate);
            assert!(bridge.gil.is_held_by_current_thread());

            assert_eq!(gil_state_ensure_wrapper(), PYGILSTATE_LOCKED);
            gil_state_release_wrapper(PYGILSTATE_LOCKED);
            assert!(bridge.gil.is_held_by_current_thread());

            save_thread_wrapper();
            assert_eq!(gil_state_ensure_wrapper(), PYGILSTATE_UNLOCKED);
            assert!(bridge.gil.is_held_by_current_thread());
            gil_state_release_wrapper(PYGILSTATE_UNLOCKED);
            assert!(!bridge.gil.is_locked());
            restore_thread_wrapper(core::ptr::null_mut());
        }

        let w_obj = bridge.heap.new_int(1);
        let mirror = bridge.as_pyobj(w_obj).unwrap();
        assert_eq!(bridge.links.native_of(w_obj), Some(mirror));

        Py_Finalize();
        assert_eq!(Py_IsInitialized(), 0);
        assert!(!bridge.gil.is_locked());
        assert!(bridge.links.native_of(w_obj).is_none());
    }
}
