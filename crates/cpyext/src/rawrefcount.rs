//! The link table: which managed object each native object mirrors.
//!
//! Managed to native goes through a hash map keyed by [`ObjectId`]; native to
//! managed reads the `ob_pypy_link` word in the native header. While a pair
//! is linked the native refcount carries an extra [`REFCNT_FROM_PYPY`], so
//! native decrefs alone can never free it. The managed side learns about
//! native interest through [`ExternalRoots`]: any linked object whose count is
//! above the bias is a root for the collector.

use crate::{
    abi::{PyObject, REFCNT_FROM_PYPY},
    error::{BridgeError, BridgeResult},
};
use core::{ptr::NonNull, sync::atomic::Ordering};
use pybridge_common::lock::PyMutex;
use pybridge_vm::{ExternalRoots, ObjectId};
use std::collections::{HashMap, VecDeque};

/// A native object address that can be stored in shared tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PyObjectPtr(NonNull<PyObject>);

// SAFETY: the pointee is only read or written by whoever holds the global
// lock, apart from the refcount, which is atomic.
unsafe impl Send for PyObjectPtr {}
unsafe impl Sync for PyObjectPtr {}

impl PyObjectPtr {
    pub fn new(ptr: *mut PyObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub const fn from_non_null(ptr: NonNull<PyObject>) -> Self {
        Self(ptr)
    }

    pub const fn as_ptr(self) -> *mut PyObject {
        self.0.as_ptr()
    }

    pub const fn as_non_null(self) -> NonNull<PyObject> {
        self.0
    }

    /// # Safety
    /// The pointee must be a live native object.
    pub unsafe fn refcnt(self) -> isize {
        unsafe { self.0.as_ref() }.ob_refcnt.load(Ordering::Acquire)
    }

    /// # Safety
    /// The pointee must be a live native object.
    pub unsafe fn link(self) -> Option<ObjectId> {
        let raw = unsafe { (*self.as_ptr()).ob_pypy_link };
        ObjectId::from_raw(raw as u64)
    }
}

#[derive(Debug, Default)]
pub struct LinkTable {
    links: PyMutex<HashMap<ObjectId, PyObjectPtr>>,
    /// Linked managed objects the collector has swept, in sweep order.
    dead: PyMutex<VecDeque<ObjectId>>,
}

impl LinkTable {
    /// Links `native` to `managed` and adds the [`REFCNT_FROM_PYPY`] bias.
    ///
    /// # Safety
    /// `native` must be a live native object.
    pub unsafe fn link(&self, native: PyObjectPtr, managed: ObjectId) -> BridgeResult<()> {
        let refcnt = unsafe { native.refcnt() };
        if refcnt >= REFCNT_FROM_PYPY || unsafe { native.link() }.is_some() {
            return Err(BridgeError::AlreadyLinked {
                native: native.as_ptr(),
                refcnt,
            });
        }
        let mut links = self.links.lock();
        if let Some(existing) = links.get(&managed) {
            return Err(BridgeError::ManagedAlreadyLinked {
                managed,
                existing: existing.as_ptr(),
            });
        }
        unsafe {
            let obj = native.as_ptr();
            (*obj).ob_refcnt.fetch_add(REFCNT_FROM_PYPY, Ordering::AcqRel);
            (*obj).ob_pypy_link = managed.get() as isize;
        }
        links.insert(managed, native);
        Ok(())
    }

    /// Forgets the link of `managed`, clearing the native back-pointer.
    ///
    /// The [`REFCNT_FROM_PYPY`] bias stays on the native object; releasing it
    /// is the caller's job.
    pub fn unlink(&self, managed: ObjectId) -> Option<PyObjectPtr> {
        let native = self.links.lock().remove(&managed)?;
        // SAFETY: a linked native object is kept alive by its bias.
        unsafe { (*native.as_ptr()).ob_pypy_link = 0 };
        Some(native)
    }

    pub fn native_of(&self, managed: ObjectId) -> Option<PyObjectPtr> {
        self.links.lock().get(&managed).copied()
    }

    /// # Safety
    /// `native` must be a live native object.
    pub unsafe fn managed_of(&self, native: PyObjectPtr) -> Option<ObjectId> {
        unsafe { native.link() }
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    pub(crate) fn queue_dead(&self, managed: ObjectId) {
        self.dead.lock().push_back(managed);
    }

    pub(crate) fn pop_dead(&self) -> Option<ObjectId> {
        self.dead.lock().pop_front()
    }

    pub fn pending_dead(&self) -> usize {
        self.dead.lock().len()
    }
}

impl ExternalRoots for LinkTable {
    fn trace_roots(&self, tracer: &mut dyn FnMut(ObjectId)) {
        let links = self.links.lock();
        for (&managed, native) in links.iter() {
            // SAFETY: linked native objects are alive while they hold the bias.
            if unsafe { native.refcnt() } > REFCNT_FROM_PYPY {
                tracer(managed);
            }
        }
    }
}
