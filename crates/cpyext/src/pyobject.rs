//! Native object lifecycle: allocation, reference counting, and the two
//! directions of crossing between managed identities and native addresses.
//!
//! *Attach* goes managed to native: [`Bridge::as_pyobj`] and
//! [`Bridge::make_ref`] hand out the native mirror of a managed object,
//! creating it through the family strategy's `alloc` and `attach` hooks the
//! first time. *Realize* goes native to managed: [`Bridge::from_native`]
//! returns the linked managed object, building one through the strategy's
//! `realize` hook for native-born objects.

use crate::{
    Bridge,
    abi::{Py_ssize_t, PyObject, PyTypeObject, PyVarObject, REFCNT_FROM_PYPY},
    error::{BridgeError, BridgeResult},
    rawrefcount::PyObjectPtr,
};
use core::{ptr::NonNull, sync::atomic::Ordering};
use pybridge_vm::ObjectId;

impl Bridge {
    /// Allocates a zeroed instance of the native type `pto` with refcount 1.
    ///
    /// Instances of heap types own a reference to their type.
    ///
    /// # Safety
    /// `pto` must be a live, readied type descriptor.
    pub unsafe fn allocate(
        &self,
        pto: *mut PyTypeObject,
        itemcount: Py_ssize_t,
    ) -> BridgeResult<PyObjectPtr> {
        if self.settings.drain_on_alloc {
            self.drain_dead();
        }
        let pto_ref = unsafe { pto.as_ref() }.ok_or(BridgeError::NullPointer)?;
        let size = usize::try_from(itemcount)
            .ok()
            .and_then(|n| n.checked_mul(pto_ref.tp_itemsize.max(0) as usize))
            .and_then(|items| items.checked_add(pto_ref.tp_basicsize.max(0) as usize))
            .ok_or_else(|| {
                self.heap
                    .new_overflow_error(format!("cannot allocate {itemcount} items"))
            })?;
        let size = size.max(size_of::<PyObject>());
        // SAFETY: plain C allocation, checked for null below.
        let raw = unsafe { libc::calloc(1, size) }.cast::<PyObject>();
        let obj = PyObjectPtr::new(raw).ok_or(BridgeError::NoMemory(size))?;
        unsafe {
            (*raw).ob_refcnt.store(1, Ordering::Release);
            (*raw).ob_type = pto;
            if pto_ref.tp_itemsize != 0 {
                (*raw.cast::<PyVarObject>()).ob_size = itemcount;
            }
            if pto_ref.is_heap_type() {
                self.incref(PyObjectPtr::from_non_null(NonNull::new_unchecked(pto.cast())))?;
            }
        }
        if self.settings.debug_refcount {
            trace!("allocate {:p} ({}, {size} bytes)", raw, pto_ref.name());
        }
        Ok(obj)
    }

    /// # Safety
    /// `obj` must be a live native object.
    pub unsafe fn incref(&self, obj: PyObjectPtr) -> BridgeResult<()> {
        let previous = unsafe { obj.as_non_null().as_ref() }
            .ob_refcnt
            .fetch_add(1, Ordering::AcqRel);
        if previous <= 0 {
            return Err(BridgeError::IncrefOfDead(obj.as_ptr()));
        }
        if self.settings.debug_refcount {
            trace!("incref {:p} -> {}", obj.as_ptr(), previous + 1);
        }
        Ok(())
    }

    /// Drops one native reference, deallocating the object at zero.
    ///
    /// # Safety
    /// `obj` must be a live native object the caller owns a reference to.
    pub unsafe fn decref(&self, obj: PyObjectPtr) -> BridgeResult<()> {
        unsafe { self.decref_by(obj, 1) }
    }

    unsafe fn decref_by(&self, obj: PyObjectPtr, n: Py_ssize_t) -> BridgeResult<()> {
        let previous = unsafe { obj.as_non_null().as_ref() }
            .ob_refcnt
            .fetch_sub(n, Ordering::AcqRel);
        let now = previous - n;
        if self.settings.debug_refcount {
            trace!("decref {:p} -> {now}", obj.as_ptr());
        }
        match now {
            0 => {
                unsafe { self.dealloc(obj) };
                Ok(())
            }
            n if n < 0 => Err(BridgeError::RefcountUnderflow(obj.as_ptr())),
            _ => Ok(()),
        }
    }

    /// `Py_XINCREF`: a null `obj` is ignored.
    ///
    /// # Safety
    /// A non-null `obj` must be a live native object.
    pub unsafe fn xincref(&self, obj: *mut PyObject) -> BridgeResult<()> {
        match PyObjectPtr::new(obj) {
            Some(obj) => unsafe { self.incref(obj) },
            None => Ok(()),
        }
    }

    /// `Py_XDECREF`: a null `obj` is ignored.
    ///
    /// # Safety
    /// A non-null `obj` must be a live native object the caller owns a
    /// reference to.
    pub unsafe fn xdecref(&self, obj: *mut PyObject) -> BridgeResult<()> {
        match PyObjectPtr::new(obj) {
            Some(obj) => unsafe { self.decref(obj) },
            None => Ok(()),
        }
    }

    /// Runs the type's `tp_dealloc` on an object whose count reached zero.
    ///
    /// # Safety
    /// `obj` must be a live native object nobody references any more.
    pub unsafe fn dealloc(&self, obj: PyObjectPtr) {
        let raw = obj.as_ptr();
        if let Some(w_obj) = unsafe { obj.link() } {
            warn!("deallocating {raw:p} while it is still linked to {w_obj}");
            self.links.unlink(w_obj);
        }
        let dealloc = unsafe { (*raw).ob_type.as_ref() }.and_then(|pto| pto.tp_dealloc);
        match dealloc {
            Some(dealloc) => self.entered(|| unsafe { dealloc(raw) }),
            None => {
                warn!("{raw:p} has no tp_dealloc; freeing its memory directly");
                unsafe { libc::free(raw.cast()) };
            }
        }
    }

    /// Links the native object to the managed one.
    ///
    /// # Safety
    /// `obj` must be a live native object.
    pub unsafe fn track_reference(&self, obj: PyObjectPtr, w_obj: ObjectId) -> BridgeResult<()> {
        if !self.heap.watch(w_obj) {
            return Err(BridgeError::DeadObject(w_obj));
        }
        unsafe { self.links.link(obj, w_obj) }
    }

    /// `from_ref`: the managed object for a possibly null native pointer.
    ///
    /// # Safety
    /// A non-null `obj` must be a live native object.
    pub unsafe fn from_ref(&self, obj: *mut PyObject) -> BridgeResult<Option<ObjectId>> {
        match PyObjectPtr::new(obj) {
            Some(obj) => unsafe { self.from_native(obj) }.map(Some),
            None => Ok(None),
        }
    }

    /// The managed object linked to `obj`, realizing one if there is none.
    ///
    /// # Safety
    /// `obj` must be a live native object.
    pub unsafe fn from_native(&self, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
        if let Some(w_obj) = unsafe { self.links.managed_of(obj) } {
            return Ok(w_obj);
        }
        unsafe { self.realize(obj) }
    }

    unsafe fn realize(&self, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
        let ob_type = unsafe { (*obj.as_ptr()).ob_type };
        let type_obj = PyObjectPtr::new(ob_type.cast()).ok_or(BridgeError::NullPointer)?;
        if type_obj == obj {
            // Only a linked object may be its own type; `type` is bootstrapped.
            return Err(BridgeError::InvalidPointer(obj.as_ptr()));
        }
        let w_type = unsafe { self.from_native(type_obj)? };
        let family = self
            .heap
            .type_family(w_type)
            .ok_or(BridgeError::NotAType(w_type))?;
        let typedescr = self.typedescrs.get(family);
        let w_obj = unsafe { (typedescr.realize)(self, obj)? };
        debug_assert_eq!(unsafe { self.links.managed_of(obj) }, Some(w_obj));
        Ok(w_obj)
    }

    /// `as_native`: the native mirror of `w_obj`, borrowed.
    ///
    /// A mirror created here is owned by the managed object alone: its count
    /// is exactly [`REFCNT_FROM_PYPY`].
    pub fn as_pyobj(&self, w_obj: ObjectId) -> BridgeResult<PyObjectPtr> {
        match self.links.native_of(w_obj) {
            Some(obj) => Ok(obj),
            None => self.create_ref(w_obj),
        }
    }

    /// `make_owned_native`: the native mirror of `w_obj` with a new reference
    /// for the caller.
    pub fn make_ref(&self, w_obj: ObjectId) -> BridgeResult<PyObjectPtr> {
        let obj = self.as_pyobj(w_obj)?;
        // SAFETY: linked objects stay alive at least until the managed side dies.
        unsafe { self.incref(obj)? };
        Ok(obj)
    }

    fn create_ref(&self, w_obj: ObjectId) -> BridgeResult<PyObjectPtr> {
        let w_type = self
            .heap
            .class_of(w_obj)
            .ok_or(BridgeError::DeadObject(w_obj))?;
        let family = self
            .heap
            .type_family(w_type)
            .ok_or(BridgeError::NotAType(w_type))?;
        let typedescr = self.typedescrs.get(family);
        unsafe {
            let obj = (typedescr.alloc)(self, w_type, 0)?;
            if let Err(err) = self.track_reference(obj, w_obj) {
                self.decref(obj)?;
                return Err(err);
            }
            // The allocation's own reference moves to the managed side.
            obj.as_non_null()
                .as_ref()
                .ob_refcnt
                .fetch_sub(1, Ordering::AcqRel);
            if let Err(err) = (typedescr.attach)(self, obj, w_obj) {
                // A half-built mirror must never be found through the table.
                self.links.unlink(w_obj);
                self.decref_by(obj, REFCNT_FROM_PYPY)?;
                return Err(err);
            }
            debug_assert!(obj.refcnt() >= REFCNT_FROM_PYPY);
            Ok(obj)
        }
    }

    /// Takes ownership of one native reference and returns the managed object.
    ///
    /// # Safety
    /// `obj` must be a live native object the caller owns a reference to.
    pub unsafe fn get_w_obj_and_decref(&self, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
        let w_obj = unsafe { self.from_native(obj)? };
        // Linked now, so the bias keeps it alive past this decref.
        unsafe { self.decref(obj)? };
        Ok(w_obj)
    }

    /// `Py_IncRef` on a managed object: adds a native reference to its mirror.
    pub fn incref_managed(&self, w_obj: ObjectId) -> BridgeResult<()> {
        self.make_ref(w_obj).map(drop)
    }

    /// `Py_DecRef` on a managed object; a no-op if it has no mirror.
    pub fn decref_managed(&self, w_obj: ObjectId) -> BridgeResult<()> {
        match self.links.native_of(w_obj) {
            Some(obj) => unsafe { self.decref(obj) },
            None => Ok(()),
        }
    }

    /// Releases the managed side's hold on the mirrors of managed objects
    /// the collector has swept. Returns how many links were released.
    ///
    /// Dropping the [`REFCNT_FROM_PYPY`] bias frees mirrors that native code
    /// no longer references. Calls made while a drain is running, from a
    /// `tp_dealloc` for example, return 0.
    pub fn drain_dead(&self) -> usize {
        if self.draining.swap(true, Ordering::AcqRel) {
            return 0;
        }
        scopeguard::defer! {
            self.draining.store(false, Ordering::Release);
        }
        let mut released = 0;
        while let Some(w_obj) = self.links.pop_dead() {
            let Some(obj) = self.links.unlink(w_obj) else {
                continue;
            };
            // SAFETY: the bias kept `obj` alive up to now.
            if let Err(err) = unsafe { self.decref_by(obj, REFCNT_FROM_PYPY) } {
                crate::error::fatal_error(&err);
            }
            released += 1;
        }
        if released > 0 {
            debug!("released {released} dead links");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Bridge, Settings,
        abi::{PyObject, PyTypeObject, REFCNT_FROM_PYPY},
        error::BridgeError,
    };
    use core::sync::atomic::{AtomicUsize, Ordering};
    use pybridge_vm::Heap;
    use std::sync::Arc;

    static COUNTED_DEALLOCS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counted_dealloc(obj: *mut PyObject) {
        COUNTED_DEALLOCS.fetch_add(1, Ordering::SeqCst);
        unsafe { libc::free(obj.cast()) };
    }

    fn bridge() -> Arc<Bridge> {
        let mut settings = Settings::default();
        settings.drain_on_alloc = false;
        Bridge::new(Arc::new(Heap::new()), settings).unwrap()
    }

    #[test]
    fn test_make_ref_adds_native_reference() {
        let bridge = bridge();
        bridge.enter(|| {
            let w_obj = bridge.heap.new_int(5);
            let borrowed = bridge.as_pyobj(w_obj).unwrap();
            assert_eq!(unsafe { borrowed.refcnt() }, REFCNT_FROM_PYPY);
            let owned = bridge.make_ref(w_obj).unwrap();
            assert_eq!(owned, borrowed);
            assert_eq!(unsafe { owned.refcnt() }, REFCNT_FROM_PYPY + 1);
            assert_eq!(unsafe { bridge.from_native(owned) }.unwrap(), w_obj);
            unsafe { bridge.decref(owned) }.unwrap();
            assert_eq!(unsafe { owned.refcnt() }, REFCNT_FROM_PYPY);
        });
    }

    #[test]
    fn test_refcount_conservation() {
        let bridge = bridge();
        bridge.enter(|| {
            let obj = bridge.make_ref(bridge.heap.new_int(1)).unwrap();
            let before = unsafe { obj.refcnt() };
            for _ in 0..10 {
                unsafe { bridge.incref(obj) }.unwrap();
            }
            for _ in 0..10 {
                unsafe { bridge.decref(obj) }.unwrap();
            }
            assert_eq!(unsafe { obj.refcnt() }, before);
        });
    }

    #[test]
    fn test_drain_releases_unreferenced_mirror() {
        let bridge = bridge();
        bridge.enter(|| {
            let w_obj = bridge.heap.new_int(9);
            let obj = bridge.make_ref(w_obj).unwrap();
            // Native code holds a reference: the managed object is a root.
            bridge.heap.collect();
            assert!(bridge.heap.is_alive(w_obj));
            assert_eq!(bridge.drain_dead(), 0);

            unsafe { bridge.decref(obj) }.unwrap();
            bridge.heap.collect();
            assert!(!bridge.heap.is_alive(w_obj));
            assert_eq!(bridge.links.pending_dead(), 1);
            assert_eq!(bridge.drain_dead(), 1);
            assert!(bridge.links.native_of(w_obj).is_none());
            assert_eq!(bridge.drain_dead(), 0);
        });
    }

    #[test]
    fn test_refcount_faults() {
        let bridge = bridge();
        bridge.enter(|| {
            let linked = bridge.as_pyobj(bridge.heap.new_int(3)).unwrap();
            let err = unsafe { bridge.decref_by(linked, REFCNT_FROM_PYPY + 1) }.unwrap_err();
            assert!(matches!(err, BridgeError::RefcountUnderflow(p) if p == linked.as_ptr()));
            let err = unsafe { bridge.incref(linked) }.unwrap_err();
            assert!(matches!(err, BridgeError::IncrefOfDead(_)));
        });
    }

    #[test]
    fn test_allocate_native_instance() {
        let bridge = bridge();
        bridge.enter(|| {
            let pto = bridge
                .as_pyobj(bridge.heap.ctx.object_type)
                .unwrap()
                .as_ptr()
                .cast();
            let obj = unsafe { bridge.allocate(pto, 0) }.unwrap();
            assert_eq!(unsafe { obj.refcnt() }, 1);
            assert!(unsafe { bridge.links.managed_of(obj) }.is_none());

            let w_obj = unsafe { bridge.from_native(obj) }.unwrap();
            assert!(bridge.heap.isinstance(w_obj, bridge.heap.ctx.object_type));
            assert_eq!(unsafe { obj.refcnt() }, 1 + REFCNT_FROM_PYPY);
            assert_eq!(unsafe { bridge.from_native(obj) }.unwrap(), w_obj);
            unsafe { bridge.decref(obj) }.unwrap();
        });
    }

    #[test]
    fn test_dealloc_runs_once_when_last_reference_goes() {
        let bridge = bridge();
        bridge.enter(|| {
            let mut t = PyTypeObject::new_static(c"test.Counted", size_of::<PyObject>());
            t.tp_dealloc = Some(counted_dealloc);
            let pto = Box::into_raw(Box::new(t));
            unsafe { bridge.type_ready(pto) }.unwrap();

            for increfs in 0..4 {
                let before = COUNTED_DEALLOCS.load(Ordering::SeqCst);
                let obj = unsafe { bridge.allocate(pto, 0) }.unwrap();
                for _ in 0..increfs {
                    unsafe { bridge.incref(obj) }.unwrap();
                }
                for _ in 0..increfs {
                    unsafe { bridge.decref(obj) }.unwrap();
                    assert_eq!(COUNTED_DEALLOCS.load(Ordering::SeqCst), before);
                }
                assert_eq!(unsafe { obj.refcnt() }, 1);
                unsafe { bridge.decref(obj) }.unwrap();
                assert_eq!(COUNTED_DEALLOCS.load(Ordering::SeqCst), before + 1);
            }
        });
    }

    #[test]
    fn test_track_reference_to_dead_object() {
        let bridge = bridge();
        bridge.enter(|| {
            let w_dead = bridge.heap.new_int(8);
            bridge.heap.collect();
            assert!(!bridge.heap.is_alive(w_dead));

            let pto = bridge
                .as_pyobj(bridge.heap.ctx.object_type)
                .unwrap()
                .as_ptr()
                .cast();
            let obj = unsafe { bridge.allocate(pto, 0) }.unwrap();
            let err = unsafe { bridge.track_reference(obj, w_dead) }.unwrap_err();
            assert!(matches!(err, BridgeError::DeadObject(w) if w == w_dead));
            assert_eq!(unsafe { obj.link() }, None);
            assert_eq!(unsafe { obj.refcnt() }, 1);
            assert!(bridge.links.native_of(w_dead).is_none());
            unsafe { bridge.decref(obj) }.unwrap();
        });
    }
}
