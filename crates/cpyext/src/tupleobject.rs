//! `tuple`: the native object owns a reference to each item.
//!
//! Native code may fill a tuple it created with `PyTuple_SetItem` until the
//! tuple is first handed to managed code. From then on the tuple is linked
//! and immutable on both sides.

use crate::{
    Bridge,
    abi::{Py_ssize_t, PyObject, PyTypeFlags, PyTypeObject, PyVarObject},
    api::ErrorValue,
    cpython_api,
    error::{BridgeError, BridgeResult},
    object,
    rawrefcount::PyObjectPtr,
    typedescr::TypeDescrSpec,
};
use core::ffi::c_int;
use pybridge_vm::{ObjectId, TypeFamily};

#[repr(C)]
#[derive(Debug)]
pub struct PyTupleObject {
    pub ob_base: PyVarObject,
    pub ob_item: *mut *mut PyObject,
}

pub(crate) const TYPEDESCR: TypeDescrSpec = TypeDescrSpec {
    basicsize: Some(size_of::<PyTupleObject>()),
    alloc: Some(tuple_alloc),
    attach: Some(tuple_attach),
    realize: Some(tuple_realize),
    dealloc: Some(tuple_dealloc_wrapper),
    ..TypeDescrSpec::new(TypeFamily::Tuple)
};

/// Gives `tuple` a zeroed item array of `len` entries.
unsafe fn alloc_items(bridge: &Bridge, tuple: *mut PyTupleObject, len: Py_ssize_t) -> BridgeResult<()> {
    let Ok(count) = usize::try_from(len) else {
        return Err(bridge.heap.new_system_error("negative tuple size").into());
    };
    if count > 0 {
        // SAFETY: plain C allocation, checked for null below.
        let items = unsafe { libc::calloc(count, size_of::<*mut PyObject>()) };
        if items.is_null() {
            return Err(BridgeError::NoMemory(count * size_of::<*mut PyObject>()));
        }
        unsafe { (*tuple).ob_item = items.cast() };
    }
    unsafe { (*tuple).ob_base.ob_size = len };
    Ok(())
}

/// # Safety
/// `tuple` must be a live tuple object.
unsafe fn items_of<'a>(tuple: *mut PyTupleObject) -> &'a mut [*mut PyObject] {
    unsafe {
        let items = (*tuple).ob_item;
        let len = (*tuple).ob_base.ob_size;
        if items.is_null() || len <= 0 {
            return &mut [];
        }
        core::slice::from_raw_parts_mut(items, len as usize)
    }
}

unsafe fn tuple_alloc(
    bridge: &Bridge,
    w_type: ObjectId,
    itemcount: Py_ssize_t,
) -> BridgeResult<PyObjectPtr> {
    let obj = unsafe { object::object_alloc(bridge, w_type, 0)? };
    if let Err(err) = unsafe { alloc_items(bridge, obj.as_ptr().cast(), itemcount) } {
        unsafe { bridge.decref(obj)? };
        return Err(err);
    }
    Ok(obj)
}

unsafe fn tuple_attach(bridge: &Bridge, obj: PyObjectPtr, w_obj: ObjectId) -> BridgeResult<()> {
    let heap = &bridge.heap;
    let w_items = heap
        .tuple_items(w_obj)
        .ok_or_else(|| heap.new_type_error(format!("'{}' is not a tuple", heap.class_name(w_obj))))?;
    let tuple = obj.as_ptr().cast::<PyTupleObject>();
    unsafe { alloc_items(bridge, tuple, w_items.len() as Py_ssize_t)? };
    let items = unsafe { items_of(tuple) };
    for (slot, w_item) in items.iter_mut().zip(w_items) {
        *slot = bridge.make_ref(w_item)?.as_ptr();
    }
    Ok(())
}

unsafe fn tuple_realize(bridge: &Bridge, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
    let heap = &bridge.heap;
    let w_type = unsafe { object::native_type_of(bridge, obj)? };
    let items = unsafe { items_of(obj.as_ptr().cast()) };
    let mut w_items = Vec::with_capacity(items.len());
    for &item in items.iter() {
        let item = PyObjectPtr::new(item)
            .ok_or_else(|| heap.new_system_error("tuple passed to managed code has a NULL item"))?;
        w_items.push(unsafe { bridge.from_native(item)? });
    }
    let w_obj = heap.new_tuple_of(w_type, w_items)?;
    unsafe { bridge.track_reference(obj, w_obj)? };
    Ok(w_obj)
}

/// A tuple owned by native code alone, never linked unless something later
/// realizes it. Steals a reference to each of `items`.
///
/// # Safety
/// Every item must be a live native object the caller owns a reference to.
pub(crate) unsafe fn new_tuple(bridge: &Bridge, items: Vec<PyObjectPtr>) -> BridgeResult<PyObjectPtr> {
    let tuple = match unsafe { tuple_alloc(bridge, bridge.heap.ctx.tuple_type, items.len() as Py_ssize_t) } {
        Ok(tuple) => tuple,
        Err(err) => {
            for item in items {
                unsafe { bridge.decref(item)? };
            }
            return Err(err);
        }
    };
    let slots = unsafe { items_of(tuple.as_ptr().cast()) };
    for (slot, item) in slots.iter_mut().zip(items) {
        *slot = item.as_ptr();
    }
    Ok(tuple)
}

fn is_tuple(obj: *mut PyObject) -> bool {
    // SAFETY: callers pass live objects; a typeless one is not a tuple.
    unsafe { (*obj).ob_type.as_ref() }
        .is_some_and(|pto: &PyTypeObject| pto.flags().contains(PyTypeFlags::TUPLE_SUBCLASS))
}

cpython_api! {
    #[api(error = ErrorValue::CannotFail, gil = None)]
    /// `tp_dealloc` of `tuple`.
    pub fn tuple_dealloc(bridge, obj: *mut PyObject) -> () {
        let tuple = obj.cast::<PyTupleObject>();
        unsafe {
            for item in items_of(tuple) {
                bridge.xdecref(core::mem::replace(item, core::ptr::null_mut()))?;
            }
            libc::free((*tuple).ob_item.cast());
            (*tuple).ob_item = core::ptr::null_mut();
        }
        object::object_dealloc(bridge, obj)
    }
}

cpython_api! {
    #[api(export = "PyTuple_New", error = ErrorValue::Null, gil = None)]
    /// A native-born tuple of `size` NULL items, to be filled with
    /// `PyTuple_SetItem`.
    pub fn tuple_new(bridge, size: Py_ssize_t) -> *mut PyObject {
        if size < 0 {
            return Err(bridge.heap.new_system_error("negative tuple size").into());
        }
        let tuple = unsafe { tuple_alloc(bridge, bridge.heap.ctx.tuple_type, size)? };
        Ok(tuple.as_ptr())
    }
}

cpython_api! {
    #[api(export = "PyTuple_Size", error = ErrorValue::Int(-1), gil = None)]
    pub fn tuple_size(bridge, obj: *mut PyObject) -> Py_ssize_t {
        if obj.is_null() || !is_tuple(obj) {
            return Err(bridge.heap.new_system_error("bad argument to internal function").into());
        }
        Ok(unsafe { (*obj.cast::<PyVarObject>()).ob_size })
    }
}

cpython_api! {
    #[api(export = "PyTuple_GetItem", error = ErrorValue::Null, gil = None)]
    /// The item at `index`, borrowed.
    pub fn tuple_get_item(bridge, obj: *mut PyObject, index: Py_ssize_t) -> *mut PyObject {
        if obj.is_null() || !is_tuple(obj) {
            return Err(bridge.heap.new_system_error("bad argument to internal function").into());
        }
        let items = unsafe { items_of(obj.cast()) };
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i).copied())
            .ok_or_else(|| bridge.heap.new_index_error("tuple index out of range").into())
    }
}

cpython_api! {
    #[api(export = "PyTuple_SetItem", error = ErrorValue::Int(-1), gil = None)]
    /// Stores `value` at `index`, stealing the reference even on failure.
    /// Only tuples no managed code has seen yet may be filled.
    pub fn tuple_set_item(bridge, obj: *mut PyObject, index: Py_ssize_t, value: *mut PyObject) -> c_int {
        let heap = &bridge.heap;
        let target = PyObjectPtr::new(obj).filter(|obj| is_tuple(obj.as_ptr()));
        let linked = target.is_some_and(|obj| unsafe { obj.link() }.is_some());
        let Some(target) = target.filter(|_| !linked) else {
            unsafe { bridge.xdecref(value)? };
            let message = if linked {
                "PyTuple_SetItem called on a tuple that is already visible to managed code"
            } else {
                "bad argument to internal function"
            };
            return Err(heap.new_system_error(message).into());
        };
        let items = unsafe { items_of(target.as_ptr().cast()) };
        let Some(slot) = usize::try_from(index).ok().and_then(|i| items.get_mut(i)) else {
            unsafe { bridge.xdecref(value)? };
            return Err(heap.new_index_error("tuple assignment index out of range").into());
        };
        let old = core::mem::replace(slot, value);
        unsafe { bridge.xdecref(old)? };
        Ok(0)
    }
}

cpython_api! {
    #[api(export = "PyTuple_Check", error = ErrorValue::CannotFail, gil = None)]
    pub fn tuple_check(bridge, w_obj: ObjectId) -> c_int {
        Ok(bridge.heap.isinstance(w_obj, bridge.heap.ctx.tuple_type).into())
    }
}

cpython_api! {
    #[api(export = "PyTuple_CheckExact", error = ErrorValue::CannotFail, gil = None)]
    pub fn tuple_check_exact(bridge, w_obj: ObjectId) -> c_int {
        Ok((bridge.heap.class_of(w_obj) == Some(bridge.heap.ctx.tuple_type)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Settings, abi::REFCNT_FROM_PYPY};
    use pybridge_vm::Heap;
    use std::sync::Arc;

    fn bridge() -> Arc<Bridge> {
        Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap()
    }

    #[test]
    fn test_attach_mirrors_items() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let w_a = heap.new_int(1);
            let w_b = heap.new_str("b");
            let w_tuple = heap.new_tuple(vec![w_a, w_b]);
            let tuple = bridge.as_pyobj(w_tuple).unwrap().as_ptr();
            unsafe {
                assert_eq!(tuple_size_wrapper(tuple), 2);
                let a = tuple_get_item_wrapper(tuple, 0);
                assert_eq!(a, bridge.links.native_of(w_a).unwrap().as_ptr());
                // The tuple's own reference on top of the bias.
                assert_eq!(PyObjectPtr::new(a).unwrap().refcnt(), REFCNT_FROM_PYPY + 1);

                assert!(tuple_get_item_wrapper(tuple, 2).is_null());
                let exc = bridge.errors.fetch().unwrap();
                assert_eq!(exc.exc_type, heap.ctx.exceptions.index_error);
                assert_eq!(exc.message, "tuple index out of range");
            }
        });
    }

    #[test]
    fn test_fill_then_realize() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let tuple = unsafe { tuple_new_wrapper(2) };
            assert!(!tuple.is_null());
            unsafe {
                let one = bridge.make_ref(heap.new_int(1)).unwrap().as_ptr();
                let two = bridge.make_ref(heap.new_int(2)).unwrap().as_ptr();
                assert_eq!(tuple_set_item_wrapper(tuple, 0, one), 0);
                assert_eq!(tuple_set_item_wrapper(tuple, 1, two), 0);

                let w_tuple = bridge.from_ref(tuple).unwrap().unwrap();
                let w_items = heap.tuple_items(w_tuple).unwrap();
                assert_eq!(
                    w_items.iter().map(|&w| heap.int_value(w)).collect::<Vec<_>>(),
                    [Some(1), Some(2)]
                );

                // Linked now, so no more mutation.
                let three = bridge.make_ref(heap.new_int(3)).unwrap();
                assert_eq!(tuple_set_item_wrapper(tuple, 0, three.as_ptr()), -1);
                assert_eq!(bridge.errors.fetch().unwrap().exc_type, heap.ctx.exceptions.system_error);
                assert_eq!(three.refcnt(), REFCNT_FROM_PYPY);
            }
        });
    }

    #[test]
    fn test_realize_rejects_null_item() {
        let bridge = bridge();
        bridge.enter(|| {
            let tuple = unsafe { tuple_new_wrapper(1) };
            let err = unsafe { bridge.from_ref(tuple) }.unwrap_err();
            let BridgeError::Exception(exc) = err else {
                panic!("expected an exception, got {err}");
            };
            assert_eq!(exc.exc_type, bridge.heap.ctx.exceptions.system_error);
            assert_eq!(unsafe { PyObjectPtr::new(tuple).unwrap().link() }, None);
            unsafe { bridge.decref(PyObjectPtr::new(tuple).unwrap()) }.unwrap();
        });
    }

    #[test]
    fn test_dealloc_releases_items() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let w_item = heap.new_int(5);
            let _root = heap.root(w_item);
            let item = bridge.make_ref(w_item).unwrap();
            let tuple = unsafe { new_tuple(&bridge, vec![item]) }.unwrap();
            assert_eq!(unsafe { item.refcnt() }, REFCNT_FROM_PYPY + 1);
            unsafe { bridge.decref(tuple) }.unwrap();
            assert_eq!(unsafe { item.refcnt() }, REFCNT_FROM_PYPY);
        });
    }

    #[test]
    fn test_failed_item_unwinds_tuple() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let w_item = heap.new_int(4);
            let w_bad = heap
                .new_class("Bad\0Item", vec![], indexmap::IndexMap::new())
                .unwrap();
            let w_tuple = heap.new_tuple(vec![w_item, w_bad]);
            let _root = heap.root(w_tuple);

            assert!(bridge.as_pyobj(w_tuple).is_err());
            assert!(bridge.links.native_of(w_tuple).is_none());
            assert!(bridge.links.native_of(w_bad).is_none());
            // The discarded tuple gave back its reference to the first item.
            let item = bridge.links.native_of(w_item).unwrap();
            assert_eq!(unsafe { item.refcnt() }, REFCNT_FROM_PYPY);
        });
    }

    #[test]
    fn test_bad_arguments() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            assert!(unsafe { tuple_new_wrapper(-1) }.is_null());
            assert!(bridge.errors.fetch().is_some());

            let not_tuple = bridge.as_pyobj(heap.new_int(0)).unwrap().as_ptr();
            assert_eq!(unsafe { tuple_size_wrapper(not_tuple) }, -1);
            assert_eq!(
                bridge.errors.fetch().unwrap().exc_type,
                heap.ctx.exceptions.system_error
            );
        });
    }

    #[test]
    fn test_tuple_check() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let tuple = bridge.as_pyobj(heap.new_tuple(vec![])).unwrap().as_ptr();
            let int = bridge.as_pyobj(heap.new_int(0)).unwrap().as_ptr();
            unsafe {
                assert_eq!(tuple_check_wrapper(tuple), 1);
                assert_eq!(tuple_check_exact_wrapper(tuple), 1);
                assert_eq!(tuple_check_wrapper(int), 0);
                assert_eq!(tuple_check_exact_wrapper(int), 0);
            }
        });
    }
}
