//! The default strategy every family falls back to, and the generic object
//! functions exported to native code.

use crate::{
    Bridge,
    abi::{Py_ssize_t, PyObject, PyTypeObject},
    api::ErrorValue,
    cpython_api,
    error::{BridgeError, BridgeResult},
    rawrefcount::PyObjectPtr,
    typedescr::TypeDescrSpec,
};
use core::ffi::{c_int, c_void};
use pybridge_vm::{ObjectId, TypeFamily};

pub(crate) const TYPEDESCR: TypeDescrSpec = TypeDescrSpec {
    basicsize: Some(size_of::<PyObject>()),
    alloc: Some(object_alloc),
    attach: Some(object_attach),
    realize: Some(object_realize),
    dealloc: Some(object_dealloc_wrapper),
    ..TypeDescrSpec::new(TypeFamily::Object)
};

/// Allocates through the native descriptor of `w_type`.
pub(crate) unsafe fn object_alloc(
    bridge: &Bridge,
    w_type: ObjectId,
    itemcount: Py_ssize_t,
) -> BridgeResult<PyObjectPtr> {
    let pto = bridge.as_pyobj(w_type)?.as_ptr().cast::<PyTypeObject>();
    unsafe { bridge.allocate(pto, itemcount) }
}

pub(crate) unsafe fn object_attach(
    _bridge: &Bridge,
    _obj: PyObjectPtr,
    _w_obj: ObjectId,
) -> BridgeResult<()> {
    Ok(())
}

/// A plain instance of the object's (already realized) type.
pub(crate) unsafe fn object_realize(bridge: &Bridge, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
    let w_type = unsafe { native_type_of(bridge, obj)? };
    let w_obj = bridge.heap.new_instance(w_type)?;
    unsafe { bridge.track_reference(obj, w_obj)? };
    Ok(w_obj)
}

/// The managed type of a native object.
///
/// # Safety
/// `obj` must be a live native object.
pub(crate) unsafe fn native_type_of(bridge: &Bridge, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
    let ob_type = unsafe { (*obj.as_ptr()).ob_type };
    let ob_type = PyObjectPtr::new(ob_type.cast()).ok_or(BridgeError::NullPointer)?;
    unsafe { bridge.from_native(ob_type) }
}

cpython_api! {
    #[api(error = ErrorValue::CannotFail, gil = None)]
    /// `tp_dealloc` of the base object layout: frees the memory and drops
    /// the instance's reference to a heap type.
    pub fn object_dealloc(bridge, obj: *mut PyObject) -> () {
        let pto = unsafe { (*obj).ob_type };
        let tp_free = unsafe { pto.as_ref() }.and_then(|pto| pto.tp_free);
        match tp_free {
            Some(free) => unsafe { bridge.generic_cpy_call(|| free(obj.cast())) },
            None => unsafe { libc::free(obj.cast()) },
        }
        if unsafe { pto.as_ref() }.is_some_and(PyTypeObject::is_heap_type) {
            unsafe { bridge.xdecref(pto.cast())? };
        }
        Ok(())
    }
}

cpython_api! {
    #[api(export = "PyObject_Free", error = ErrorValue::CannotFail, gil = None)]
    pub fn object_free(bridge, ptr: *mut c_void) -> () {
        unsafe { libc::free(ptr) };
        Ok(())
    }
}

cpython_api! {
    #[api(export = "_Py_Dealloc", error = ErrorValue::CannotFail, gil = None)]
    pub fn py_dealloc(bridge, obj: *mut PyObject) -> () {
        let obj = PyObjectPtr::new(obj).ok_or(BridgeError::NullPointer)?;
        unsafe { bridge.dealloc(obj) };
        Ok(())
    }
}

cpython_api! {
    #[api(export = "Py_IncRef", error = ErrorValue::CannotFail, gil = None)]
    pub fn py_incref(bridge, obj: *mut PyObject) -> () {
        unsafe { bridge.xincref(obj) }
    }
}

cpython_api! {
    #[api(export = "Py_DecRef", error = ErrorValue::CannotFail, gil = None)]
    pub fn py_decref(bridge, obj: *mut PyObject) -> () {
        unsafe { bridge.xdecref(obj) }
    }
}

cpython_api! {
    #[api(export = "_Py_NewReference", error = ErrorValue::CannotFail, gil = None)]
    /// Starts the life of a native-born object: one native reference, and a
    /// managed peer realized through its type's strategy.
    pub fn py_new_reference(bridge, obj: *mut PyObject) -> () {
        let obj = PyObjectPtr::new(obj).ok_or(BridgeError::NullPointer)?;
        if let Some(w_obj) = unsafe { obj.link() } {
            return Err(bridge
                .heap
                .new_system_error(format!("_Py_NewReference on an object already linked to {w_obj}"))
                .into());
        }
        unsafe {
            (*obj.as_ptr())
                .ob_refcnt
                .store(1, core::sync::atomic::Ordering::Release);
            bridge.from_native(obj)?;
        }
        Ok(())
    }
}

cpython_api! {
    #[api(export = "_PyObject_New", error = ErrorValue::Null, gil = None)]
    pub fn object_new(bridge, pto: *mut PyTypeObject) -> *mut PyObject {
        object_new_var(bridge, pto, 0)
    }
}

cpython_api! {
    #[api(export = "_PyObject_NewVar", error = ErrorValue::Null, gil = None)]
    /// A new native instance of `pto`, allocated by its family's strategy.
    pub fn object_new_var(bridge, pto: *mut PyTypeObject, itemcount: Py_ssize_t) -> *mut PyObject {
        let type_obj = PyObjectPtr::new(pto.cast()).ok_or(BridgeError::NullPointer)?;
        let w_type = unsafe { bridge.from_native(type_obj)? };
        let family = bridge
            .heap
            .type_family(w_type)
            .ok_or(BridgeError::NotAType(w_type))?;
        let typedescr = bridge.typedescrs.get(family);
        let obj = unsafe { (typedescr.alloc)(bridge, w_type, itemcount)? };
        Ok(obj.as_ptr())
    }
}

fn attribute_name(bridge: &Bridge, w_name: ObjectId) -> BridgeResult<String> {
    bridge.heap.str_value(w_name).ok_or_else(|| {
        bridge
            .heap
            .new_type_error(format!(
                "attribute name must be string, not '{}'",
                bridge.heap.class_name(w_name)
            ))
            .into()
    })
}

cpython_api! {
    #[api(export = "PyObject_GenericGetAttr", error = ErrorValue::Null, gil = None)]
    pub fn object_generic_getattr(bridge, w_obj: ObjectId, w_name: ObjectId) -> ObjectId {
        let name = attribute_name(bridge, w_name)?;
        Ok(bridge.heap.getattr(w_obj, &name)?)
    }
}

cpython_api! {
    #[api(export = "PyObject_GenericSetAttr", error = ErrorValue::Int(-1), gil = None)]
    /// A NULL `value` deletes the attribute.
    pub fn object_generic_setattr(
        bridge,
        w_obj: ObjectId,
        w_name: ObjectId,
        value: Option<ObjectId>,
    ) -> c_int {
        let name = attribute_name(bridge, w_name)?;
        match value {
            Some(value) => bridge.heap.setattr(w_obj, &name, value)?,
            None => bridge.heap.delattr(w_obj, &name)?,
        }
        Ok(0)
    }
}
