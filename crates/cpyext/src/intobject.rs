//! `int` and its subclasses: the value is copied into the native object.

use crate::{
    Bridge,
    abi::PyObject,
    api::ErrorValue,
    cpython_api,
    error::BridgeResult,
    object,
    rawrefcount::PyObjectPtr,
    typedescr::TypeDescrSpec,
};
use core::ffi::{c_int, c_long};
use pybridge_vm::{ObjectId, TypeFamily};

#[repr(C)]
#[derive(Debug)]
pub struct PyIntObject {
    pub ob_base: PyObject,
    pub ob_ival: c_long,
}

pub(crate) const TYPEDESCR: TypeDescrSpec = TypeDescrSpec {
    basicsize: Some(size_of::<PyIntObject>()),
    attach: Some(int_attach),
    realize: Some(int_realize),
    ..TypeDescrSpec::new(TypeFamily::Int)
};

fn as_c_long(bridge: &Bridge, w_obj: ObjectId) -> BridgeResult<c_long> {
    let heap = &bridge.heap;
    let value = heap
        .int_value(w_obj)
        .ok_or_else(|| heap.new_type_error("an integer is required"))?;
    c_long::try_from(value)
        .map_err(|_| heap.new_overflow_error("Python int too large to convert to C long").into())
}

unsafe fn int_attach(bridge: &Bridge, obj: PyObjectPtr, w_obj: ObjectId) -> BridgeResult<()> {
    let ival = as_c_long(bridge, w_obj)?;
    unsafe { (*obj.as_ptr().cast::<PyIntObject>()).ob_ival = ival };
    Ok(())
}

unsafe fn int_realize(bridge: &Bridge, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
    let w_type = unsafe { object::native_type_of(bridge, obj)? };
    let ival = unsafe { (*obj.as_ptr().cast::<PyIntObject>()).ob_ival };
    let w_obj = bridge.heap.new_int_of(w_type, ival.into())?;
    unsafe { bridge.track_reference(obj, w_obj)? };
    Ok(w_obj)
}

cpython_api! {
    #[api(export = "PyLong_FromLong", error = ErrorValue::Null, gil = None)]
    pub fn long_from_long(bridge, value: c_long) -> ObjectId {
        Ok(bridge.heap.new_int(value.into()))
    }
}

cpython_api! {
    #[api(export = "PyLong_AsLong", error = ErrorValue::Int(-1), gil = None)]
    pub fn long_as_long(bridge, w_obj: ObjectId) -> c_long {
        as_c_long(bridge, w_obj)
    }
}

cpython_api! {
    #[api(export = "PyBool_FromLong", error = ErrorValue::Null, gil = None)]
    pub fn bool_from_long(bridge, value: c_long) -> ObjectId {
        Ok(bridge.heap.new_bool(value != 0))
    }
}

cpython_api! {
    #[api(export = "PyLong_Check", error = ErrorValue::CannotFail, gil = None)]
    /// True for `bool` too.
    pub fn long_check(bridge, w_obj: ObjectId) -> c_int {
        Ok(bridge.heap.isinstance(w_obj, bridge.heap.ctx.int_type).into())
    }
}

cpython_api! {
    #[api(export = "PyLong_CheckExact", error = ErrorValue::CannotFail, gil = None)]
    pub fn long_check_exact(bridge, w_obj: ObjectId) -> c_int {
        Ok((bridge.heap.class_of(w_obj) == Some(bridge.heap.ctx.int_type)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Settings,
        abi::{PyTypeFlags, PyTypeObject, REFCNT_FROM_PYPY},
    };
    use indexmap::IndexMap;
    use pybridge_vm::Heap;
    use std::sync::Arc;

    fn bridge() -> Arc<Bridge> {
        Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap()
    }

    #[test]
    fn test_attach_copies_value() {
        let bridge = bridge();
        bridge.enter(|| {
            let w_int = bridge.heap.new_int(-42);
            let obj = bridge.as_pyobj(w_int).unwrap();
            unsafe {
                assert_eq!((*obj.as_ptr().cast::<PyIntObject>()).ob_ival, -42);
                assert_eq!(obj.refcnt(), REFCNT_FROM_PYPY);
                assert_eq!(long_as_long_wrapper(obj.as_ptr()), -42);
            }
        });
    }

    #[test]
    fn test_native_born_int() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let int_type = bridge.as_pyobj(heap.ctx.int_type).unwrap();
            let obj = unsafe { bridge.allocate(int_type.as_ptr().cast(), 0) }.unwrap();
            unsafe { (*obj.as_ptr().cast::<PyIntObject>()).ob_ival = 1234 };

            let w_obj = unsafe { bridge.get_w_obj_and_decref(obj) }.unwrap();
            assert_eq!(heap.int_value(w_obj), Some(1234));
            assert_eq!(heap.class_of(w_obj), Some(heap.ctx.int_type));
            assert_eq!(bridge.links.native_of(w_obj), Some(obj));
            assert_eq!(unsafe { obj.refcnt() }, REFCNT_FROM_PYPY);
        });
    }

    #[test]
    fn test_subclass_uses_int_layout() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let w_cls = heap
                .new_class("Counter", vec![heap.ctx.int_type], IndexMap::new())
                .unwrap();
            let _root = heap.root(w_cls);
            let w_obj = heap.new_int_of(w_cls, 9).unwrap();
            let obj = bridge.as_pyobj(w_obj).unwrap();
            unsafe {
                assert_eq!((*obj.as_ptr().cast::<PyIntObject>()).ob_ival, 9);
                let pto = &*(*obj.as_ptr()).ob_type.cast::<PyTypeObject>();
                assert_eq!(pto.tp_basicsize, size_of::<PyIntObject>() as isize);
                assert!(pto.flags().contains(PyTypeFlags::LONG_SUBCLASS));
            }
        });
    }

    #[test]
    fn test_long_conversions() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let seven = unsafe { long_from_long_wrapper(7) };
            let w_seven = unsafe { bridge.from_ref(seven) }.unwrap().unwrap();
            assert_eq!(heap.int_value(w_seven), Some(7));
            assert_eq!(unsafe { PyObjectPtr::new(seven).unwrap().refcnt() }, REFCNT_FROM_PYPY + 1);

            let yes = unsafe { bool_from_long_wrapper(3) };
            let w_yes = unsafe { bridge.from_ref(yes) }.unwrap().unwrap();
            assert_eq!(heap.class_of(w_yes), Some(heap.ctx.bool_type));
            assert_eq!(unsafe { long_as_long_wrapper(yes) }, 1);

            let text = bridge.as_pyobj(heap.new_str("7")).unwrap();
            assert_eq!(unsafe { long_as_long_wrapper(text.as_ptr()) }, -1);
            let exc = bridge.errors.fetch().unwrap();
            assert_eq!(exc.exc_type, heap.ctx.exceptions.type_error);
        });
    }

    #[test]
    fn test_long_check() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let int = bridge.as_pyobj(heap.new_int(1)).unwrap().as_ptr();
            let boolean = bridge.as_pyobj(heap.new_bool(true)).unwrap().as_ptr();
            let text = bridge.as_pyobj(heap.new_str("1")).unwrap().as_ptr();
            unsafe {
                assert_eq!(long_check_wrapper(int), 1);
                assert_eq!(long_check_exact_wrapper(int), 1);
                assert_eq!(long_check_wrapper(boolean), 1);
                assert_eq!(long_check_exact_wrapper(boolean), 0);
                assert_eq!(long_check_wrapper(text), 0);
            }
            assert!(bridge.errors.occurred().is_none());
        });
    }
}
