//! A bridge that lets native extension code, written against the refcounted
//! C object ABI, operate on objects owned by a tracing-GC managed heap.
//!
//! The pieces:
//!
//! * [`rawrefcount`]: the bidirectional link table between managed identities
//!   and native addresses, and how links keep either side alive;
//! * the native object lifecycle on [`Bridge`]: allocation, reference counting,
//!   attaching managed objects to native mirrors and realizing native-born
//!   objects as managed ones;
//! * [`typedescr`] and [`typeobject`]: per-family layout strategies, and type
//!   descriptors synthesized in both directions;
//! * [`api`]: the boundary every native-callable function goes through.

#![allow(clippy::missing_safety_doc)]

#[macro_use]
extern crate log;

pub mod abi;
pub mod api;
mod bridge;
pub mod error;
pub mod intobject;
pub mod object;
mod pyobject;
pub mod pyerrors;
pub mod rawrefcount;
pub mod settings;
pub mod slotdefs;
pub mod tupleobject;
pub mod typedescr;
pub mod typeobject;

pub use api::{ApiFunction, get_wrapper};
pub use bridge::Bridge;
pub use error::{BridgeError, BridgeResult, OrFatal, fatal_error};
pub use rawrefcount::{LinkTable, PyObjectPtr};
pub use settings::{Settings, TypeInitPolicy};

/// Every function the bridge offers native code, exported or internal.
pub static FUNCTIONS: &[&ApiFunction] = &[
    // object
    &object::OBJECT_DEALLOC,
    &object::OBJECT_FREE,
    &object::PY_DEALLOC,
    &object::PY_INCREF,
    &object::PY_DECREF,
    &object::PY_NEW_REFERENCE,
    &object::OBJECT_NEW,
    &object::OBJECT_NEW_VAR,
    &object::OBJECT_GENERIC_GETATTR,
    &object::OBJECT_GENERIC_SETATTR,
    // errors
    &pyerrors::ERR_OCCURRED,
    &pyerrors::ERR_CLEAR,
    &pyerrors::ERR_SET_STRING,
    &pyerrors::ERR_SET_NONE,
    &pyerrors::ERR_BAD_INTERNAL_CALL,
    &pyerrors::ERR_NO_MEMORY,
    &pyerrors::ERR_EXCEPTION_MATCHES,
    // types
    &typeobject::TYPE_DEALLOC,
    &typeobject::SUBTYPE_DEALLOC,
    &typeobject::TYPE_READY,
    &typeobject::TYPE_IS_SUBTYPE,
    &typeobject::TYPE_GENERIC_ALLOC,
    &typeobject::TYPE_GENERIC_NEW,
    &typeobject::TYPE_LOOKUP,
    &typeobject::TYPE_MODIFIED,
    &typeobject::TYPE_CHECK,
    &typeobject::TYPE_CHECK_EXACT,
    // int
    &intobject::LONG_FROM_LONG,
    &intobject::LONG_AS_LONG,
    &intobject::BOOL_FROM_LONG,
    &intobject::LONG_CHECK,
    &intobject::LONG_CHECK_EXACT,
    // tuple
    &tupleobject::TUPLE_DEALLOC,
    &tupleobject::TUPLE_NEW,
    &tupleobject::TUPLE_SIZE,
    &tupleobject::TUPLE_GET_ITEM,
    &tupleobject::TUPLE_SET_ITEM,
    &tupleobject::TUPLE_CHECK,
    &tupleobject::TUPLE_CHECK_EXACT,
    // generic slots
    &slotdefs::SLOT_TP_REPR,
    &slotdefs::SLOT_TP_STR,
    &slotdefs::SLOT_TP_HASH,
    &slotdefs::SLOT_TP_CALL,
    &slotdefs::SLOT_TP_INIT,
    &slotdefs::SLOT_TP_ITER,
    &slotdefs::SLOT_TP_ITERNEXT,
    &slotdefs::SLOT_TP_RICHCOMPARE,
    &slotdefs::SLOT_NB_ADD,
    &slotdefs::SLOT_NB_SUBTRACT,
    &slotdefs::SLOT_NB_MULTIPLY,
    &slotdefs::SLOT_NB_NEGATIVE,
    &slotdefs::SLOT_NB_BOOL,
    &slotdefs::SLOT_NB_INT,
    &slotdefs::SLOT_NB_INDEX,
    &slotdefs::SLOT_SQ_LENGTH,
    &slotdefs::SLOT_SQ_ITEM,
    &slotdefs::SLOT_SQ_CONTAINS,
    &slotdefs::SLOT_MP_LENGTH,
    &slotdefs::SLOT_MP_SUBSCRIPT,
    &slotdefs::SLOT_MP_ASS_SUBSCRIPT,
];

/// Looks a function up by its Rust name or its exported C name.
pub fn find_function(name: &str) -> Option<&'static ApiFunction> {
    FUNCTIONS
        .iter()
        .copied()
        .find(|func| func.name == name || func.export == Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_function_table_is_unique() {
        let mut names = HashSet::new();
        let mut exports = HashSet::new();
        for func in FUNCTIONS {
            assert!(names.insert(func.name), "{} listed twice", func.name);
            if let Some(export) = func.export {
                assert!(exports.insert(export), "{export} exported twice");
            }
            assert!(!func.wrapper().is_null());
        }
        assert!(exports.contains("PyType_Ready"));
    }

    #[test]
    fn test_find_function() {
        let by_export = find_function("PyTuple_GetItem").unwrap();
        assert_eq!(by_export.name, "tuple_get_item");
        let by_name = find_function("tuple_get_item").unwrap();
        assert!(core::ptr::eq(by_export, by_name));
        assert!(find_function("slot_tp_repr").unwrap().export.is_none());
        assert!(find_function("PyList_New").is_none());
    }
}
