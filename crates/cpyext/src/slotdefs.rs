//! Slot definitions: which managed method each native behavior slot stands
//! for.
//!
//! [`SLOTDEFS`] drives both directions of type synthesis. A managed type that
//! defines a method gets the generic dispatcher for that method in the
//! matching slot ([`update_slots`]); a native type with a slot set gets a
//! managed function under the method name that calls through the slot
//! ([`add_operators`]).

use crate::{
    Bridge,
    abi::{
        Py_EQ, Py_GE, Py_GT, Py_LE, Py_LT, Py_NE, Py_hash_t, Py_ssize_t, PyObject, PyTypeObject,
        binaryfunc, inquiry, lenfunc, objobjargproc, objobjproc, richcmpfunc, ssizeargfunc,
        ternaryfunc, unaryfunc,
    },
    api::ErrorValue,
    cpython_api,
    error::{BridgeError, BridgeResult, fatal_error},
};
use core::ffi::c_int;
use pybridge_vm::ObjectId;

/// Distinguishes methods that share one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    /// `__delitem__` through the assignment slot, with a NULL value.
    Delete,
}

impl SlotOp {
    const COMPARE: [(Self, c_int, &'static str); 6] = [
        (Self::Lt, Py_LT, "__lt__"),
        (Self::Le, Py_LE, "__le__"),
        (Self::Eq, Py_EQ, "__eq__"),
        (Self::Ne, Py_NE, "__ne__"),
        (Self::Gt, Py_GT, "__gt__"),
        (Self::Ge, Py_GE, "__ge__"),
    ];

    /// The `Py_LT`..`Py_GE` code of a comparison.
    pub fn as_compare_op(self) -> Option<c_int> {
        Self::COMPARE
            .iter()
            .find(|(op, ..)| *op == self)
            .map(|&(_, code, _)| code)
    }

    fn compare_method(code: c_int) -> Option<&'static str> {
        Self::COMPARE
            .iter()
            .find(|&&(_, c, _)| c == code)
            .map(|&(.., name)| name)
    }
}

/// A slot function of any of the signatures the table knows.
#[derive(Clone, Copy, Debug)]
pub enum SlotFn {
    Unary(unaryfunc),
    Binary(binaryfunc),
    Ternary(ternaryfunc),
    /// `lenfunc` and `hashfunc`.
    Ssize(lenfunc),
    Inquiry(inquiry),
    SsizeArg(ssizeargfunc),
    ObjObj(objobjproc),
    ObjObjArg(objobjargproc),
    RichCmp(richcmpfunc),
}

impl SlotFn {
    /// The function's address, for identity comparisons.
    pub fn addr(self) -> usize {
        match self {
            Self::Unary(f) => f as usize,
            Self::Binary(f) => f as usize,
            Self::Ternary(f) => f as usize,
            Self::Ssize(f) => f as usize,
            Self::Inquiry(f) => f as usize,
            Self::SsizeArg(f) => f as usize,
            Self::ObjObj(f) => f as usize,
            Self::ObjObjArg(f) => f as usize,
            Self::RichCmp(f) => f as usize,
        }
    }
}

/// Address of a slot field, or `None` when it lives in a sub-table the
/// descriptor does not have.
macro_rules! slot_ptr {
    ($t:expr, tp . $field:ident) => {
        Some(unsafe { &raw mut (*$t).$field })
    };
    ($t:expr, $table:ident . $field:ident) => {{
        let table = unsafe { (*$t).$table };
        (!table.is_null()).then(|| unsafe { &raw mut (*table).$field })
    }};
}

macro_rules! slot_accessors {
    ($($variant:ident => $kind:ident $table:ident . $field:ident = $generic:ident;)*) => {
        /// A slot location in a type descriptor.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum SlotAccessor {
            $($variant,)*
        }

        impl SlotAccessor {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Field name, for diagnostics.
            pub const fn slot_name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($field),)*
                }
            }

            /// # Safety
            /// `t` must point to a live type descriptor.
            pub unsafe fn get(self, t: *mut PyTypeObject) -> Option<SlotFn> {
                match self {
                    $(Self::$variant => {
                        let slot = slot_ptr!(t, $table . $field)?;
                        unsafe { *slot }.map(SlotFn::$kind)
                    })*
                }
            }

            /// Stores `f`, or clears the slot for `None`. Returns `false` if
            /// the sub-table is missing or `f` has another signature.
            ///
            /// # Safety
            /// `t` must point to a live type descriptor.
            pub unsafe fn set(self, t: *mut PyTypeObject, f: Option<SlotFn>) -> bool {
                match (self, f) {
                    $(
                        (Self::$variant, None) => match slot_ptr!(t, $table . $field) {
                            Some(slot) => {
                                unsafe { *slot = None };
                                true
                            }
                            None => false,
                        },
                        (Self::$variant, Some(SlotFn::$kind(f))) => {
                            match slot_ptr!(t, $table . $field) {
                                Some(slot) => {
                                    unsafe { *slot = Some(f) };
                                    true
                                }
                                None => false,
                            }
                        }
                    )*
                    _ => false,
                }
            }

            /// The slot function that dispatches to the managed method.
            pub fn generic(self) -> SlotFn {
                match self {
                    $(Self::$variant => SlotFn::$kind($generic),)*
                }
            }
        }
    };
}

slot_accessors! {
    TpRepr => Unary tp.tp_repr = slot_tp_repr_wrapper;
    TpStr => Unary tp.tp_str = slot_tp_str_wrapper;
    TpHash => Ssize tp.tp_hash = slot_tp_hash_wrapper;
    TpCall => Ternary tp.tp_call = slot_tp_call_wrapper;
    TpInit => ObjObjArg tp.tp_init = slot_tp_init_wrapper;
    TpIter => Unary tp.tp_iter = slot_tp_iter_wrapper;
    TpIternext => Unary tp.tp_iternext = slot_tp_iternext_wrapper;
    TpRichcompare => RichCmp tp.tp_richcompare = slot_tp_richcompare_wrapper;
    NbAdd => Binary tp_as_number.nb_add = slot_nb_add_wrapper;
    NbSubtract => Binary tp_as_number.nb_subtract = slot_nb_subtract_wrapper;
    NbMultiply => Binary tp_as_number.nb_multiply = slot_nb_multiply_wrapper;
    NbNegative => Unary tp_as_number.nb_negative = slot_nb_negative_wrapper;
    NbBool => Inquiry tp_as_number.nb_bool = slot_nb_bool_wrapper;
    NbInt => Unary tp_as_number.nb_int = slot_nb_int_wrapper;
    NbIndex => Unary tp_as_number.nb_index = slot_nb_index_wrapper;
    SqLength => Ssize tp_as_sequence.sq_length = slot_sq_length_wrapper;
    SqItem => SsizeArg tp_as_sequence.sq_item = slot_sq_item_wrapper;
    SqContains => ObjObj tp_as_sequence.sq_contains = slot_sq_contains_wrapper;
    MpLength => Ssize tp_as_mapping.mp_length = slot_mp_length_wrapper;
    MpSubscript => Binary tp_as_mapping.mp_subscript = slot_mp_subscript_wrapper;
    MpAssSubscript => ObjObjArg tp_as_mapping.mp_ass_subscript = slot_mp_ass_subscript_wrapper;
}

/// One `(method name, slot)` correspondence.
#[derive(Clone, Copy, Debug)]
pub struct SlotDef {
    pub name: &'static str,
    pub accessor: SlotAccessor,
    pub op: Option<SlotOp>,
    pub doc: &'static str,
}

pub static SLOTDEFS: &[SlotDef] = &[
    SlotDef {
        name: "__repr__",
        accessor: SlotAccessor::TpRepr,
        op: None,
        doc: "Return repr(self).",
    },
    SlotDef {
        name: "__str__",
        accessor: SlotAccessor::TpStr,
        op: None,
        doc: "Return str(self).",
    },
    SlotDef {
        name: "__hash__",
        accessor: SlotAccessor::TpHash,
        op: None,
        doc: "Return hash(self).",
    },
    SlotDef {
        name: "__call__",
        accessor: SlotAccessor::TpCall,
        op: None,
        doc: "Call self as a function.",
    },
    SlotDef {
        name: "__init__",
        accessor: SlotAccessor::TpInit,
        op: None,
        doc: "Initialize self.",
    },
    SlotDef {
        name: "__iter__",
        accessor: SlotAccessor::TpIter,
        op: None,
        doc: "Implement iter(self).",
    },
    SlotDef {
        name: "__next__",
        accessor: SlotAccessor::TpIternext,
        op: None,
        doc: "Implement next(self).",
    },
    // Rich comparison: all share tp_richcompare
    SlotDef {
        name: "__lt__",
        accessor: SlotAccessor::TpRichcompare,
        op: Some(SlotOp::Lt),
        doc: "Return self<value.",
    },
    SlotDef {
        name: "__le__",
        accessor: SlotAccessor::TpRichcompare,
        op: Some(SlotOp::Le),
        doc: "Return self<=value.",
    },
    SlotDef {
        name: "__eq__",
        accessor: SlotAccessor::TpRichcompare,
        op: Some(SlotOp::Eq),
        doc: "Return self==value.",
    },
    SlotDef {
        name: "__ne__",
        accessor: SlotAccessor::TpRichcompare,
        op: Some(SlotOp::Ne),
        doc: "Return self!=value.",
    },
    SlotDef {
        name: "__gt__",
        accessor: SlotAccessor::TpRichcompare,
        op: Some(SlotOp::Gt),
        doc: "Return self>value.",
    },
    SlotDef {
        name: "__ge__",
        accessor: SlotAccessor::TpRichcompare,
        op: Some(SlotOp::Ge),
        doc: "Return self>=value.",
    },
    // Number protocol
    SlotDef {
        name: "__add__",
        accessor: SlotAccessor::NbAdd,
        op: None,
        doc: "Return self+value.",
    },
    SlotDef {
        name: "__sub__",
        accessor: SlotAccessor::NbSubtract,
        op: None,
        doc: "Return self-value.",
    },
    SlotDef {
        name: "__mul__",
        accessor: SlotAccessor::NbMultiply,
        op: None,
        doc: "Return self*value.",
    },
    SlotDef {
        name: "__neg__",
        accessor: SlotAccessor::NbNegative,
        op: None,
        doc: "-self",
    },
    SlotDef {
        name: "__bool__",
        accessor: SlotAccessor::NbBool,
        op: None,
        doc: "True if self else False",
    },
    SlotDef {
        name: "__int__",
        accessor: SlotAccessor::NbInt,
        op: None,
        doc: "int(self)",
    },
    SlotDef {
        name: "__index__",
        accessor: SlotAccessor::NbIndex,
        op: None,
        doc: "Return self converted to an integer, if self is suitable for use as an index into a list.",
    },
    // Sequence and mapping protocols; __len__ and __getitem__ fill both
    SlotDef {
        name: "__len__",
        accessor: SlotAccessor::SqLength,
        op: None,
        doc: "Return len(self).",
    },
    SlotDef {
        name: "__len__",
        accessor: SlotAccessor::MpLength,
        op: None,
        doc: "Return len(self).",
    },
    SlotDef {
        name: "__getitem__",
        accessor: SlotAccessor::MpSubscript,
        op: None,
        doc: "Return self[key].",
    },
    SlotDef {
        name: "__getitem__",
        accessor: SlotAccessor::SqItem,
        op: None,
        doc: "Return self[key].",
    },
    SlotDef {
        name: "__contains__",
        accessor: SlotAccessor::SqContains,
        op: None,
        doc: "Return key in self.",
    },
    SlotDef {
        name: "__setitem__",
        accessor: SlotAccessor::MpAssSubscript,
        op: None,
        doc: "Set self[key] to value.",
    },
    SlotDef {
        name: "__delitem__",
        accessor: SlotAccessor::MpAssSubscript,
        op: Some(SlotOp::Delete),
        doc: "Delete self[key].",
    },
];

/// # Safety
/// `pto` must point to a live type descriptor.
unsafe fn install(bridge: &Bridge, pto: *mut PyTypeObject, accessor: SlotAccessor, f: SlotFn) {
    if !unsafe { accessor.set(pto, Some(f)) } && bridge.settings.warn_missing_slots {
        warn!(
            "type '{}' has no table for {}",
            unsafe { (*pto).name() },
            accessor.slot_name()
        );
    }
}

/// Fills every slot of `pto` that is still empty: with the generic
/// dispatcher when `w_type` defines the method itself, else with the slot
/// of `tp_base`.
///
/// # Safety
/// `pto` and its `tp_base`, if any, must be live type descriptors.
pub(crate) unsafe fn update_slots(bridge: &Bridge, pto: *mut PyTypeObject, w_type: ObjectId) {
    for def in SLOTDEFS {
        if unsafe { def.accessor.get(pto) }.is_none() && bridge.heap.defines(w_type, def.name) {
            unsafe { install(bridge, pto, def.accessor, def.accessor.generic()) };
        }
    }
    let base = unsafe { (*pto).tp_base };
    if base.is_null() {
        return;
    }
    for &accessor in SlotAccessor::ALL {
        if unsafe { accessor.get(pto) }.is_some() {
            continue;
        }
        if let Some(inherited) = unsafe { accessor.get(base) } {
            unsafe { install(bridge, pto, accessor, inherited) };
        }
    }
}

/// Recomputes all slots of a type whose dict changed.
///
/// # Safety
/// As for [`update_slots`].
pub(crate) unsafe fn refresh_slots(bridge: &Bridge, pto: *mut PyTypeObject, w_type: ObjectId) {
    for &accessor in SlotAccessor::ALL {
        unsafe { accessor.set(pto, None) };
    }
    unsafe { update_slots(bridge, pto, w_type) };
}

/// Adds a managed function for every slot a native type sets, unless the
/// type's dict already has that name.
///
/// # Safety
/// `pto` must be a live type descriptor linked to `w_type`.
pub(crate) unsafe fn add_operators(
    bridge: &Bridge,
    pto: *mut PyTypeObject,
    w_type: ObjectId,
) -> BridgeResult<()> {
    for def in SLOTDEFS {
        let Some(f) = (unsafe { def.accessor.get(pto) }) else {
            continue;
        };
        if bridge.heap.defines(w_type, def.name) {
            continue;
        }
        let this = bridge.weak();
        let func = bridge.heap.new_function(def.name, move |heap, args| {
            let Some(bridge) = this.upgrade() else {
                return Err(heap.new_system_error("the native bridge has been shut down"));
            };
            match bridge.entered(|| unsafe { call_slot(&bridge, def, f, args) }) {
                Ok(result) => Ok(result),
                Err(BridgeError::Exception(exc)) => Err(exc),
                Err(err) => fatal_error(&err),
            }
        });
        bridge.heap.set_type_attr(w_type, def.name, func)?;
    }
    Ok(())
}

/// Calls the native slot `f` behind the managed method `def.name`;
/// `args[0]` is the instance.
///
/// # Safety
/// `f` must be a valid slot function for the instance's type.
unsafe fn call_slot(
    bridge: &Bridge,
    def: &SlotDef,
    f: SlotFn,
    args: &[ObjectId],
) -> BridgeResult<ObjectId> {
    let heap = &bridge.heap;
    let arg = |i: usize| -> BridgeResult<*mut PyObject> {
        let w_arg = args.get(i).copied().ok_or_else(|| {
            heap.new_type_error(format!(
                "{}() expected {} arguments, got {}",
                def.name,
                i + 1,
                args.len()
            ))
        })?;
        Ok(bridge.as_pyobj(w_arg)?.as_ptr())
    };
    let rest_tuple = || -> BridgeResult<*mut PyObject> {
        let rest = args.get(1..).unwrap_or_default().to_vec();
        Ok(bridge.as_pyobj(heap.new_tuple(rest))?.as_ptr())
    };
    let zelf = arg(0)?;

    unsafe {
        match f {
            SlotFn::Unary(f) => {
                let result = bridge.generic_cpy_call(|| f(zelf));
                if result.is_null()
                    && def.accessor == SlotAccessor::TpIternext
                    && bridge.errors.occurred().is_none()
                {
                    return Err(heap.new_stop_iteration().into());
                }
                bridge.cpy_result(result)
            }
            SlotFn::Binary(f) => {
                let other = arg(1)?;
                bridge.cpy_result(bridge.generic_cpy_call(|| f(zelf, other)))
            }
            SlotFn::Ternary(f) => {
                let call_args = rest_tuple()?;
                bridge.cpy_result(
                    bridge.generic_cpy_call(|| f(zelf, call_args, core::ptr::null_mut())),
                )
            }
            SlotFn::Ssize(f) => {
                let n = bridge.cpy_int_result(bridge.generic_cpy_call(|| f(zelf)))?;
                Ok(heap.new_int(n as i64))
            }
            SlotFn::Inquiry(f) => {
                let r = bridge.cpy_int_result(bridge.generic_cpy_call(|| f(zelf)))?;
                Ok(heap.new_bool(r != 0))
            }
            SlotFn::SsizeArg(f) => {
                let index = args
                    .get(1)
                    .and_then(|&w_index| heap.int_value(w_index))
                    .ok_or_else(|| heap.new_type_error("an integer index is required"))?;
                let index = Py_ssize_t::try_from(index).map_err(|_| {
                    heap.new_overflow_error("index too large to convert to a C ssize_t")
                })?;
                bridge.cpy_result(bridge.generic_cpy_call(|| f(zelf, index)))
            }
            SlotFn::ObjObj(f) => {
                let other = arg(1)?;
                let r = bridge.cpy_int_result(bridge.generic_cpy_call(|| f(zelf, other)))?;
                Ok(heap.new_bool(r != 0))
            }
            SlotFn::ObjObjArg(f) => {
                let (a, b) = match (def.accessor, def.op) {
                    (SlotAccessor::TpInit, _) => (rest_tuple()?, core::ptr::null_mut()),
                    (_, Some(SlotOp::Delete)) => (arg(1)?, core::ptr::null_mut()),
                    _ => (arg(1)?, arg(2)?),
                };
                bridge.cpy_int_result(bridge.generic_cpy_call(|| f(zelf, a, b)))?;
                Ok(heap.ctx.none)
            }
            SlotFn::RichCmp(f) => {
                let other = arg(1)?;
                let op = def
                    .op
                    .and_then(SlotOp::as_compare_op)
                    .ok_or_else(|| heap.new_system_error("comparison slot without an operator"))?;
                bridge.cpy_result(bridge.generic_cpy_call(|| f(zelf, other, op)))
            }
        }
    }
}

fn len_of(bridge: &Bridge, w_self: ObjectId) -> BridgeResult<Py_ssize_t> {
    let heap = &bridge.heap;
    let w_len = heap.call_method(w_self, "__len__", &[])?;
    let len = heap.int_value(w_len).ok_or_else(|| {
        heap.new_type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            heap.class_name(w_len)
        ))
    })?;
    if len < 0 {
        return Err(heap.new_value_error("__len__() should return >= 0").into());
    }
    Py_ssize_t::try_from(len)
        .map_err(|_| heap.new_overflow_error("cannot fit 'int' into an index-sized integer").into())
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_tp_repr(bridge, w_self: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__repr__", &[])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_tp_str(bridge, w_self: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__str__", &[])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    pub fn slot_tp_hash(bridge, w_self: ObjectId) -> Py_hash_t {
        let heap = &bridge.heap;
        let w_hash = heap.call_method(w_self, "__hash__", &[])?;
        let hash = heap
            .int_value(w_hash)
            .ok_or_else(|| heap.new_type_error("__hash__ method should return an integer"))?;
        // -1 is reserved for errors
        Ok(if hash == -1 { -2 } else { hash as Py_hash_t })
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_tp_call(
        bridge,
        w_self: ObjectId,
        w_args: ObjectId,
        w_kwargs: Option<ObjectId>,
    ) -> ObjectId {
        let heap = &bridge.heap;
        if w_kwargs.is_some() {
            return Err(heap.new_type_error("keyword arguments are not supported").into());
        }
        let args = heap
            .tuple_items(w_args)
            .ok_or_else(|| heap.new_type_error("argument list must be a tuple"))?;
        Ok(heap.call_method(w_self, "__call__", &args)?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    pub fn slot_tp_init(
        bridge,
        w_self: ObjectId,
        w_args: ObjectId,
        w_kwargs: Option<ObjectId>,
    ) -> c_int {
        let heap = &bridge.heap;
        if w_kwargs.is_some() {
            return Err(heap.new_type_error("keyword arguments are not supported").into());
        }
        let args = heap
            .tuple_items(w_args)
            .ok_or_else(|| heap.new_type_error("argument list must be a tuple"))?;
        heap.call_method(w_self, "__init__", &args)?;
        Ok(0)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_tp_iter(bridge, w_self: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__iter__", &[])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    /// Exhaustion is a NULL result with no exception set.
    pub fn slot_tp_iternext(bridge, w_self: ObjectId) -> Option<ObjectId> {
        let heap = &bridge.heap;
        match heap.call_method(w_self, "__next__", &[]) {
            Ok(item) => Ok(Some(item)),
            Err(exc) if heap.exception_matches(&exc, heap.ctx.exceptions.stop_iteration) => Ok(None),
            Err(exc) => Err(exc.into()),
        }
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_tp_richcompare(bridge, w_self: ObjectId, w_other: ObjectId, op: c_int) -> ObjectId {
        let name = SlotOp::compare_method(op).ok_or_else(|| {
            bridge
                .heap
                .new_system_error(format!("invalid comparison operator {op}"))
        })?;
        Ok(bridge.heap.call_method(w_self, name, &[w_other])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_nb_add(bridge, w_self: ObjectId, w_other: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__add__", &[w_other])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_nb_subtract(bridge, w_self: ObjectId, w_other: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__sub__", &[w_other])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_nb_multiply(bridge, w_self: ObjectId, w_other: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__mul__", &[w_other])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_nb_negative(bridge, w_self: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__neg__", &[])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    pub fn slot_nb_bool(bridge, w_self: ObjectId) -> c_int {
        Ok(bridge.heap.is_true(w_self)?.into())
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_nb_int(bridge, w_self: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__int__", &[])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_nb_index(bridge, w_self: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__index__", &[])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    pub fn slot_sq_length(bridge, w_self: ObjectId) -> Py_ssize_t {
        len_of(bridge, w_self)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_sq_item(bridge, w_self: ObjectId, index: Py_ssize_t) -> ObjectId {
        let w_index = bridge.heap.new_int(index as i64);
        Ok(bridge.heap.call_method(w_self, "__getitem__", &[w_index])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    pub fn slot_sq_contains(bridge, w_self: ObjectId, w_value: ObjectId) -> c_int {
        let w_result = bridge.heap.call_method(w_self, "__contains__", &[w_value])?;
        Ok(bridge.heap.is_true(w_result)?.into())
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    pub fn slot_mp_length(bridge, w_self: ObjectId) -> Py_ssize_t {
        len_of(bridge, w_self)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Null, gil = None)]
    pub fn slot_mp_subscript(bridge, w_self: ObjectId, w_key: ObjectId) -> ObjectId {
        Ok(bridge.heap.call_method(w_self, "__getitem__", &[w_key])?)
    }
}

cpython_api! {
    #[api(error = ErrorValue::Int(-1), gil = None)]
    /// A NULL value deletes the key.
    pub fn slot_mp_ass_subscript(
        bridge,
        w_self: ObjectId,
        w_key: ObjectId,
        w_value: Option<ObjectId>,
    ) -> c_int {
        match w_value {
            Some(w_value) => bridge.heap.call_method(w_self, "__setitem__", &[w_key, w_value])?,
            None => bridge.heap.call_method(w_self, "__delitem__", &[w_key])?,
        };
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Settings, abi::PyHeapTypeObject};
    use indexmap::IndexMap;
    use pybridge_vm::Heap;
    use std::{collections::HashSet, sync::Arc};

    #[test]
    fn test_table_is_consistent() {
        let mut seen = HashSet::new();
        for def in SLOTDEFS {
            assert!(def.name.starts_with("__") && def.name.ends_with("__"));
            assert!(seen.insert((def.name, def.accessor)), "{} listed twice", def.name);
            assert_eq!(
                def.accessor == SlotAccessor::TpRichcompare,
                def.op.and_then(SlotOp::as_compare_op).is_some()
            );
        }
        for accessor in SlotAccessor::ALL {
            assert!(
                SLOTDEFS.iter().any(|def| def.accessor == *accessor),
                "{} has no method",
                accessor.slot_name()
            );
        }
        assert_eq!(SlotOp::compare_method(Py_GE), Some("__ge__"));
        assert_eq!(SlotOp::compare_method(42), None);
    }

    #[test]
    fn test_set_needs_sub_table() {
        let mut pto = PyTypeObject::zeroed();
        let t = &raw mut pto;
        unsafe {
            assert!(SlotAccessor::TpRepr.set(t, Some(SlotAccessor::TpRepr.generic())));
            assert_eq!(
                SlotAccessor::TpRepr.get(t).map(SlotFn::addr),
                Some(slot_tp_repr_wrapper as usize)
            );
            assert!(!SlotAccessor::NbAdd.set(t, Some(SlotAccessor::NbAdd.generic())));
            assert!(SlotAccessor::NbAdd.get(t).is_none());
            // A slot only takes functions of its own signature.
            assert!(!SlotAccessor::TpHash.set(t, Some(SlotAccessor::TpRepr.generic())));
            assert!(SlotAccessor::TpRepr.set(t, None));
            assert!(SlotAccessor::TpRepr.get(t).is_none());
        }
    }

    #[test]
    fn test_managed_methods_fill_slots() {
        let bridge = Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let mut dict = IndexMap::new();
            let len = heap.new_function("__len__", |heap, _args| Ok(heap.new_int(3)));
            dict.insert("__len__".to_owned(), len);
            let w_sized = heap.new_class("Sized", vec![], dict).unwrap();
            let _root = heap.root(w_sized);

            let pto = bridge
                .as_pyobj(w_sized)
                .unwrap()
                .as_ptr()
                .cast::<PyTypeObject>();
            let ht = pto.cast::<PyHeapTypeObject>();
            unsafe {
                let sq_length = (*ht).as_sequence.sq_length.unwrap();
                let mp_length = (*ht).as_mapping.mp_length.unwrap();
                assert_eq!(sq_length as usize, slot_sq_length_wrapper as usize);
                assert_eq!(mp_length as usize, slot_mp_length_wrapper as usize);
                // Inherited from object, which defines __repr__.
                assert!((*pto).tp_repr.is_some());
                assert!((*ht).as_number.nb_add.is_none());

                let w_obj = heap.new_instance(w_sized).unwrap();
                let obj = bridge.as_pyobj(w_obj).unwrap().as_ptr();
                assert_eq!(sq_length(obj), 3);
            }
        });
    }

    #[test]
    fn test_negative_len_is_value_error() {
        let bridge = Bridge::new(Arc::new(Heap::new()), Settings::default()).unwrap();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let mut dict = IndexMap::new();
            let len = heap.new_function("__len__", |heap, _args| Ok(heap.new_int(-5)));
            dict.insert("__len__".to_owned(), len);
            let w_cls = heap.new_class("Broken", vec![], dict).unwrap();
            let w_obj = heap.new_instance(w_cls).unwrap();
            let obj = bridge.as_pyobj(w_obj).unwrap().as_ptr();
            assert_eq!(unsafe { slot_sq_length_wrapper(obj) }, -1);
            let exc = bridge.errors.fetch().unwrap();
            assert_eq!(exc.exc_type, heap.ctx.exceptions.value_error);
            assert_eq!(exc.message, "__len__() should return >= 0");
        });
    }
}
