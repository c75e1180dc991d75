//! The native object ABI: the header every bridged object starts with, the
//! type descriptor layout, and the function-pointer shapes stored in it.
//!
//! Field order follows the CPython 3 headers so that extension code compiled
//! against them sees the offsets it expects. The one addition is
//! `ob_pypy_link`, which sits between the refcount and the type pointer.

#![allow(non_camel_case_types, non_snake_case)]

use core::{
    ffi::{c_char, c_int, c_uint, c_ulong, c_void},
    mem::{offset_of, size_of},
    sync::atomic::AtomicIsize,
};
use static_assertions::{assert_eq_size, const_assert, const_assert_eq};
use std::borrow::Cow;

pub type Py_ssize_t = isize;
pub type Py_hash_t = isize;

/// Refcount bias added while a native object is linked to a managed one.
///
/// Counts above this value are owned by native code; a linked object whose
/// count has fallen back to exactly this value is only kept alive by its
/// managed counterpart.
pub const REFCNT_FROM_PYPY: Py_ssize_t = Py_ssize_t::MAX / 4 + 1;

#[repr(C)]
#[derive(Debug)]
pub struct PyObject {
    pub ob_refcnt: AtomicIsize,
    /// Raw managed identity of the linked counterpart, `0` while unlinked.
    pub ob_pypy_link: Py_ssize_t,
    pub ob_type: *mut PyTypeObject,
}

#[repr(C)]
#[derive(Debug)]
pub struct PyVarObject {
    pub ob_base: PyObject,
    pub ob_size: Py_ssize_t,
}

pub type destructor = unsafe extern "C" fn(*mut PyObject);
pub type freefunc = unsafe extern "C" fn(*mut c_void);
pub type unaryfunc = unsafe extern "C" fn(*mut PyObject) -> *mut PyObject;
pub type binaryfunc = unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject;
pub type ternaryfunc =
    unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> *mut PyObject;
pub type inquiry = unsafe extern "C" fn(*mut PyObject) -> c_int;
pub type lenfunc = unsafe extern "C" fn(*mut PyObject) -> Py_ssize_t;
pub type ssizeargfunc = unsafe extern "C" fn(*mut PyObject, Py_ssize_t) -> *mut PyObject;
pub type ssizeobjargproc = unsafe extern "C" fn(*mut PyObject, Py_ssize_t, *mut PyObject) -> c_int;
pub type objobjproc = unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> c_int;
pub type objobjargproc = unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> c_int;
pub type reprfunc = unaryfunc;
pub type hashfunc = unsafe extern "C" fn(*mut PyObject) -> Py_hash_t;
pub type getattrofunc = binaryfunc;
pub type setattrofunc = objobjargproc;
pub type richcmpfunc = unsafe extern "C" fn(*mut PyObject, *mut PyObject, c_int) -> *mut PyObject;
pub type getiterfunc = unaryfunc;
pub type iternextfunc = unaryfunc;
pub type descrgetfunc = ternaryfunc;
pub type descrsetfunc = objobjargproc;
pub type initproc = objobjargproc;
pub type allocfunc = unsafe extern "C" fn(*mut PyTypeObject, Py_ssize_t) -> *mut PyObject;
pub type newfunc =
    unsafe extern "C" fn(*mut PyTypeObject, *mut PyObject, *mut PyObject) -> *mut PyObject;

pub const Py_LT: c_int = 0;
pub const Py_LE: c_int = 1;
pub const Py_EQ: c_int = 2;
pub const Py_NE: c_int = 3;
pub const Py_GT: c_int = 4;
pub const Py_GE: c_int = 5;

#[repr(C)]
#[derive(Debug)]
pub struct PyNumberMethods {
    pub nb_add: Option<binaryfunc>,
    pub nb_subtract: Option<binaryfunc>,
    pub nb_multiply: Option<binaryfunc>,
    pub nb_remainder: Option<binaryfunc>,
    pub nb_divmod: Option<binaryfunc>,
    pub nb_power: Option<ternaryfunc>,
    pub nb_negative: Option<unaryfunc>,
    pub nb_positive: Option<unaryfunc>,
    pub nb_absolute: Option<unaryfunc>,
    pub nb_bool: Option<inquiry>,
    pub nb_invert: Option<unaryfunc>,
    pub nb_lshift: Option<binaryfunc>,
    pub nb_rshift: Option<binaryfunc>,
    pub nb_and: Option<binaryfunc>,
    pub nb_xor: Option<binaryfunc>,
    pub nb_or: Option<binaryfunc>,
    pub nb_int: Option<unaryfunc>,
    pub nb_reserved: *mut c_void,
    pub nb_float: Option<unaryfunc>,
    pub nb_inplace_add: Option<binaryfunc>,
    pub nb_inplace_subtract: Option<binaryfunc>,
    pub nb_inplace_multiply: Option<binaryfunc>,
    pub nb_inplace_remainder: Option<binaryfunc>,
    pub nb_inplace_power: Option<ternaryfunc>,
    pub nb_inplace_lshift: Option<binaryfunc>,
    pub nb_inplace_rshift: Option<binaryfunc>,
    pub nb_inplace_and: Option<binaryfunc>,
    pub nb_inplace_xor: Option<binaryfunc>,
    pub nb_inplace_or: Option<binaryfunc>,
    pub nb_floor_divide: Option<binaryfunc>,
    pub nb_true_divide: Option<binaryfunc>,
    pub nb_inplace_floor_divide: Option<binaryfunc>,
    pub nb_inplace_true_divide: Option<binaryfunc>,
    pub nb_index: Option<unaryfunc>,
    pub nb_matrix_multiply: Option<binaryfunc>,
    pub nb_inplace_matrix_multiply: Option<binaryfunc>,
}

#[repr(C)]
#[derive(Debug)]
pub struct PySequenceMethods {
    pub sq_length: Option<lenfunc>,
    pub sq_concat: Option<binaryfunc>,
    pub sq_repeat: Option<ssizeargfunc>,
    pub sq_item: Option<ssizeargfunc>,
    pub was_sq_slice: *mut c_void,
    pub sq_ass_item: Option<ssizeobjargproc>,
    pub was_sq_ass_slice: *mut c_void,
    pub sq_contains: Option<objobjproc>,
    pub sq_inplace_concat: Option<binaryfunc>,
    pub sq_inplace_repeat: Option<ssizeargfunc>,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct PyMappingMethods {
    pub mp_length: Option<lenfunc>,
    pub mp_subscript: Option<binaryfunc>,
    pub mp_ass_subscript: Option<objobjargproc>,
}

#[repr(C)]
#[derive(Debug)]
pub struct PyTypeObject {
    pub ob_base: PyVarObject,
    pub tp_name: *const c_char,
    pub tp_basicsize: Py_ssize_t,
    pub tp_itemsize: Py_ssize_t,
    pub tp_dealloc: Option<destructor>,
    pub tp_vectorcall_offset: Py_ssize_t,
    pub tp_getattr: *mut c_void,
    pub tp_setattr: *mut c_void,
    pub tp_as_async: *mut c_void,
    pub tp_repr: Option<reprfunc>,
    pub tp_as_number: *mut PyNumberMethods,
    pub tp_as_sequence: *mut PySequenceMethods,
    pub tp_as_mapping: *mut PyMappingMethods,
    pub tp_hash: Option<hashfunc>,
    pub tp_call: Option<ternaryfunc>,
    pub tp_str: Option<reprfunc>,
    pub tp_getattro: Option<getattrofunc>,
    pub tp_setattro: Option<setattrofunc>,
    pub tp_as_buffer: *mut c_void,
    pub tp_flags: c_ulong,
    pub tp_doc: *const c_char,
    pub tp_traverse: *mut c_void,
    pub tp_clear: Option<inquiry>,
    pub tp_richcompare: Option<richcmpfunc>,
    pub tp_weaklistoffset: Py_ssize_t,
    pub tp_iter: Option<getiterfunc>,
    pub tp_iternext: Option<iternextfunc>,
    pub tp_methods: *mut c_void,
    pub tp_members: *mut c_void,
    pub tp_getset: *mut c_void,
    pub tp_base: *mut PyTypeObject,
    /// Always null: attribute lookup goes through the managed type.
    pub tp_dict: *mut PyObject,
    pub tp_descr_get: Option<descrgetfunc>,
    pub tp_descr_set: Option<descrsetfunc>,
    pub tp_dictoffset: Py_ssize_t,
    pub tp_init: Option<initproc>,
    pub tp_alloc: Option<allocfunc>,
    pub tp_new: Option<newfunc>,
    pub tp_free: Option<freefunc>,
    pub tp_is_gc: Option<inquiry>,
    pub tp_bases: *mut PyObject,
    pub tp_mro: *mut PyObject,
    pub tp_cache: *mut PyObject,
    pub tp_subclasses: *mut PyObject,
    pub tp_weaklist: *mut PyObject,
    pub tp_del: Option<destructor>,
    pub tp_version_tag: c_uint,
    pub tp_finalize: Option<destructor>,
}

/// The allocation backing every type descriptor the bridge creates itself.
///
/// The method sub-tables live inline so that `tp_as_number` and friends can
/// always point somewhere writable.
#[repr(C)]
#[derive(Debug)]
pub struct PyHeapTypeObject {
    pub ht_type: PyTypeObject,
    pub as_number: PyNumberMethods,
    pub as_mapping: PyMappingMethods,
    pub as_sequence: PySequenceMethods,
    /// Owned storage behind `tp_name`.
    pub ht_name: *mut c_char,
    /// Owned storage behind `tp_doc`, null when there is no docstring.
    pub ht_doc: *mut c_char,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PyTypeFlags: c_ulong {
        const HEAPTYPE = 1 << 9;
        const BASETYPE = 1 << 10;
        const READY = 1 << 12;
        const READYING = 1 << 13;
        const HAVE_GC = 1 << 14;
        const LONG_SUBCLASS = 1 << 24;
        const TUPLE_SUBCLASS = 1 << 26;
        const BASE_EXC_SUBCLASS = 1 << 30;
        const TYPE_SUBCLASS = 1 << 31;

        const _ = !0;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadyState {
    NotReady,
    Readying,
    Ready,
}

impl PyTypeObject {
    /// Every field zeroed, including the refcount.
    pub const fn zeroed() -> Self {
        // SAFETY: every field is an integer, an atomic integer, a raw pointer
        // or an `Option` of a function pointer, all valid as zero bits.
        unsafe { core::mem::zeroed() }
    }

    /// The Rust spelling of a static `{PyVarObject_HEAD_INIT(NULL, 0) "name", size}`.
    pub const fn new_static(name: &'static core::ffi::CStr, basicsize: usize) -> Self {
        let mut t = Self::zeroed();
        t.ob_base.ob_base.ob_refcnt = AtomicIsize::new(1);
        t.tp_name = name.as_ptr();
        t.tp_basicsize = basicsize as Py_ssize_t;
        t
    }

    pub fn flags(&self) -> PyTypeFlags {
        PyTypeFlags::from_bits_retain(self.tp_flags)
    }

    pub fn insert_flags(&mut self, flags: PyTypeFlags) {
        self.tp_flags |= flags.bits();
    }

    pub fn remove_flags(&mut self, flags: PyTypeFlags) {
        self.tp_flags &= !flags.bits();
    }

    pub fn is_heap_type(&self) -> bool {
        self.flags().contains(PyTypeFlags::HEAPTYPE)
    }

    pub fn ready_state(&self) -> ReadyState {
        let flags = self.flags();
        if flags.contains(PyTypeFlags::READY) {
            ReadyState::Ready
        } else if flags.contains(PyTypeFlags::READYING) {
            ReadyState::Readying
        } else {
            ReadyState::NotReady
        }
    }

    /// `tp_name` as text; native names may carry a dotted module prefix.
    pub fn name(&self) -> Cow<'_, str> {
        if self.tp_name.is_null() {
            return Cow::Borrowed("<unnamed type>");
        }
        // SAFETY: a non-null tp_name is a NUL-terminated string for the life
        // of the type object.
        unsafe { core::ffi::CStr::from_ptr(self.tp_name) }.to_string_lossy()
    }
}

const_assert_eq!(offset_of!(PyObject, ob_refcnt), 0);
const_assert_eq!(offset_of!(PyObject, ob_pypy_link), size_of::<Py_ssize_t>());
const_assert_eq!(offset_of!(PyObject, ob_type), 2 * size_of::<Py_ssize_t>());
assert_eq_size!(PyObject, [usize; 3]);
const_assert_eq!(offset_of!(PyVarObject, ob_size), size_of::<PyObject>());
const_assert_eq!(offset_of!(PyTypeObject, ob_base), 0);
const_assert_eq!(offset_of!(PyHeapTypeObject, ht_type), 0);
const_assert!(REFCNT_FROM_PYPY > 0 && REFCNT_FROM_PYPY.checked_mul(2).is_some());

/// One row of the layout table printed by the `pybridge layout` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub struct_name: &'static str,
    pub field: &'static str,
    pub offset: usize,
    pub size: usize,
}

const fn pointee_size<T>(_: *const T) -> usize {
    size_of::<T>()
}

macro_rules! layout_rows {
    ($($struct:ident { $($field:ident),* $(,)? })*) => {
        vec![$($(FieldLayout {
            struct_name: stringify!($struct),
            field: stringify!($field),
            offset: offset_of!($struct, $field),
            size: {
                let uninit = core::mem::MaybeUninit::<$struct>::uninit();
                // SAFETY: only the field address is computed, nothing is read.
                pointee_size(unsafe { core::ptr::addr_of!((*uninit.as_ptr()).$field) })
            },
        },)*)*]
    };
}

/// Offsets and sizes of the header fields native code depends on.
pub fn header_layout() -> Vec<FieldLayout> {
    layout_rows! {
        PyObject { ob_refcnt, ob_pypy_link, ob_type }
        PyVarObject { ob_base, ob_size }
        PyTypeObject {
            tp_name, tp_basicsize, tp_itemsize, tp_dealloc, tp_repr, tp_as_number,
            tp_as_sequence, tp_as_mapping, tp_hash, tp_call, tp_str, tp_getattro,
            tp_setattro, tp_flags, tp_doc, tp_richcompare, tp_iter, tp_iternext,
            tp_base, tp_dict, tp_init, tp_alloc, tp_new, tp_free, tp_bases, tp_mro,
        }
    }
}
