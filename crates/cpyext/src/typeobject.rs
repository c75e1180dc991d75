//! Type descriptors, synthesized in both directions.
//!
//! A managed type gets a descriptor when it is first attached: the
//! descriptor is filled from the managed type's metadata ([`fill_type`]) and
//! then readied. A type defined by native code is readied by
//! `PyType_Ready`, which creates the managed type and publishes the native
//! slots as managed methods. Either way [`Bridge::type_ready`] finishes the
//! job: base first, then `tp_bases`/`tp_mro`, layout and slot inheritance.

use crate::{
    Bridge,
    abi::{
        Py_ssize_t, PyHeapTypeObject, PyObject, PyTypeFlags, PyTypeObject, ReadyState, destructor,
    },
    api::{Borrowed, ErrorValue},
    cpython_api,
    error::{BridgeError, BridgeResult},
    object::{self, object_generic_getattr_wrapper, object_generic_setattr_wrapper},
    rawrefcount::PyObjectPtr,
    slotdefs,
    tupleobject::{self, PyTupleObject},
    typedescr::TypeDescrSpec,
};
use core::{
    ffi::{CStr, c_int},
    ptr::NonNull,
    sync::atomic::Ordering,
};
use indexmap::IndexMap;
use pybridge_vm::{ObjectId, TypeFamily, TypeFlags, TypeSpec};
use std::ffi::CString;

pub(crate) const TYPEDESCR: TypeDescrSpec = TypeDescrSpec {
    basicsize: Some(size_of::<PyHeapTypeObject>()),
    alloc: Some(type_alloc),
    attach: Some(type_attach),
    realize: Some(type_realize),
    dealloc: Some(type_dealloc_wrapper),
    ..TypeDescrSpec::new(TypeFamily::Type)
};

fn type_ptr(pto: *mut PyTypeObject) -> BridgeResult<PyObjectPtr> {
    PyObjectPtr::new(pto.cast()).ok_or(BridgeError::NullPointer)
}

/// Points `tp_as_*` at the tables inside the descriptor's own allocation.
unsafe fn link_sub_tables(ht: *mut PyHeapTypeObject) {
    unsafe {
        (*ht).ht_type.tp_as_number = &raw mut (*ht).as_number;
        (*ht).ht_type.tp_as_sequence = &raw mut (*ht).as_sequence;
        (*ht).ht_type.tp_as_mapping = &raw mut (*ht).as_mapping;
    }
}

/// A zeroed descriptor with refcount 1 and no type yet, for the bootstrap.
pub(crate) fn alloc_type_object() -> BridgeResult<NonNull<PyTypeObject>> {
    let size = size_of::<PyHeapTypeObject>();
    // SAFETY: plain C allocation, checked for null below.
    let ht = unsafe { libc::calloc(1, size) }.cast::<PyHeapTypeObject>();
    let ht = NonNull::new(ht).ok_or(BridgeError::NoMemory(size))?;
    unsafe {
        (*ht.as_ptr())
            .ht_type
            .ob_base
            .ob_base
            .ob_refcnt
            .store(1, Ordering::Release);
        link_sub_tables(ht.as_ptr());
    }
    Ok(ht.cast())
}

unsafe fn type_alloc(
    bridge: &Bridge,
    w_metatype: ObjectId,
    itemcount: Py_ssize_t,
) -> BridgeResult<PyObjectPtr> {
    let metatype = bridge.as_pyobj(w_metatype)?.as_ptr().cast::<PyTypeObject>();
    let needed = size_of::<PyHeapTypeObject>() as Py_ssize_t;
    let size = unsafe { (*metatype).tp_basicsize };
    if size < needed {
        return Err(BridgeError::LayoutConflict {
            name: unsafe { (*metatype).name() }.into_owned(),
            size,
            base_size: needed,
        });
    }
    let obj = unsafe { bridge.allocate(metatype, itemcount)? };
    unsafe { link_sub_tables(obj.as_ptr().cast()) };
    Ok(obj)
}

fn family_flags(family: TypeFamily) -> PyTypeFlags {
    family
        .chain()
        .fold(PyTypeFlags::empty(), |flags, family| {
            flags
                | match family {
                    TypeFamily::Int => PyTypeFlags::LONG_SUBCLASS,
                    TypeFamily::Tuple => PyTypeFlags::TUPLE_SUBCLASS,
                    TypeFamily::BaseException => PyTypeFlags::BASE_EXC_SUBCLASS,
                    TypeFamily::Type => PyTypeFlags::TYPE_SUBCLASS,
                    _ => PyTypeFlags::empty(),
                }
        })
}

/// Copies `w_type`'s metadata into a fresh descriptor: name, doc, layout,
/// flags, allocation functions and `tp_base`. Nothing here needs the base to
/// be ready.
///
/// # Safety
/// `pto` must be a live descriptor allocation linked to `w_type`.
pub(crate) unsafe fn fill_type(
    bridge: &Bridge,
    pto: *mut PyTypeObject,
    w_type: ObjectId,
) -> BridgeResult<()> {
    let heap = &bridge.heap;
    let (name, doc, flags, family, w_base) = heap
        .with_type(w_type, |data| {
            (
                data.name.clone(),
                data.doc.clone(),
                data.flags,
                data.family,
                data.base,
            )
        })
        .ok_or(BridgeError::NotAType(w_type))?;
    let typedescr = bridge.typedescrs.get(family);
    let c_string = |s: String| {
        CString::new(s).map_err(|_| heap.new_value_error("embedded null character in type metadata"))
    };
    let name = c_string(name)?;
    let doc = doc.map(c_string).transpose()?;
    let heap_type = flags.contains(TypeFlags::HEAPTYPE);

    let mut native_flags = family_flags(family);
    if flags.contains(TypeFlags::BASETYPE) {
        native_flags |= PyTypeFlags::BASETYPE;
    }
    if heap_type {
        native_flags |= PyTypeFlags::HEAPTYPE;
    }
    let dealloc: destructor = if heap_type {
        subtype_dealloc_wrapper
    } else {
        typedescr.dealloc
    };

    let ht = pto.cast::<PyHeapTypeObject>();
    unsafe {
        (*ht).ht_name = name.into_raw();
        (*pto).tp_name = (*ht).ht_name;
        if let Some(doc) = doc {
            (*ht).ht_doc = doc.into_raw();
            (*pto).tp_doc = (*ht).ht_doc;
        }
        (*pto).tp_basicsize = typedescr.basicsize as Py_ssize_t;
        (*pto).tp_itemsize = typedescr.itemsize as Py_ssize_t;
        (*pto).tp_dealloc = Some(dealloc);
        (*pto).insert_flags(native_flags);
        (*pto).tp_alloc = Some(type_generic_alloc_wrapper);
        (*pto).tp_free = Some(object::object_free_wrapper);
        if w_type == heap.ctx.object_type {
            (*pto).tp_new = Some(type_generic_new_wrapper);
        }
    }

    if let Some(w_base) = w_base {
        // Heap types own a reference to their base.
        let base = if heap_type {
            bridge.make_ref(w_base)?
        } else {
            bridge.as_pyobj(w_base)?
        };
        unsafe { (*pto).tp_base = base.as_ptr().cast() };
    }
    Ok(())
}

unsafe fn type_attach(bridge: &Bridge, obj: PyObjectPtr, w_type: ObjectId) -> BridgeResult<()> {
    let pto = obj.as_ptr().cast::<PyTypeObject>();
    unsafe {
        fill_type(bridge, pto, w_type)?;
        bridge.type_ready(pto)
    }
}

unsafe fn type_realize(bridge: &Bridge, obj: PyObjectPtr) -> BridgeResult<ObjectId> {
    let pto = obj.as_ptr().cast::<PyTypeObject>();
    unsafe {
        bridge.type_ready(pto)?;
        match bridge.links.managed_of(obj) {
            Some(w_type) => Ok(w_type),
            // Readied earlier, but the managed side has since been collected.
            None => bridge.realize_native_type(pto),
        }
    }
}

impl Bridge {
    /// `make_ready`: finishes a descriptor so that instances may point at it.
    ///
    /// A descriptor that is already being readied, because its base chain
    /// reaches back to it, is an error.
    ///
    /// # Safety
    /// `pto` must be a live type descriptor.
    pub unsafe fn type_ready(&self, pto: *mut PyTypeObject) -> BridgeResult<()> {
        match unsafe { (*pto).ready_state() } {
            ReadyState::Ready => return Ok(()),
            ReadyState::Readying => {
                return Err(BridgeError::ReentrantReady(
                    unsafe { (*pto).name() }.into_owned(),
                ));
            }
            ReadyState::NotReady => {}
        }
        unsafe { (*pto).insert_flags(PyTypeFlags::READYING) };
        scopeguard::defer! {
            unsafe { (*pto).remove_flags(PyTypeFlags::READYING) };
        }

        unsafe {
            self.ready_base(pto)?;
            let w_type = match self.links.managed_of(type_ptr(pto)?) {
                Some(w_type) => w_type,
                None => self.realize_native_type(pto)?,
            };
            self.finish_type(pto, w_type)?;
            (*pto).insert_flags(PyTypeFlags::READY);
        }
        debug!("type '{}' is ready", unsafe { (*pto).name() });
        Ok(())
    }

    unsafe fn ready_base(&self, pto: *mut PyTypeObject) -> BridgeResult<()> {
        let object = self
            .as_pyobj(self.heap.ctx.object_type)?
            .as_ptr()
            .cast::<PyTypeObject>();
        unsafe {
            if (*pto).tp_base.is_null() && pto != object {
                (*pto).tp_base = object;
            }
            let base = (*pto).tp_base;
            if !base.is_null() {
                self.type_ready(base)?;
            }
        }
        Ok(())
    }

    /// Creates the managed type for a descriptor native code defined.
    unsafe fn realize_native_type(&self, pto: *mut PyTypeObject) -> BridgeResult<ObjectId> {
        let heap = &self.heap;
        unsafe {
            let base = (*pto).tp_base;
            if (*pto).ob_base.ob_base.ob_type.is_null() {
                (*pto).ob_base.ob_base.ob_type = match base.as_ref() {
                    Some(base) => base.ob_base.ob_base.ob_type,
                    None => self.as_pyobj(heap.ctx.type_type)?.as_ptr().cast(),
                };
            }
            let w_metatype = self.from_native(type_ptr((*pto).ob_base.ob_base.ob_type)?)?;
            let bases = match PyObjectPtr::new((*pto).tp_bases) {
                Some(tp_bases) => {
                    let w_bases = self.from_native(tp_bases)?;
                    heap.tuple_items(w_bases)
                        .ok_or_else(|| heap.new_type_error("tp_bases must be a tuple"))?
                }
                None => vec![self.from_native(type_ptr(base)?)?],
            };

            let full_name = (*pto).name();
            let name = full_name
                .rsplit_once('.')
                .map_or(&*full_name, |(_, name)| name)
                .to_owned();
            let doc = (!(*pto).tp_doc.is_null())
                .then(|| CStr::from_ptr((*pto).tp_doc).to_string_lossy().into_owned());
            let native_flags = (*pto).flags();
            let mut flags = TypeFlags::NATIVE;
            if native_flags.contains(PyTypeFlags::BASETYPE) {
                flags |= TypeFlags::BASETYPE;
            }
            if native_flags.contains(PyTypeFlags::HEAPTYPE) {
                flags |= TypeFlags::HEAPTYPE;
            }

            let w_type = heap.new_type(TypeSpec {
                name,
                doc,
                bases,
                dict: IndexMap::new(),
                flags,
                metaclass: Some(w_metatype),
            })?;
            self.track_reference(type_ptr(pto)?, w_type)?;
            slotdefs::add_operators(self, pto, w_type)?;
            debug!("realized native type '{full_name}' as {w_type}");
            Ok(w_type)
        }
    }

    /// Steps that need the base ready: `tp_bases`, `tp_mro`, layout and
    /// slot inheritance.
    unsafe fn finish_type(&self, pto: *mut PyTypeObject, w_type: ObjectId) -> BridgeResult<()> {
        let heap = &self.heap;
        unsafe {
            if (*pto).tp_bases.is_null() {
                let w_bases = heap
                    .with_type(w_type, |data| data.bases.clone())
                    .ok_or(BridgeError::NotAType(w_type))?;
                let items = w_bases
                    .into_iter()
                    .map(|w_base| self.make_ref(w_base))
                    .collect::<BridgeResult<Vec<_>>>()?;
                (*pto).tp_bases = tupleobject::new_tuple(self, items)?.as_ptr();
            }
            if (*pto).tp_mro.is_null() {
                let w_mro = heap
                    .type_mro(w_type)
                    .ok_or(BridgeError::NotAType(w_type))?;
                let mut items = Vec::with_capacity(w_mro.len());
                for w_entry in w_mro {
                    // The type's own entry holds no reference; see type_dealloc.
                    items.push(if w_entry == w_type {
                        type_ptr(pto)?
                    } else {
                        self.make_ref(w_entry)?
                    });
                }
                (*pto).tp_mro = tupleobject::new_tuple(self, items)?.as_ptr();
            }

            match (*pto).tp_base.as_ref() {
                Some(base) => {
                    let size = (*pto).tp_basicsize;
                    if size == 0 {
                        (*pto).tp_basicsize = base.tp_basicsize;
                    } else if size < base.tp_basicsize {
                        return Err(BridgeError::LayoutConflict {
                            name: (*pto).name().into_owned(),
                            size,
                            base_size: base.tp_basicsize,
                        });
                    }
                    let t = &mut *pto;
                    if t.tp_itemsize == 0 {
                        t.tp_itemsize = base.tp_itemsize;
                    }
                    t.tp_dealloc = t.tp_dealloc.or(base.tp_dealloc);
                    t.tp_alloc = t.tp_alloc.or(base.tp_alloc);
                    t.tp_free = t.tp_free.or(base.tp_free);
                    t.tp_new = t.tp_new.or(base.tp_new);
                }
                None if (*pto).tp_basicsize == 0 => {
                    (*pto).tp_basicsize = size_of::<PyObject>() as Py_ssize_t;
                }
                None => {}
            }

            slotdefs::update_slots(self, pto, w_type);
            let t = &mut *pto;
            if t.tp_getattro.is_none() {
                t.tp_getattro = Some(object_generic_getattr_wrapper);
            }
            if t.tp_setattro.is_none() {
                t.tp_setattro = Some(object_generic_setattr_wrapper);
            }
        }
        Ok(())
    }
}

cpython_api! {
    #[api(error = ErrorValue::CannotFail, gil = None)]
    /// `tp_dealloc` of `type`.
    pub fn type_dealloc(bridge, obj: *mut PyObject) -> () {
        let pto = obj.cast::<PyTypeObject>();
        unsafe {
            let mro = core::mem::replace(&mut (*pto).tp_mro, core::ptr::null_mut());
            if let Some(mro) = PyObjectPtr::new(mro) {
                let tuple = mro.as_ptr().cast::<PyTupleObject>();
                let items = (*tuple).ob_item;
                if (*tuple).ob_base.ob_size > 0 && !items.is_null() && *items == obj {
                    *items = core::ptr::null_mut();
                }
                bridge.decref(mro)?;
            }
            bridge.xdecref(core::mem::replace(&mut (*pto).tp_bases, core::ptr::null_mut()))?;
            if (*pto).is_heap_type() {
                bridge.xdecref(core::mem::replace(&mut (*pto).tp_base, core::ptr::null_mut()).cast())?;
            } else if (*pto).ready_state() == ReadyState::Ready {
                warn!("static type descriptor '{}' lost its last reference", (*pto).name());
                return Ok(());
            }
            let ht = pto.cast::<PyHeapTypeObject>();
            for owned in [&mut (*ht).ht_name, &mut (*ht).ht_doc] {
                let owned = core::mem::replace(owned, core::ptr::null_mut());
                if !owned.is_null() {
                    drop(CString::from_raw(owned));
                }
            }
            object::object_dealloc(bridge, obj)
        }
    }
}

cpython_api! {
    #[api(error = ErrorValue::CannotFail, gil = None)]
    /// `tp_dealloc` of heap types: runs the dealloc of the nearest base that
    /// has one of its own.
    pub fn subtype_dealloc(bridge, obj: *mut PyObject) -> () {
        let subtype_dealloc: destructor = subtype_dealloc_wrapper;
        let mut base = unsafe { (*obj).ob_type };
        loop {
            let t = unsafe { base.as_ref() }.ok_or(BridgeError::NullPointer)?;
            match t.tp_dealloc {
                Some(dealloc) if !core::ptr::fn_addr_eq(dealloc, subtype_dealloc) => {
                    unsafe { bridge.generic_cpy_call(|| dealloc(obj)) };
                    return Ok(());
                }
                _ => base = t.tp_base,
            }
        }
    }
}

cpython_api! {
    #[api(export = "PyType_Ready", error = ErrorValue::Int(-1), gil = None)]
    pub fn type_ready(bridge, pto: *mut PyTypeObject) -> c_int {
        if pto.is_null() {
            return Err(BridgeError::NullPointer);
        }
        unsafe { bridge.type_ready(pto)? };
        Ok(0)
    }
}

cpython_api! {
    #[api(export = "PyType_IsSubtype", error = ErrorValue::CannotFail, gil = None)]
    pub fn type_is_subtype(bridge, w_sub: ObjectId, w_type: ObjectId) -> c_int {
        Ok(bridge.heap.is_subtype(w_sub, w_type).into())
    }
}

cpython_api! {
    #[api(export = "PyType_GenericAlloc", error = ErrorValue::Null, gil = None)]
    pub fn type_generic_alloc(bridge, pto: *mut PyTypeObject, nitems: Py_ssize_t) -> *mut PyObject {
        object::object_new_var(bridge, pto, nitems)
    }
}

cpython_api! {
    #[api(export = "PyType_GenericNew", error = ErrorValue::Null, gil = None)]
    pub fn type_generic_new(
        bridge,
        pto: *mut PyTypeObject,
        args: *mut PyObject,
        kwds: *mut PyObject,
    ) -> *mut PyObject {
        let alloc = unsafe { pto.as_ref() }.ok_or(BridgeError::NullPointer)?.tp_alloc;
        let Some(alloc) = alloc else {
            return object::object_new_var(bridge, pto, 0);
        };
        let obj = unsafe { bridge.generic_cpy_call(|| alloc(pto, 0)) };
        if obj.is_null() {
            bridge.errors.check_and_raise()?;
            return Err(bridge.heap.new_memory_error().into());
        }
        Ok(obj)
    }
}

cpython_api! {
    #[api(export = "_PyType_Lookup", error = ErrorValue::CannotFail, gil = None)]
    /// Looks `name` up along the MRO without raising; borrowed.
    pub fn type_lookup(bridge, w_type: ObjectId, w_name: ObjectId) -> Option<Borrowed> {
        let Some(name) = bridge.heap.str_value(w_name) else {
            return Ok(None);
        };
        Ok(bridge.heap.lookup(w_type, &name).map(Borrowed))
    }
}

cpython_api! {
    #[api(export = "PyType_Modified", error = ErrorValue::CannotFail, gil = None)]
    /// Recomputes the slots of a managed type whose methods changed.
    pub fn type_modified(bridge, pto: *mut PyTypeObject) -> () {
        let Some(w_type) = (unsafe { bridge.links.managed_of(type_ptr(pto)?) }) else {
            return Ok(());
        };
        let native = bridge
            .heap
            .with_type(w_type, |data| data.flags.contains(TypeFlags::NATIVE))
            .ok_or(BridgeError::NotAType(w_type))?;
        if !native {
            unsafe { slotdefs::refresh_slots(bridge, pto, w_type) };
        }
        Ok(())
    }
}

cpython_api! {
    #[api(export = "PyType_Check", error = ErrorValue::CannotFail, gil = None)]
    pub fn type_check(bridge, w_obj: ObjectId) -> c_int {
        Ok(bridge.heap.isinstance(w_obj, bridge.heap.ctx.type_type).into())
    }
}

cpython_api! {
    #[api(export = "PyType_CheckExact", error = ErrorValue::CannotFail, gil = None)]
    pub fn type_check_exact(bridge, w_obj: ObjectId) -> c_int {
        Ok((bridge.heap.class_of(w_obj) == Some(bridge.heap.ctx.type_type)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Settings, abi::Py_hash_t};
    use std::sync::Arc;

    fn bridge() -> Arc<Bridge> {
        Bridge::new(Arc::new(pybridge_vm::Heap::new()), Settings::default()).unwrap()
    }

    fn descriptor(bridge: &Bridge, w_type: ObjectId) -> *mut PyTypeObject {
        bridge.as_pyobj(w_type).unwrap().as_ptr().cast()
    }

    fn tuple_items(tuple: *mut PyObject) -> Vec<*mut PyObject> {
        let tuple = tuple.cast::<PyTupleObject>();
        unsafe {
            let len = (*tuple).ob_base.ob_size as usize;
            core::slice::from_raw_parts((*tuple).ob_item, len).to_vec()
        }
    }

    fn leak_static(name: &'static CStr) -> *mut PyTypeObject {
        let mut t = PyTypeObject::new_static(name, size_of::<PyObject>());
        t.insert_flags(PyTypeFlags::BASETYPE);
        Box::into_raw(Box::new(t))
    }

    unsafe extern "C" fn animal_hash(_obj: *mut PyObject) -> Py_hash_t {
        7
    }

    #[test]
    fn test_managed_hierarchy() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let mut dict = IndexMap::new();
            dict.insert(
                "__len__".to_owned(),
                heap.new_function("__len__", |heap, _| Ok(heap.new_int(4))),
            );
            let w_animal = heap.new_class("Animal", vec![], dict).unwrap();
            let w_dog = heap.new_class("Dog", vec![w_animal], IndexMap::new()).unwrap();
            let _root = heap.root(w_dog);

            let dog = descriptor(&bridge, w_dog);
            let animal = descriptor(&bridge, w_animal);
            let object = descriptor(&bridge, heap.ctx.object_type);
            unsafe {
                assert_eq!((*dog).ready_state(), ReadyState::Ready);
                assert_eq!((*animal).ready_state(), ReadyState::Ready);
                assert_eq!((*dog).tp_base, animal);
                assert_eq!((*dog).name(), "Dog");
                assert!((*dog).is_heap_type());
                assert!(!(*object).is_heap_type());
                assert_eq!(
                    tuple_items((*dog).tp_mro),
                    [dog.cast(), animal.cast(), object.cast::<PyObject>()]
                );
                assert_eq!(tuple_items((*dog).tp_bases), [animal.cast::<PyObject>()]);

                let dog_len = (*(*dog).tp_as_sequence).sq_length.map(|f| f as usize);
                let animal_len = (*(*animal).tp_as_sequence).sq_length.map(|f| f as usize);
                assert!(dog_len.is_some());
                assert_eq!(dog_len, animal_len);
                assert_eq!((*dog).tp_basicsize, size_of::<PyObject>() as Py_ssize_t);
            }
        });
    }

    #[test]
    fn test_make_ready_is_idempotent() {
        let bridge = bridge();
        bridge.enter(|| {
            let w_cls = bridge
                .heap
                .new_class("Thing", vec![], IndexMap::new())
                .unwrap();
            let _root = bridge.heap.root(w_cls);
            let pto = descriptor(&bridge, w_cls);
            let snapshot = |pto: *mut PyTypeObject| unsafe {
                (
                    (*pto).tp_flags,
                    (*pto).tp_bases,
                    (*pto).tp_mro,
                    (*pto).tp_repr.map(|f| f as usize),
                    (*pto).tp_basicsize,
                    (*pto).ob_base.ob_base.ob_refcnt.load(Ordering::Relaxed),
                )
            };
            let before = snapshot(pto);
            unsafe { bridge.type_ready(pto) }.unwrap();
            assert_eq!(unsafe { type_ready_wrapper(pto) }, 0);
            assert_eq!(snapshot(pto), before);
        });
    }

    #[test]
    fn test_native_hierarchy() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let animal = leak_static(c"zoo.Animal");
            let dog = leak_static(c"zoo.Dog");
            unsafe {
                (*animal).tp_hash = Some(animal_hash);
                (*dog).tp_base = animal;
            }
            assert_eq!(unsafe { type_ready_wrapper(dog) }, 0);

            let w_dog = unsafe { bridge.links.managed_of(type_ptr(dog).unwrap()) }.unwrap();
            let w_animal = unsafe { bridge.links.managed_of(type_ptr(animal).unwrap()) }.unwrap();
            assert_eq!(heap.type_name(w_dog), "Dog");
            assert_eq!(
                heap.type_mro(w_dog).unwrap(),
                [w_dog, w_animal, heap.ctx.object_type]
            );
            unsafe {
                assert_eq!((*animal).ready_state(), ReadyState::Ready);
                assert_eq!(
                    (*dog).tp_hash.map(|f| f as usize),
                    Some(animal_hash as usize)
                );
                assert_eq!((*dog).tp_basicsize, size_of::<PyObject>() as Py_ssize_t);
                assert!((*dog).tp_dealloc.is_some());
            }
            assert!(heap.defines(w_animal, "__hash__"));
            assert!(!heap.defines(w_dog, "__hash__"));

            // Managed code reaches the native slot through the published method.
            let obj = unsafe { bridge.allocate(dog, 0) }.unwrap();
            let w_obj = unsafe { bridge.from_native(obj) }.unwrap();
            assert_eq!(heap.class_of(w_obj), Some(w_dog));
            let w_hash = heap.call_method(w_obj, "__hash__", &[]).unwrap();
            assert_eq!(heap.int_value(w_hash), Some(7));
            unsafe { bridge.decref(obj) }.unwrap();
        });
    }

    #[test]
    fn test_self_referential_base_is_rejected() {
        let bridge = bridge();
        bridge.enter(|| {
            let pto = leak_static(c"loop.Ouroboros");
            unsafe { (*pto).tp_base = pto };
            let err = unsafe { bridge.type_ready(pto) }.unwrap_err();
            assert!(matches!(err, BridgeError::ReentrantReady(ref name) if name == "loop.Ouroboros"));
            assert!(err.is_fatal());
            assert_eq!(unsafe { (*pto).ready_state() }, ReadyState::NotReady);
        });
    }

    #[test]
    fn test_base_cycle_is_rejected() {
        let bridge = bridge();
        bridge.enter(|| {
            let a = leak_static(c"loop.A");
            let b = leak_static(c"loop.B");
            unsafe {
                (*a).tp_base = b;
                (*b).tp_base = a;
            }
            let err = unsafe { bridge.type_ready(a) }.unwrap_err();
            assert!(matches!(err, BridgeError::ReentrantReady(ref name) if name == "loop.A"));
            assert!(err.is_fatal());
            unsafe {
                assert_eq!((*a).ready_state(), ReadyState::NotReady);
                assert_eq!((*b).ready_state(), ReadyState::NotReady);
            }
        });
    }

    #[test]
    fn test_failed_attach_leaves_no_mirror() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let object = bridge.as_pyobj(heap.ctx.object_type).unwrap();
            let object_refs = unsafe { object.refcnt() };
            let links = bridge.links.len();

            let w_cls = heap.new_class("Bad\0Name", vec![], IndexMap::new()).unwrap();
            let _root = heap.root(w_cls);
            for _ in 0..2 {
                let err = bridge.as_pyobj(w_cls).unwrap_err();
                let BridgeError::Exception(exc) = err else {
                    panic!("expected an exception, got {err}");
                };
                assert_eq!(exc.exc_type, heap.ctx.exceptions.value_error);
                assert!(bridge.links.native_of(w_cls).is_none());
            }
            assert_eq!(bridge.links.len(), links);
            assert_eq!(unsafe { object.refcnt() }, object_refs);
        });
    }

    #[test]
    fn test_layout_smaller_than_base_is_rejected() {
        let bridge = bridge();
        bridge.enter(|| {
            let base = leak_static(c"m.Big");
            let sub = leak_static(c"m.Small");
            unsafe {
                (*base).tp_basicsize = 64;
                (*sub).tp_basicsize = 32;
                (*sub).tp_base = base;
            }
            let err = unsafe { bridge.type_ready(sub) }.unwrap_err();
            assert!(matches!(
                err,
                BridgeError::LayoutConflict {
                    size: 32,
                    base_size: 64,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_heap_type_descriptor_is_released() {
        let bridge = bridge();
        bridge.enter(|| {
            let object = bridge.as_pyobj(bridge.heap.ctx.object_type).unwrap();
            let object_refs = unsafe { object.refcnt() };

            let w_cls = bridge
                .heap
                .new_class("Transient", vec![], IndexMap::new())
                .unwrap();
            bridge.as_pyobj(w_cls).unwrap();
            // tp_base, tp_bases and tp_mro each hold one.
            assert_eq!(unsafe { object.refcnt() }, object_refs + 3);

            bridge.heap.collect();
            assert!(!bridge.heap.is_alive(w_cls));
            assert!(bridge.drain_dead() >= 1);
            assert!(bridge.links.native_of(w_cls).is_none());
            assert_eq!(unsafe { object.refcnt() }, object_refs);
        });
    }

    #[test]
    fn test_type_modified_picks_up_new_methods() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let w_cls = heap.new_class("Late", vec![], IndexMap::new()).unwrap();
            let _root = heap.root(w_cls);
            let pto = descriptor(&bridge, w_cls);
            assert!(unsafe { (*(*pto).tp_as_number).nb_add }.is_none());

            let add = heap.new_function("__add__", |heap, _| Ok(heap.new_int(1)));
            heap.setattr(w_cls, "__add__", add).unwrap();
            unsafe { type_modified_wrapper(pto) };
            assert!(unsafe { (*(*pto).tp_as_number).nb_add }.is_some());
        });
    }

    #[test]
    fn test_lookup_and_subtype() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let int = bridge.as_pyobj(heap.ctx.int_type).unwrap().as_ptr();
            let boolean = bridge.as_pyobj(heap.ctx.bool_type).unwrap().as_ptr();
            unsafe {
                assert_eq!(type_is_subtype_wrapper(boolean, int), 1);
                assert_eq!(type_is_subtype_wrapper(int, boolean), 0);
                assert!(
                    (*boolean.cast::<PyTypeObject>())
                        .flags()
                        .contains(PyTypeFlags::LONG_SUBCLASS)
                );
            }

            let name = bridge.as_pyobj(heap.new_str("__add__")).unwrap().as_ptr();
            let found = unsafe { type_lookup_wrapper(boolean, name) };
            let w_add = heap.lookup(heap.ctx.int_type, "__add__").unwrap();
            assert_eq!(found, bridge.links.native_of(w_add).unwrap().as_ptr());

            let missing = bridge.as_pyobj(heap.new_str("nope")).unwrap().as_ptr();
            assert!(unsafe { type_lookup_wrapper(boolean, missing) }.is_null());
            assert!(bridge.errors.occurred().is_none());
        });
    }

    #[test]
    fn test_type_check() {
        let bridge = bridge();
        bridge.enter(|| {
            let heap = &bridge.heap;
            let w_cls = heap.new_class("Plain", vec![], IndexMap::new()).unwrap();
            let _root = heap.root(w_cls);
            let int_type = descriptor(&bridge, heap.ctx.int_type).cast::<PyObject>();
            let cls = descriptor(&bridge, w_cls).cast::<PyObject>();
            let int = bridge.as_pyobj(heap.new_int(2)).unwrap().as_ptr();
            unsafe {
                assert_eq!(type_check_wrapper(int_type), 1);
                assert_eq!(type_check_exact_wrapper(int_type), 1);
                assert_eq!(type_check_wrapper(cls), 1);
                assert_eq!(type_check_wrapper(int), 0);
                assert_eq!(type_check_exact_wrapper(int), 0);
            }
        });
    }
}
