//! Per-family layout strategies.
//!
//! Every managed type family that needs a native layout other than the bare
//! object header registers a [`TypeDescrSpec`]. Hooks a family leaves out
//! come from the nearest registered ancestor in [`TypeFamily::chain`], which
//! always ends at `object`.

use crate::{
    Bridge,
    abi::{Py_ssize_t, PyObject, destructor},
    error::BridgeResult,
    intobject, object,
    rawrefcount::PyObjectPtr,
    tupleobject, typeobject,
};
use core::mem::size_of;
use pybridge_common::lock::PyRwLock;
use pybridge_vm::{ObjectId, TypeFamily};
use std::collections::HashMap;

/// Allocates a zeroed native instance of `w_type` with refcount 1.
pub type AllocHook =
    unsafe fn(&Bridge, w_type: ObjectId, itemcount: Py_ssize_t) -> BridgeResult<PyObjectPtr>;
/// Fills a freshly allocated, already linked native object from its managed peer.
pub type AttachHook = unsafe fn(&Bridge, PyObjectPtr, ObjectId) -> BridgeResult<()>;
/// Builds and links a managed peer for a native-born object.
pub type RealizeHook = unsafe fn(&Bridge, PyObjectPtr) -> BridgeResult<ObjectId>;

/// A fully resolved strategy.
#[derive(Copy, Clone, Debug)]
pub struct TypeDescr {
    pub family: TypeFamily,
    pub basicsize: usize,
    pub itemsize: usize,
    pub alloc: AllocHook,
    pub attach: AttachHook,
    pub realize: RealizeHook,
    pub dealloc: destructor,
}

/// What a family registers; `None` inherits from the parent family.
#[derive(Copy, Clone, Debug)]
pub struct TypeDescrSpec {
    pub family: TypeFamily,
    pub basicsize: Option<usize>,
    pub itemsize: usize,
    pub alloc: Option<AllocHook>,
    pub attach: Option<AttachHook>,
    pub realize: Option<RealizeHook>,
    pub dealloc: Option<destructor>,
}

impl TypeDescrSpec {
    pub const fn new(family: TypeFamily) -> Self {
        Self {
            family,
            basicsize: None,
            itemsize: 0,
            alloc: None,
            attach: None,
            realize: None,
            dealloc: None,
        }
    }
}

#[derive(Debug)]
pub struct TypeDescrRegistry {
    registered: PyRwLock<HashMap<TypeFamily, TypeDescrSpec>>,
    resolved: PyRwLock<HashMap<TypeFamily, TypeDescr>>,
}

impl Default for TypeDescrRegistry {
    fn default() -> Self {
        let registry = Self {
            registered: PyRwLock::default(),
            resolved: PyRwLock::default(),
        };
        for spec in [
            object::TYPEDESCR,
            typeobject::TYPEDESCR,
            intobject::TYPEDESCR,
            tupleobject::TYPEDESCR,
        ] {
            registry.register(spec);
        }
        registry
    }
}

impl TypeDescrRegistry {
    /// Registers or replaces the strategy of `spec.family`.
    pub fn register(&self, spec: TypeDescrSpec) {
        self.registered.write().insert(spec.family, spec);
        // Any cached resolution may have inherited from the old entry.
        self.resolved.write().clear();
    }

    /// The strategy for instances of `family`, resolved once and cached.
    pub fn get(&self, family: TypeFamily) -> TypeDescr {
        if let Some(descr) = self.resolved.read().get(&family) {
            return *descr;
        }
        let descr = self.resolve(family);
        self.resolved.write().insert(family, descr);
        descr
    }

    fn resolve(&self, family: TypeFamily) -> TypeDescr {
        let registered = self.registered.read();
        let specs = family
            .chain()
            .filter_map(|f| registered.get(&f))
            .collect::<Vec<_>>();
        TypeDescr {
            family,
            basicsize: specs
                .iter()
                .find_map(|s| s.basicsize)
                .unwrap_or(size_of::<PyObject>()),
            itemsize: specs
                .iter()
                .map(|s| s.itemsize)
                .find(|&n| n != 0)
                .unwrap_or(0),
            alloc: specs
                .iter()
                .find_map(|s| s.alloc)
                .unwrap_or(object::object_alloc),
            attach: specs
                .iter()
                .find_map(|s| s.attach)
                .unwrap_or(object::object_attach),
            realize: specs
                .iter()
                .find_map(|s| s.realize)
                .unwrap_or(object::object_realize),
            dealloc: specs
                .iter()
                .find_map(|s| s.dealloc)
                .unwrap_or(object::object_dealloc_wrapper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tupleobject::PyTupleObject;

    #[test]
    fn test_inherit_from_parent_family() {
        let registry = TypeDescrRegistry::default();
        let int = registry.get(TypeFamily::Int);
        let boolean = registry.get(TypeFamily::Bool);
        assert_eq!(boolean.family, TypeFamily::Bool);
        assert_eq!(boolean.basicsize, int.basicsize);
        assert!(core::ptr::fn_addr_eq(boolean.dealloc, int.dealloc));

        let string = registry.get(TypeFamily::Str);
        assert_eq!(string.basicsize, size_of::<PyObject>());
        assert_eq!(
            registry.get(TypeFamily::Tuple).basicsize,
            size_of::<PyTupleObject>()
        );
    }

    #[test]
    fn test_register_overrides_cache() {
        let registry = TypeDescrRegistry::default();
        assert_eq!(registry.get(TypeFamily::Str).basicsize, size_of::<PyObject>());
        registry.register(TypeDescrSpec {
            basicsize: Some(64),
            ..TypeDescrSpec::new(TypeFamily::Str)
        });
        assert_eq!(registry.get(TypeFamily::Str).basicsize, 64);
    }
}
