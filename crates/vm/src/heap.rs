use crate::{
    Context, ObjectId, Payload, PyFunction, PyResult,
    builtins::r#type::{TypeData, TypeFamily, TypeFlags, TypeSpec, linearise_mro},
    gc_state::GcState,
    object::HeapObject,
};
use core::{
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};
use indexmap::IndexMap;
use pybridge_common::lock::PyMutex;
use std::{collections::HashMap, sync::Arc};

pub(crate) fn fresh_id(counter: &AtomicU64) -> ObjectId {
    ObjectId::new(NonZeroU64::MIN.saturating_add(counter.fetch_add(1, Ordering::Relaxed)))
}

/// The managed object space.
///
/// Objects are only reclaimed by [`collect`](Self::collect); anything alive
/// when a method is entered stays alive until that method returns.
pub struct Heap {
    objects: PyMutex<HashMap<ObjectId, HeapObject>>,
    next_id: AtomicU64,
    roots: PyMutex<HashMap<ObjectId, usize>>,
    pub ctx: Context,
    pub(crate) gc: GcState,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .finish_non_exhaustive()
    }
}

impl Heap {
    pub fn new() -> Self {
        let next_id = AtomicU64::new(0);
        let mut objects = HashMap::new();
        let ctx = Context::init(&mut objects, &next_id);
        Self {
            objects: PyMutex::new(objects),
            next_id,
            roots: PyMutex::default(),
            ctx,
            gc: GcState::default(),
        }
    }

    pub(crate) fn objects(&self) -> &PyMutex<HashMap<ObjectId, HeapObject>> {
        &self.objects
    }

    fn alloc(
        &self,
        class: ObjectId,
        payload: Payload,
        dict: Option<IndexMap<String, ObjectId>>,
    ) -> ObjectId {
        let id = fresh_id(&self.next_id);
        self.objects.lock().insert(
            id,
            HeapObject {
                class,
                payload,
                dict,
                watched: false,
            },
        );
        id
    }

    fn with_object<R>(&self, id: ObjectId, f: impl FnOnce(&HeapObject) -> R) -> Option<R> {
        self.objects.lock().get(&id).map(f)
    }

    fn with_object_mut<R>(&self, id: ObjectId, f: impl FnOnce(&mut HeapObject) -> R) -> Option<R> {
        self.objects.lock().get_mut(&id).map(f)
    }

    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.objects.lock().contains_key(&id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn class_of(&self, id: ObjectId) -> Option<ObjectId> {
        self.with_object(id, |obj| obj.class)
    }

    pub fn with_payload<R>(&self, id: ObjectId, f: impl FnOnce(&Payload) -> R) -> Option<R> {
        self.with_object(id, |obj| f(&obj.payload))
    }

    pub fn with_type<R>(&self, cls: ObjectId, f: impl FnOnce(&TypeData) -> R) -> Option<R> {
        self.with_object(cls, |obj| match &obj.payload {
            Payload::Type(data) => Some(f(data)),
            _ => None,
        })
        .flatten()
    }

    fn with_type_mut<R>(&self, cls: ObjectId, f: impl FnOnce(&mut TypeData) -> R) -> Option<R> {
        self.with_object_mut(cls, |obj| match &mut obj.payload {
            Payload::Type(data) => Some(f(data)),
            _ => None,
        })
        .flatten()
    }

    pub fn is_type(&self, id: ObjectId) -> bool {
        self.with_type(id, |_| ()).is_some()
    }

    pub fn type_name(&self, cls: ObjectId) -> String {
        self.with_type(cls, |data| data.name.clone())
            .unwrap_or_else(|| format!("<unknown type {cls}>"))
    }

    pub fn class_name(&self, obj: ObjectId) -> String {
        match self.class_of(obj) {
            Some(cls) => self.type_name(cls),
            None => format!("<dead object {obj}>"),
        }
    }

    pub fn type_family(&self, cls: ObjectId) -> Option<TypeFamily> {
        self.with_type(cls, |data| data.family)
    }

    pub fn type_mro(&self, cls: ObjectId) -> Option<Vec<ObjectId>> {
        self.with_type(cls, |data| data.mro.clone())
    }

    pub fn is_subtype(&self, sub: ObjectId, sup: ObjectId) -> bool {
        sub == sup || self.with_type(sub, |data| data.mro.contains(&sup)) == Some(true)
    }

    pub fn isinstance(&self, obj: ObjectId, cls: ObjectId) -> bool {
        self.class_of(obj)
            .is_some_and(|class| self.is_subtype(class, cls))
    }

    /// Finds `name` in the dicts along `cls`'s MRO.
    pub fn lookup(&self, cls: ObjectId, name: &str) -> Option<ObjectId> {
        let objects = self.objects.lock();
        let Some(HeapObject {
            payload: Payload::Type(data),
            ..
        }) = objects.get(&cls)
        else {
            return None;
        };
        data.mro.iter().find_map(|cls| match objects.get(cls) {
            Some(HeapObject {
                payload: Payload::Type(data),
                ..
            }) => data.dict.get(name).copied(),
            _ => None,
        })
    }

    /// Whether `cls` itself, not a base, defines `name`.
    pub fn defines(&self, cls: ObjectId, name: &str) -> bool {
        self.with_type(cls, |data| data.dict.contains_key(name)) == Some(true)
    }

    pub fn set_type_attr(&self, cls: ObjectId, name: &str, value: ObjectId) -> PyResult<()> {
        self.with_type_mut(cls, |data| {
            data.dict.insert(name.to_owned(), value);
        })
        .ok_or_else(|| self.new_type_error("attribute target is not a type"))
    }

    pub fn new_int(&self, value: i64) -> ObjectId {
        self.alloc(self.ctx.int_type, Payload::Int(value), None)
    }

    /// An int whose class is `cls`, a subclass of `int`.
    pub fn new_int_of(&self, cls: ObjectId, value: i64) -> PyResult<ObjectId> {
        if !self.is_subtype(cls, self.ctx.int_type) {
            return Err(self.new_type_error(format!(
                "{} is not a subtype of int",
                self.type_name(cls)
            )));
        }
        Ok(self.alloc(cls, Payload::Int(value), self.instance_dict(cls)))
    }

    pub fn new_bool(&self, value: bool) -> ObjectId {
        self.alloc(self.ctx.bool_type, Payload::Int(value.into()), None)
    }

    pub fn new_str(&self, value: impl Into<String>) -> ObjectId {
        self.alloc(self.ctx.str_type, Payload::Str(value.into()), None)
    }

    pub fn new_tuple(&self, items: Vec<ObjectId>) -> ObjectId {
        self.alloc(self.ctx.tuple_type, Payload::Tuple(items), None)
    }

    /// A tuple whose class is `cls`, a subclass of `tuple`.
    pub fn new_tuple_of(&self, cls: ObjectId, items: Vec<ObjectId>) -> PyResult<ObjectId> {
        if !self.is_subtype(cls, self.ctx.tuple_type) {
            return Err(self.new_type_error(format!(
                "{} is not a subtype of tuple",
                self.type_name(cls)
            )));
        }
        Ok(self.alloc(cls, Payload::Tuple(items), self.instance_dict(cls)))
    }

    pub fn new_function(
        &self,
        name: impl Into<String>,
        func: impl Fn(&Self, &[ObjectId]) -> PyResult<ObjectId> + Send + Sync + 'static,
    ) -> ObjectId {
        let func = PyFunction {
            name: name.into(),
            func: Arc::new(func),
        };
        self.alloc(self.ctx.function_type, Payload::Function(func), None)
    }

    pub fn int_value(&self, id: ObjectId) -> Option<i64> {
        self.with_payload(id, |payload| match payload {
            Payload::Int(value) => Some(*value),
            _ => None,
        })
        .flatten()
    }

    pub fn str_value(&self, id: ObjectId) -> Option<String> {
        self.with_payload(id, |payload| match payload {
            Payload::Str(value) => Some(value.clone()),
            _ => None,
        })
        .flatten()
    }

    pub fn tuple_items(&self, id: ObjectId) -> Option<Vec<ObjectId>> {
        self.with_payload(id, |payload| match payload {
            Payload::Tuple(items) => Some(items.clone()),
            _ => None,
        })
        .flatten()
    }

    fn instance_dict(&self, cls: ObjectId) -> Option<IndexMap<String, ObjectId>> {
        let has_dict = self.with_type(cls, |data| {
            data.is_heap_type()
                || matches!(data.family, TypeFamily::Object | TypeFamily::BaseException)
        });
        (has_dict == Some(true)).then(IndexMap::new)
    }

    /// A fresh, empty instance of `cls` with the payload its family expects.
    pub fn new_instance(&self, cls: ObjectId) -> PyResult<ObjectId> {
        let Some((family, flags)) = self.with_type(cls, |data| (data.family, data.flags)) else {
            return Err(self.new_type_error(format!(
                "{} is not a type object",
                self.class_name(cls)
            )));
        };
        if flags.contains(TypeFlags::ABSTRACT) {
            return Err(self.new_type_error(format!(
                "Can't instantiate abstract class {}",
                self.type_name(cls)
            )));
        }
        let payload = match family {
            TypeFamily::Object | TypeFamily::BaseException => Payload::Object,
            TypeFamily::Int | TypeFamily::Bool => Payload::Int(0),
            TypeFamily::Str => Payload::Str(String::new()),
            TypeFamily::Tuple => Payload::Tuple(Vec::new()),
            TypeFamily::NoneType | TypeFamily::Type | TypeFamily::Function => {
                return Err(self.new_type_error(format!(
                    "cannot create '{}' instances",
                    self.type_name(cls)
                )));
            }
        };
        Ok(self.alloc(cls, payload, self.instance_dict(cls)))
    }

    pub fn call(&self, callable: ObjectId, args: &[ObjectId]) -> PyResult<ObjectId> {
        enum Target {
            Function(crate::NativeFn),
            Type,
        }
        let target = self
            .with_payload(callable, |payload| match payload {
                Payload::Function(f) => Some(Target::Function(f.func.clone())),
                Payload::Type(_) => Some(Target::Type),
                _ => None,
            })
            .flatten();
        match target {
            Some(Target::Function(func)) => func(self, args),
            Some(Target::Type) => {
                let obj = self.new_instance(callable)?;
                if let Some(init) = self.lookup(callable, "__init__") {
                    let mut init_args = Vec::with_capacity(args.len() + 1);
                    init_args.push(obj);
                    init_args.extend_from_slice(args);
                    self.call(init, &init_args)?;
                }
                Ok(obj)
            }
            None => Err(self.new_type_error(format!(
                "'{}' object is not callable",
                self.class_name(callable)
            ))),
        }
    }

    /// Looks `name` up on the class of `obj` and calls it with `obj` prepended.
    pub fn call_method(&self, obj: ObjectId, name: &str, args: &[ObjectId]) -> PyResult<ObjectId> {
        let cls = self
            .class_of(obj)
            .ok_or_else(|| self.new_system_error(format!("call on dead object {obj}")))?;
        let method = self.lookup(cls, name).ok_or_else(|| {
            self.new_attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                self.type_name(cls)
            ))
        })?;
        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push(obj);
        full_args.extend_from_slice(args);
        self.call(method, &full_args)
    }

    pub fn getattr(&self, obj: ObjectId, name: &str) -> PyResult<ObjectId> {
        let own = self
            .with_object(obj, |o| o.dict.as_ref().and_then(|d| d.get(name).copied()))
            .flatten();
        if let Some(value) = own {
            return Ok(value);
        }
        if let Some(value) = self.is_type(obj).then(|| self.lookup(obj, name)).flatten() {
            return Ok(value);
        }
        self.class_of(obj)
            .and_then(|cls| self.lookup(cls, name))
            .ok_or_else(|| {
                self.new_attribute_error(format!(
                    "'{}' object has no attribute '{name}'",
                    self.class_name(obj)
                ))
            })
    }

    pub fn setattr(&self, obj: ObjectId, name: &str, value: ObjectId) -> PyResult<()> {
        if self.is_type(obj) {
            let heap_type = self.with_type(obj, TypeData::is_heap_type) == Some(true);
            if !heap_type {
                return Err(self.new_type_error(format!(
                    "cannot set '{name}' attribute of immutable type '{}'",
                    self.type_name(obj)
                )));
            }
            return self.set_type_attr(obj, name, value);
        }
        let stored = self
            .with_object_mut(obj, |o| {
                o.dict.as_mut().map(|d| {
                    d.insert(name.to_owned(), value);
                })
            })
            .flatten();
        stored.ok_or_else(|| {
            self.new_attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                self.class_name(obj)
            ))
        })
    }

    pub fn delattr(&self, obj: ObjectId, name: &str) -> PyResult<()> {
        let removed = if self.is_type(obj) {
            if self.with_type(obj, TypeData::is_heap_type) != Some(true) {
                return Err(self.new_type_error(format!(
                    "cannot delete '{name}' attribute of immutable type '{}'",
                    self.type_name(obj)
                )));
            }
            self.with_type_mut(obj, |data| data.dict.shift_remove(name).is_some())
        } else {
            self.with_object_mut(obj, |o| {
                o.dict
                    .as_mut()
                    .is_some_and(|d| d.shift_remove(name).is_some())
            })
        };
        if removed == Some(true) {
            Ok(())
        } else {
            Err(self.new_attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                self.class_name(obj)
            )))
        }
    }

    /// Truth value testing: `__bool__`, then `__len__`, then `True`.
    pub fn is_true(&self, obj: ObjectId) -> PyResult<bool> {
        let builtin = self
            .with_payload(obj, |payload| match payload {
                Payload::None => Some(false),
                Payload::Int(v) => Some(*v != 0),
                Payload::Str(s) => Some(!s.is_empty()),
                Payload::Tuple(items) => Some(!items.is_empty()),
                _ => None,
            })
            .flatten();
        if let Some(truth) = builtin {
            return Ok(truth);
        }
        let cls = self
            .class_of(obj)
            .ok_or_else(|| self.new_system_error(format!("truth test of dead object {obj}")))?;
        for name in ["__bool__", "__len__"] {
            if self.lookup(cls, name).is_some() {
                let result = self.call_method(obj, name, &[])?;
                return self.int_value(result).map(|v| v != 0).ok_or_else(|| {
                    self.new_type_error(format!(
                        "{name} should return an int, not {}",
                        self.class_name(result)
                    ))
                });
            }
        }
        Ok(true)
    }

    /// Creates a type, computing its MRO, best base and instance family.
    pub fn new_type(&self, spec: TypeSpec) -> PyResult<ObjectId> {
        let TypeSpec {
            name,
            doc,
            bases,
            dict,
            flags,
            metaclass,
        } = spec;
        let bases = if bases.is_empty() {
            vec![self.ctx.object_type]
        } else {
            bases
        };
        for (i, base) in bases.iter().enumerate() {
            if !self.is_type(*base) {
                return Err(self.new_type_error("bases must be types"));
            }
            if bases[..i].contains(base) {
                return Err(self.new_type_error(format!(
                    "duplicate base class {}",
                    self.type_name(*base)
                )));
            }
        }
        // Native descriptors pick their own bases; only class statements are
        // held to BASETYPE.
        let best = self.best_base(&bases, !flags.contains(TypeFlags::NATIVE))?;
        let family = self.type_family(best).unwrap_or(TypeFamily::Object);

        let mros = bases
            .iter()
            .map(|base| self.type_mro(*base).unwrap_or_else(|| vec![*base]))
            .collect();
        let merged = linearise_mro(mros, |id| self.type_name(id))
            .map_err(|msg| self.new_type_error(msg))?;

        let class = metaclass.unwrap_or(self.ctx.type_type);
        let data = TypeData {
            name,
            doc,
            bases,
            base: Some(best),
            mro: Vec::new(),
            dict,
            flags,
            family,
        };
        let id = self.alloc(class, Payload::Type(Box::new(data)), None);
        self.with_type_mut(id, |data| {
            data.mro.reserve(merged.len() + 1);
            data.mro.push(id);
            data.mro.extend(merged);
        });
        debug!("new type {} ({id}), family {family:?}", self.type_name(id));
        Ok(id)
    }

    /// A subclassable heap type, the way a class statement creates one.
    pub fn new_class(
        &self,
        name: &str,
        bases: Vec<ObjectId>,
        dict: IndexMap<String, ObjectId>,
    ) -> PyResult<ObjectId> {
        self.new_type(TypeSpec::heap(name, bases).with_dict(dict))
    }

    fn solid_base(&self, cls: ObjectId) -> ObjectId {
        let (base, family) = self
            .with_type(cls, |data| (data.base, data.family))
            .unwrap_or((None, TypeFamily::Object));
        let base = match base {
            Some(base) => self.solid_base(base),
            None => self.ctx.object_type,
        };
        if self.type_family(base) != Some(family) {
            cls
        } else {
            base
        }
    }

    fn best_base(&self, bases: &[ObjectId], check_subclassable: bool) -> PyResult<ObjectId> {
        let mut base = None;
        let mut winner: Option<ObjectId> = None;

        for &base_i in bases {
            let subclassable =
                self.with_type(base_i, |data| data.flags.contains(TypeFlags::BASETYPE));
            if check_subclassable && subclassable != Some(true) {
                return Err(self.new_type_error(format!(
                    "type '{}' is not an acceptable base type",
                    self.type_name(base_i)
                )));
            }

            let candidate = self.solid_base(base_i);
            match winner {
                None => {
                    winner = Some(candidate);
                    base = Some(base_i);
                }
                Some(w) if self.is_subtype(w, candidate) => {}
                Some(w) if self.is_subtype(candidate, w) => {
                    winner = Some(candidate);
                    base = Some(base_i);
                }
                Some(_) => {
                    return Err(
                        self.new_type_error("multiple bases have instance layout conflict")
                    );
                }
            }
        }

        base.ok_or_else(|| self.new_type_error("a type needs at least one base"))
    }

    pub fn add_root(&self, id: ObjectId) {
        *self.roots.lock().entry(id).or_insert(0) += 1;
    }

    pub fn remove_root(&self, id: ObjectId) {
        let mut roots = self.roots.lock();
        if let Some(count) = roots.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                roots.remove(&id);
            }
        }
    }

    /// Keeps `id` alive until the guard is dropped.
    pub fn root(&self, id: ObjectId) -> RootGuard<'_> {
        self.add_root(id);
        RootGuard { heap: self, id }
    }

    pub(crate) fn root_ids(&self) -> Vec<ObjectId> {
        self.roots.lock().keys().copied().collect()
    }

    /// Asks for a death notification when `id` is swept. Returns `false` if
    /// the object is already gone.
    pub fn watch(&self, id: ObjectId) -> bool {
        self.with_object_mut(id, |obj| obj.watched = true).is_some()
    }
}

#[derive(Debug)]
pub struct RootGuard<'a> {
    heap: &'a Heap,
    id: ObjectId,
}

impl RootGuard<'_> {
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.heap.remove_root(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_mro() {
        let heap = Heap::new();
        let ctx = &heap.ctx;
        assert_eq!(
            heap.type_mro(ctx.bool_type).unwrap(),
            [ctx.bool_type, ctx.int_type, ctx.object_type]
        );
        assert_eq!(heap.class_of(ctx.type_type), Some(ctx.type_type));
        assert!(heap.is_subtype(ctx.exceptions.type_error, ctx.exceptions.exception_type));
    }

    #[test]
    fn test_class_statement() {
        let heap = Heap::new();
        let animal = heap
            .new_class("Animal", vec![], IndexMap::new())
            .unwrap();
        let dog = heap.new_class("Dog", vec![animal], IndexMap::new()).unwrap();
        assert_eq!(
            heap.type_mro(dog).unwrap(),
            [dog, animal, heap.ctx.object_type]
        );
        assert_eq!(heap.type_family(dog), Some(TypeFamily::Object));

        let myint = heap
            .new_class("MyInt", vec![heap.ctx.int_type], IndexMap::new())
            .unwrap();
        assert_eq!(heap.type_family(myint), Some(TypeFamily::Int));
        let obj = heap.call(myint, &[]).unwrap();
        assert_eq!(heap.int_value(obj), Some(0));
    }

    #[test]
    fn test_layout_conflict() {
        let heap = Heap::new();
        let err = heap
            .new_class("Bad", vec![heap.ctx.int_type, heap.ctx.str_type], IndexMap::new())
            .unwrap_err();
        assert_eq!(err.exc_type, heap.ctx.exceptions.type_error);
        assert!(err.message.contains("layout conflict"));

        let err = heap
            .new_class("Bad", vec![heap.ctx.bool_type], IndexMap::new())
            .unwrap_err();
        assert!(err.message.contains("not an acceptable base type"));
    }

    #[test]
    fn test_method_dispatch() {
        let heap = Heap::new();
        let a = heap.new_int(40);
        let b = heap.new_int(2);
        let sum = heap.call_method(a, "__add__", &[b]).unwrap();
        assert_eq!(heap.int_value(sum), Some(42));

        let repr = heap.call_method(sum, "__str__", &[]).unwrap();
        assert_eq!(heap.str_value(repr).as_deref(), Some("42"));

        let err = heap.call_method(a, "__len__", &[]).unwrap_err();
        assert_eq!(err.exc_type, heap.ctx.exceptions.attribute_error);
    }

    #[test]
    fn test_attributes() {
        let heap = Heap::new();
        let cls = heap.new_class("C", vec![], IndexMap::new()).unwrap();
        let obj = heap.new_instance(cls).unwrap();
        let value = heap.new_int(7);
        heap.setattr(obj, "x", value).unwrap();
        assert_eq!(heap.getattr(obj, "x").unwrap(), value);
        assert!(heap.getattr(obj, "y").is_err());
        assert!(heap.setattr(heap.ctx.int_type, "x", value).is_err());
        heap.delattr(obj, "x").unwrap();
        assert!(heap.delattr(obj, "x").is_err());
    }

    #[test]
    fn test_truth() {
        let heap = Heap::new();
        assert!(!heap.is_true(heap.ctx.none).unwrap());
        assert!(heap.is_true(heap.new_int(3)).unwrap());
        assert!(!heap.is_true(heap.new_tuple(vec![])).unwrap());
        let cls = heap.new_class("C", vec![], IndexMap::new()).unwrap();
        assert!(heap.is_true(heap.new_instance(cls).unwrap()).unwrap());
    }
}
