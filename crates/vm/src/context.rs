//! Builtin types and singletons, created before the heap is handed out.

use crate::{
    Heap, ObjectId, Payload, PyFunction, PyResult,
    builtins::r#type::{TypeData, TypeFamily, TypeFlags},
    exceptions::ExceptionZoo,
    heap::fresh_id,
    object::HeapObject,
};
use core::sync::atomic::AtomicU64;
use indexmap::IndexMap;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Clone)]
pub struct Context {
    pub object_type: ObjectId,
    pub type_type: ObjectId,
    pub none_type: ObjectId,
    pub int_type: ObjectId,
    pub bool_type: ObjectId,
    pub str_type: ObjectId,
    pub tuple_type: ObjectId,
    pub function_type: ObjectId,
    pub exceptions: ExceptionZoo,
    pub none: ObjectId,
}

impl Context {
    /// Every builtin type, bases before subclasses.
    pub fn types(&self) -> impl Iterator<Item = ObjectId> {
        [
            self.object_type,
            self.type_type,
            self.none_type,
            self.int_type,
            self.bool_type,
            self.str_type,
            self.tuple_type,
            self.function_type,
        ]
        .into_iter()
        .chain(self.exceptions.iter())
    }

    /// Objects the collector never reclaims.
    pub(crate) fn permanent(&self) -> impl Iterator<Item = ObjectId> {
        self.types().chain([self.none])
    }

    pub(crate) fn init(objects: &mut HashMap<ObjectId, HeapObject>, next_id: &AtomicU64) -> Self {
        let object_type = fresh_id(next_id);
        let type_type = fresh_id(next_id);
        let function_type = fresh_id(next_id);

        let mut builder = Builder {
            objects,
            next_id,
            type_type,
            function_type,
        };
        builder.insert_type(object_type, "object", None, TypeFamily::Object, true);
        builder.insert_type(type_type, "type", Some(object_type), TypeFamily::Type, true);
        builder.insert_type(
            function_type,
            "function",
            Some(object_type),
            TypeFamily::Function,
            false,
        );
        builder.add_method(object_type, "__repr__", object_repr);
        builder.add_method(object_type, "__str__", object_str);

        let none_type = builder.new_type("NoneType", object_type, TypeFamily::NoneType, false);
        let int_type = builder.new_type("int", object_type, TypeFamily::Int, true);
        builder.add_method(int_type, "__repr__", int_repr);
        builder.add_method(int_type, "__hash__", int_hash);
        builder.add_method(int_type, "__add__", int_add);
        let bool_type = builder.new_type("bool", int_type, TypeFamily::Bool, false);
        let str_type = builder.new_type("str", object_type, TypeFamily::Str, true);
        builder.add_method(str_type, "__len__", str_len);
        let tuple_type = builder.new_type("tuple", object_type, TypeFamily::Tuple, true);
        builder.add_method(tuple_type, "__len__", tuple_len);
        builder.add_method(tuple_type, "__getitem__", tuple_getitem);

        let base_exception_type = builder.new_type(
            "BaseException",
            object_type,
            TypeFamily::BaseException,
            true,
        );
        let mut exception =
            |name: &str| builder.new_type(name, base_exception_type, TypeFamily::BaseException, true);
        let exception_type = exception("Exception");
        let mut exception =
            |name: &str| builder.new_type(name, exception_type, TypeFamily::BaseException, true);
        let exceptions = ExceptionZoo {
            base_exception_type,
            exception_type,
            system_error: exception("SystemError"),
            type_error: exception("TypeError"),
            attribute_error: exception("AttributeError"),
            value_error: exception("ValueError"),
            index_error: exception("IndexError"),
            overflow_error: exception("OverflowError"),
            stop_iteration: exception("StopIteration"),
            memory_error: exception("MemoryError"),
        };

        let none = fresh_id(next_id);
        builder.objects.insert(
            none,
            HeapObject {
                class: none_type,
                payload: Payload::None,
                dict: None,
                watched: false,
            },
        );

        Self {
            object_type,
            type_type,
            none_type,
            int_type,
            bool_type,
            str_type,
            tuple_type,
            function_type,
            exceptions,
            none,
        }
    }
}

type Method = fn(&Heap, &[ObjectId]) -> PyResult<ObjectId>;

struct Builder<'a> {
    objects: &'a mut HashMap<ObjectId, HeapObject>,
    next_id: &'a AtomicU64,
    type_type: ObjectId,
    function_type: ObjectId,
}

impl Builder<'_> {
    fn new_type(
        &mut self,
        name: &str,
        base: ObjectId,
        family: TypeFamily,
        subclassable: bool,
    ) -> ObjectId {
        let id = fresh_id(self.next_id);
        self.insert_type(id, name, Some(base), family, subclassable);
        id
    }

    fn insert_type(
        &mut self,
        id: ObjectId,
        name: &str,
        base: Option<ObjectId>,
        family: TypeFamily,
        subclassable: bool,
    ) {
        let mut mro = vec![id];
        if let Some(Payload::Type(base)) = base.and_then(|b| self.objects.get(&b)).map(|b| &b.payload)
        {
            mro.extend_from_slice(&base.mro);
        }
        let flags = if subclassable {
            TypeFlags::BASETYPE
        } else {
            TypeFlags::empty()
        };
        let data = TypeData {
            name: name.to_owned(),
            doc: None,
            bases: base.into_iter().collect(),
            base,
            mro,
            dict: IndexMap::new(),
            flags,
            family,
        };
        self.objects.insert(
            id,
            HeapObject {
                class: self.type_type,
                payload: Payload::Type(Box::new(data)),
                dict: None,
                watched: false,
            },
        );
    }

    fn add_method(&mut self, cls: ObjectId, name: &str, method: Method) {
        let func = fresh_id(self.next_id);
        self.objects.insert(
            func,
            HeapObject {
                class: self.function_type,
                payload: Payload::Function(PyFunction {
                    name: name.to_owned(),
                    func: Arc::new(method),
                }),
                dict: None,
                watched: false,
            },
        );
        if let Some(Payload::Type(data)) = self.objects.get_mut(&cls).map(|c| &mut c.payload) {
            data.dict.insert(name.to_owned(), func);
        }
    }
}

fn arg(heap: &Heap, args: &[ObjectId], index: usize) -> PyResult<ObjectId> {
    args.get(index).copied().ok_or_else(|| {
        heap.new_type_error(format!(
            "expected at least {} arguments, got {}",
            index + 1,
            args.len()
        ))
    })
}

fn int_arg(heap: &Heap, args: &[ObjectId], index: usize) -> PyResult<i64> {
    let obj = arg(heap, args, index)?;
    heap.int_value(obj).ok_or_else(|| {
        heap.new_type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            heap.class_name(obj)
        ))
    })
}

fn object_repr(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let zelf = arg(heap, args, 0)?;
    Ok(heap.new_str(format!("<{} object at {}>", heap.class_name(zelf), zelf)))
}

fn object_str(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let zelf = arg(heap, args, 0)?;
    heap.call_method(zelf, "__repr__", &[])
}

fn int_repr(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let value = int_arg(heap, args, 0)?;
    Ok(heap.new_str(value.to_string()))
}

fn int_hash(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let value = int_arg(heap, args, 0)?;
    // -1 is the error return of native hash functions
    Ok(heap.new_int(if value == -1 { -2 } else { value }))
}

fn int_add(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let a = int_arg(heap, args, 0)?;
    let b = int_arg(heap, args, 1)?;
    a.checked_add(b)
        .map(|sum| heap.new_int(sum))
        .ok_or_else(|| heap.new_overflow_error("int too large to convert"))
}

fn str_len(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let zelf = arg(heap, args, 0)?;
    let len = heap
        .str_value(zelf)
        .map(|s| s.chars().count())
        .ok_or_else(|| heap.new_type_error("descriptor '__len__' requires a 'str' object"))?;
    Ok(heap.new_int(len as i64))
}

fn tuple_len(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let zelf = arg(heap, args, 0)?;
    let items = heap
        .tuple_items(zelf)
        .ok_or_else(|| heap.new_type_error("descriptor '__len__' requires a 'tuple' object"))?;
    Ok(heap.new_int(items.len() as i64))
}

fn tuple_getitem(heap: &Heap, args: &[ObjectId]) -> PyResult<ObjectId> {
    let zelf = arg(heap, args, 0)?;
    let index = int_arg(heap, args, 1)?;
    let items = heap
        .tuple_items(zelf)
        .ok_or_else(|| heap.new_type_error("descriptor '__getitem__' requires a 'tuple' object"))?;
    let len = items.len() as i64;
    let index = if index < 0 { index + len } else { index };
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i).copied())
        .ok_or_else(|| heap.new_index_error("tuple index out of range"))
}
