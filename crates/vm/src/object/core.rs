//! Object identities and the records stored in the heap.

use crate::{Heap, PyResult, builtins::r#type::TypeData};
use core::{fmt, num::NonZeroU64};
use indexmap::IndexMap;
use std::sync::Arc;

/// Identity of a managed object.
///
/// Ids are handed out monotonically and never reused by the heap that issued
/// them, so a stale id can be detected instead of aliasing a newer object.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    pub(crate) const fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Rebuilds an id from [`get`](Self::get). Zero means "no object".
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(#{})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Body of a builtin function. Methods receive the instance as `args[0]`.
pub type NativeFn = Arc<dyn Fn(&Heap, &[ObjectId]) -> PyResult<ObjectId> + Send + Sync>;

#[derive(Clone)]
pub struct PyFunction {
    pub name: String,
    pub func: NativeFn,
}

impl fmt::Debug for PyFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PyFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Payload {
    Object,
    None,
    Int(i64),
    Str(String),
    Tuple(Vec<ObjectId>),
    Type(Box<TypeData>),
    Function(PyFunction),
}

impl Payload {
    pub(crate) fn trace(&self, tracer: &mut impl FnMut(ObjectId)) {
        match self {
            Self::Tuple(items) => items.iter().copied().for_each(tracer),
            Self::Type(data) => data.trace(tracer),
            Self::Object | Self::None | Self::Int(_) | Self::Str(_) | Self::Function(_) => {}
        }
    }
}

#[derive(Debug)]
pub(crate) struct HeapObject {
    pub class: ObjectId,
    pub payload: Payload,
    pub dict: Option<IndexMap<String, ObjectId>>,
    /// Report this object to the death listeners when it is swept.
    pub watched: bool,
}

impl HeapObject {
    pub(crate) fn trace(&self, tracer: &mut impl FnMut(ObjectId)) {
        tracer(self.class);
        if let Some(dict) = &self.dict {
            dict.values().copied().for_each(&mut *tracer);
        }
        self.payload.trace(tracer);
    }
}
