mod core;

pub use self::core::{NativeFn, ObjectId, Payload, PyFunction};
pub(crate) use self::core::HeapObject;
