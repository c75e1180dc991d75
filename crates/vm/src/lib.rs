//! The managed side of the bridge.
//!
//! This is a deliberately small tracing-GC object model: objects live in a
//! [`Heap`] addressed by stable [`ObjectId`]s, carry a class and a payload, and
//! are reclaimed by a mark-sweep pass that runs only at explicit safepoints
//! ([`Heap::collect`]). It exposes exactly what the native bridge needs from
//! a host runtime: identities, types with an MRO, attribute and method
//! dispatch, exceptions, external roots and death notifications.

#[macro_use]
extern crate log;

pub mod builtins;
mod context;
pub mod exceptions;
pub mod gc_state;
mod heap;
pub mod object;

pub use context::Context;
pub use exceptions::{PyException, PyResult};
pub use gc_state::{CollectStats, DeathListener, ExternalRoots};
pub use heap::{Heap, RootGuard};
pub use object::{NativeFn, ObjectId, Payload, PyFunction};

pub use builtins::r#type::{TypeData, TypeFamily, TypeFlags, TypeSpec};
