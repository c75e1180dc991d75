//! Primitives shared by the pybridge crates.

pub mod gil;
pub mod lock;

pub use gil::{GilGuard, GilLock};
