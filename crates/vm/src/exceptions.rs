//! Managed exceptions.
//!
//! The managed side reports failures through [`PyResult`]; the bridge stores
//! them in its exception slot when they have to cross into native code.

use crate::{Heap, ObjectId};

/// A raised managed exception: its class and message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{type_name}: {message}")]
pub struct PyException {
    pub exc_type: ObjectId,
    pub type_name: String,
    pub message: String,
}

pub type PyResult<T = ObjectId> = Result<T, PyException>;

#[derive(Debug, Clone)]
pub struct ExceptionZoo {
    pub base_exception_type: ObjectId,
    pub exception_type: ObjectId,
    pub system_error: ObjectId,
    pub type_error: ObjectId,
    pub attribute_error: ObjectId,
    pub value_error: ObjectId,
    pub index_error: ObjectId,
    pub overflow_error: ObjectId,
    pub stop_iteration: ObjectId,
    pub memory_error: ObjectId,
}

impl ExceptionZoo {
    pub(crate) fn iter(&self) -> impl Iterator<Item = ObjectId> {
        [
            self.base_exception_type,
            self.exception_type,
            self.system_error,
            self.type_error,
            self.attribute_error,
            self.value_error,
            self.index_error,
            self.overflow_error,
            self.stop_iteration,
            self.memory_error,
        ]
        .into_iter()
    }
}

impl Heap {
    pub fn new_exception(&self, exc_type: ObjectId, message: impl Into<String>) -> PyException {
        PyException {
            exc_type,
            type_name: self.type_name(exc_type),
            message: message.into(),
        }
    }

    pub fn new_system_error(&self, message: impl Into<String>) -> PyException {
        self.new_exception(self.ctx.exceptions.system_error, message)
    }

    pub fn new_type_error(&self, message: impl Into<String>) -> PyException {
        self.new_exception(self.ctx.exceptions.type_error, message)
    }

    pub fn new_attribute_error(&self, message: impl Into<String>) -> PyException {
        self.new_exception(self.ctx.exceptions.attribute_error, message)
    }

    pub fn new_value_error(&self, message: impl Into<String>) -> PyException {
        self.new_exception(self.ctx.exceptions.value_error, message)
    }

    pub fn new_index_error(&self, message: impl Into<String>) -> PyException {
        self.new_exception(self.ctx.exceptions.index_error, message)
    }

    pub fn new_overflow_error(&self, message: impl Into<String>) -> PyException {
        self.new_exception(self.ctx.exceptions.overflow_error, message)
    }

    pub fn new_memory_error(&self) -> PyException {
        self.new_exception(self.ctx.exceptions.memory_error, "")
    }

    pub fn new_stop_iteration(&self) -> PyException {
        self.new_exception(self.ctx.exceptions.stop_iteration, "")
    }

    /// `isinstance(exc, cls)` for a raised exception.
    pub fn exception_matches(&self, exc: &PyException, cls: ObjectId) -> bool {
        self.is_subtype(exc.exc_type, cls)
    }
}
