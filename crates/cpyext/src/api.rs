//! The call boundary.
//!
//! Every function native code can call is declared with [`cpython_api!`],
//! which produces three things from one Rust definition:
//!
//! * the Rust implementation, callable directly with a [`Bridge`];
//! * an `extern "C"` wrapper, exported under its C name when it has one;
//! * an [`ApiFunction`] record describing the signature, error convention
//!   and lock discipline, collected in [`FUNCTIONS`](crate::FUNCTIONS).
//!
//! The wrapper runs everything through [`trampoline`], which converts native
//! arguments to managed ones, turns a raised exception into the declared
//! error sentinel plus an entry in the exception slot, and converts the
//! result back.

use crate::{
    Bridge,
    abi::{PyObject, PyTypeObject},
    error::{BridgeError, BridgeResult, fatal_error},
    rawrefcount::PyObjectPtr,
};
use core::{
    ffi::{c_char, c_void},
    panic::AssertUnwindSafe,
};
use pybridge_vm::{ObjectId, PyException};
use std::panic::catch_unwind;

/// What a failing call returns to native code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorValue {
    /// A null pointer.
    Null,
    /// A specific integer, usually `-1`.
    Int(i64),
    /// The function is declared never to fail.
    CannotFail,
}

/// How a call interacts with the global execution lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Gil {
    /// The caller already holds the lock, or the function does not need it.
    None,
    /// Take the lock before the call and keep it afterwards.
    Acquire,
    /// Run with the caller's lock and give it up afterwards.
    Release,
    /// Take the lock for the duration of the call.
    Around,
}

impl Gil {
    pub const fn acquires(self) -> bool {
        matches!(self, Self::Acquire | Self::Around)
    }

    pub const fn releases(self) -> bool {
        matches!(self, Self::Release | Self::Around)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// A native object pointer converted to its managed object.
    Object,
    /// A native object pointer that may be null.
    OptionalObject,
    /// A pointer passed through untouched.
    Pointer,
    Int,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Int,
    Pointer,
    /// A managed object returned as a native pointer.
    Object {
        borrowed: bool,
    },
}

/// The signature and conventions of one boundary function.
pub struct ApiFunction {
    pub name: &'static str,
    /// The exported C symbol, if any.
    pub export: Option<&'static str>,
    pub args: &'static [ArgKind],
    pub ret: ReturnKind,
    pub error: ErrorValue,
    pub gil: Gil,
    #[doc(hidden)]
    pub wrapper: fn() -> *const c_void,
}

impl core::fmt::Debug for ApiFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApiFunction")
            .field("name", &self.name)
            .field("export", &self.export)
            .field("args", &self.args)
            .field("ret", &self.ret)
            .field("error", &self.error)
            .field("gil", &self.gil)
            .finish()
    }
}

impl ApiFunction {
    pub fn result_borrowed(&self) -> bool {
        matches!(self.ret, ReturnKind::Object { borrowed: true })
    }

    /// The address of the `extern "C"` wrapper.
    pub fn wrapper(&self) -> *const c_void {
        (self.wrapper)()
    }
}

/// The native-callable address of `func`.
pub fn get_wrapper(func: &ApiFunction) -> *const c_void {
    func.wrapper()
}

/// Conversion of one native argument into what the Rust body takes.
pub trait FromNativeArg: Sized {
    type Raw: Copy;
    const KIND: ArgKind;

    fn from_native(bridge: &Bridge, raw: Self::Raw) -> BridgeResult<Self>;
}

/// Conversion of a body's result into what the native caller receives.
pub trait IntoNativeReturn: Sized {
    type Raw: Copy;
    const KIND: ReturnKind;

    fn into_native(self, bridge: &Bridge) -> BridgeResult<Self::Raw>;

    /// The value returned after a failure: the declared sentinel, or a zero
    /// value for functions that cannot fail.
    fn error_raw(error: ErrorValue) -> Self::Raw;
}

/// A managed result handed to native code as a borrowed reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Borrowed(pub ObjectId);

impl FromNativeArg for ObjectId {
    type Raw = *mut PyObject;
    const KIND: ArgKind = ArgKind::Object;

    fn from_native(bridge: &Bridge, raw: Self::Raw) -> BridgeResult<Self> {
        let obj = PyObjectPtr::new(raw).ok_or(BridgeError::NullPointer)?;
        // SAFETY: native callers pass live objects.
        unsafe { bridge.from_native(obj) }
    }
}

impl FromNativeArg for Option<ObjectId> {
    type Raw = *mut PyObject;
    const KIND: ArgKind = ArgKind::OptionalObject;

    fn from_native(bridge: &Bridge, raw: Self::Raw) -> BridgeResult<Self> {
        // SAFETY: native callers pass live objects or null.
        unsafe { bridge.from_ref(raw) }
    }
}

macro_rules! passthrough_arg {
    ($($ty:ty => $kind:ident),* $(,)?) => {$(
        impl FromNativeArg for $ty {
            type Raw = Self;
            const KIND: ArgKind = ArgKind::$kind;

            fn from_native(_bridge: &Bridge, raw: Self::Raw) -> BridgeResult<Self> {
                Ok(raw)
            }
        }
    )*};
}

passthrough_arg! {
    *mut PyObject => Pointer,
    *mut PyTypeObject => Pointer,
    *mut c_void => Pointer,
    *const c_char => Pointer,
    i32 => Int,
    i64 => Int,
    isize => Int,
}

impl IntoNativeReturn for () {
    type Raw = ();
    const KIND: ReturnKind = ReturnKind::Void;

    fn into_native(self, _bridge: &Bridge) -> BridgeResult<Self::Raw> {
        Ok(())
    }

    fn error_raw(_error: ErrorValue) -> Self::Raw {}
}

macro_rules! int_return {
    ($($ty:ty),*) => {$(
        impl IntoNativeReturn for $ty {
            type Raw = Self;
            const KIND: ReturnKind = ReturnKind::Int;

            fn into_native(self, _bridge: &Bridge) -> BridgeResult<Self::Raw> {
                Ok(self)
            }

            fn error_raw(error: ErrorValue) -> Self::Raw {
                match error {
                    ErrorValue::Int(value) => value as $ty,
                    ErrorValue::Null | ErrorValue::CannotFail => 0,
                }
            }
        }
    )*};
}

int_return!(i32, i64, isize);

macro_rules! pointer_return {
    ($($ty:ty),*) => {$(
        impl IntoNativeReturn for $ty {
            type Raw = Self;
            const KIND: ReturnKind = ReturnKind::Pointer;

            fn into_native(self, _bridge: &Bridge) -> BridgeResult<Self::Raw> {
                Ok(self)
            }

            fn error_raw(_error: ErrorValue) -> Self::Raw {
                core::ptr::null_mut()
            }
        }
    )*};
}

pointer_return!(*mut PyObject, *mut c_void);

impl IntoNativeReturn for ObjectId {
    type Raw = *mut PyObject;
    const KIND: ReturnKind = ReturnKind::Object { borrowed: false };

    fn into_native(self, bridge: &Bridge) -> BridgeResult<Self::Raw> {
        bridge.make_ref(self).map(PyObjectPtr::as_ptr)
    }

    fn error_raw(_error: ErrorValue) -> Self::Raw {
        core::ptr::null_mut()
    }
}

impl IntoNativeReturn for Borrowed {
    type Raw = *mut PyObject;
    const KIND: ReturnKind = ReturnKind::Object { borrowed: true };

    fn into_native(self, bridge: &Bridge) -> BridgeResult<Self::Raw> {
        bridge.as_pyobj(self.0).map(PyObjectPtr::as_ptr)
    }

    fn error_raw(_error: ErrorValue) -> Self::Raw {
        core::ptr::null_mut()
    }
}

impl<T> IntoNativeReturn for Option<T>
where
    T: IntoNativeReturn<Raw = *mut PyObject>,
{
    type Raw = *mut PyObject;
    const KIND: ReturnKind = T::KIND;

    fn into_native(self, bridge: &Bridge) -> BridgeResult<Self::Raw> {
        match self {
            Some(value) => value.into_native(bridge),
            None => Ok(core::ptr::null_mut()),
        }
    }

    fn error_raw(_error: ErrorValue) -> Self::Raw {
        core::ptr::null_mut()
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cold]
fn fatal_boundary(api: &ApiFunction, what: &str) -> ! {
    error!(
        "Fatal error in the native object bridge, calling {}: {what}",
        api.name
    );
    error!("Either report a bug or consider not using this particular extension");
    std::process::abort()
}

/// Runs one boundary call. Used by the wrappers [`cpython_api!`] generates.
///
/// A managed exception from `convert` or `body` is stored in the exception
/// slot and the declared error value is returned. A panic in `body` becomes a
/// `SystemError`. Broken invariants, and any failure while converting the
/// result back, abort the process.
pub fn trampoline<A, R: IntoNativeReturn>(
    api: &'static ApiFunction,
    convert: impl FnOnce(&Bridge) -> BridgeResult<A>,
    body: impl FnOnce(&Bridge, A) -> BridgeResult<R>,
) -> R::Raw {
    let bridge = Bridge::current_or_fatal();
    if api.gil.acquires() {
        bridge.gil.acquire();
    }

    let outcome: Result<R, PyException> =
        match catch_unwind(AssertUnwindSafe(|| convert(&bridge))) {
            Err(panic) => fatal_boundary(api, &panic_message(&*panic)),
            Ok(Err(BridgeError::Exception(exc))) => Err(exc),
            Ok(Err(err)) => fatal_error(&err),
            Ok(Ok(args)) => match catch_unwind(AssertUnwindSafe(|| body(&bridge, args))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(BridgeError::Exception(exc))) => Err(exc),
                Ok(Err(err)) => fatal_error(&err),
                Err(panic) => {
                    let msg = panic_message(&*panic);
                    error!("panic in {}: {msg}", api.name);
                    Err(bridge.heap.new_system_error(msg))
                }
            },
        };

    let raw = match outcome {
        Ok(value) => match catch_unwind(AssertUnwindSafe(|| value.into_native(&bridge))) {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => fatal_boundary(api, &err.to_string()),
            Err(panic) => fatal_boundary(api, &panic_message(&*panic)),
        },
        Err(exc) => {
            if api.error == ErrorValue::CannotFail {
                error!(
                    "{} was declared not to fail, but raised {exc}",
                    api.name
                );
                bridge.errors.set_exception(bridge.heap.new_system_error(format!(
                    "The function '{}' was not supposed to fail",
                    api.name
                )));
            } else {
                bridge.errors.set_exception(exc);
            }
            R::error_raw(api.error)
        }
    };

    if api.gil.releases() && !bridge.gil.release() {
        fatal_error(&BridgeError::LockNotHeld);
    }
    raw
}

impl Bridge {
    /// Checks the result of calling a native function that returns a new
    /// reference, and takes that reference over.
    ///
    /// A null result must come with an exception; a non-null one must not.
    ///
    /// # Safety
    /// A non-null `result` must be a live native object owned by the caller.
    pub unsafe fn cpy_result(&self, result: *mut PyObject) -> BridgeResult<ObjectId> {
        let pending = self.errors.fetch();
        match (PyObjectPtr::new(result), pending) {
            (Some(obj), None) => unsafe { self.get_w_obj_and_decref(obj) },
            (Some(obj), Some(exc)) => {
                debug!("discarding {exc} set by a call that returned a value");
                unsafe { self.decref(obj)? };
                Err(self
                    .heap
                    .new_system_error("An exception was set, but function returned a value")
                    .into())
            }
            (None, Some(exc)) => Err(exc.into()),
            (None, None) => Err(self
                .heap
                .new_system_error("Function returned a NULL result without setting an exception")
                .into()),
        }
    }

    /// Checks an integer result where `-1` may signal an error.
    pub fn cpy_int_result<T: Copy + PartialEq + From<i8>>(&self, result: T) -> BridgeResult<T> {
        if result == T::from(-1) {
            self.errors.check_and_raise()?;
        }
        Ok(result)
    }

    /// Calls into native code with this bridge active.
    ///
    /// # Safety
    /// `f` must uphold whatever the native function requires.
    pub unsafe fn generic_cpy_call<R>(&self, f: impl FnOnce() -> R) -> R {
        self.entered(f)
    }
}

#[doc(hidden)]
pub mod __private {
    pub use paste::paste;
}

/// Declares a function native code can call. See the [module docs](self).
///
/// ```ignore
/// cpython_api! {
///     #[api(export = "PyTuple_Size", error = ErrorValue::Int(-1), gil = None)]
///     pub fn tuple_size(bridge, tuple: ObjectId) -> Py_ssize_t { ... }
/// }
/// ```
///
/// The body returns `BridgeResult<R>`; `bridge` names the `&Bridge` it runs
/// against. Besides `name`, the macro defines `name_wrapper`, the
/// `extern "C"` entry point, and `NAME`, its [`ApiFunction`].
#[macro_export]
macro_rules! cpython_api {
    (
        #[api(export = $export:literal, error = $error:expr, gil = $gil:ident)]
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($bridge:ident $(, $arg:ident: $ty:ty)* $(,)?) -> $ret:ty $body:block
    ) => {
        $crate::cpython_api!(@define
            [#[unsafe(export_name = $export)]] [Some($export)] $error, $gil,
            [$(#[$meta])*] $vis $name($bridge $(, $arg: $ty)*) -> $ret $body
        );
    };
    (
        #[api(error = $error:expr, gil = $gil:ident)]
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($bridge:ident $(, $arg:ident: $ty:ty)* $(,)?) -> $ret:ty $body:block
    ) => {
        $crate::cpython_api!(@define
            [] [None] $error, $gil,
            [$(#[$meta])*] $vis $name($bridge $(, $arg: $ty)*) -> $ret $body
        );
    };
    (@define
        [$($export_attr:tt)*] [$export:expr] $error:expr, $gil:ident,
        [$(#[$meta:meta])*] $vis:vis $name:ident($bridge:ident $(, $arg:ident: $ty:ty)*) -> $ret:ty $body:block
    ) => {
        $crate::api::__private::paste! {
            $(#[$meta])*
            #[allow(unused_unsafe, unused_variables)]
            $vis fn $name($bridge: &$crate::Bridge $(, $arg: $ty)*) -> $crate::BridgeResult<$ret> $body

            #[doc = concat!("`extern \"C\"` entry point of [`", stringify!($name), "`].")]
            $($export_attr)*
            #[allow(unused_variables)]
            $vis unsafe extern "C" fn [<$name _wrapper>](
                $($arg: <$ty as $crate::api::FromNativeArg>::Raw),*
            ) -> <$ret as $crate::api::IntoNativeReturn>::Raw {
                $crate::api::trampoline(
                    &[<$name:upper>],
                    |bridge| Ok(($(<$ty as $crate::api::FromNativeArg>::from_native(bridge, $arg)?,)*)),
                    |bridge, ($($arg,)*)| $name(bridge $(, $arg)*),
                )
            }

            #[doc = concat!("Boundary record of [`", stringify!($name), "`].")]
            $vis static [<$name:upper>]: $crate::api::ApiFunction = $crate::api::ApiFunction {
                name: stringify!($name),
                export: $export,
                args: &[$(<$ty as $crate::api::FromNativeArg>::KIND),*],
                ret: <$ret as $crate::api::IntoNativeReturn>::KIND,
                error: $error,
                gil: $crate::api::Gil::$gil,
                wrapper: || [<$name _wrapper>] as *const ::core::ffi::c_void,
            };
        }
    };
}
