use crate::{
    abi::PyTypeObject,
    error::{BridgeError, BridgeResult},
    pyerrors::ExceptionState,
    rawrefcount::{LinkTable, PyObjectPtr},
    settings::{Settings, TypeInitPolicy},
    typedescr::TypeDescrRegistry,
    typeobject,
};
use core::{cell::RefCell, sync::atomic::AtomicBool};
use pybridge_common::{
    GilLock,
    lock::{LazyLock, PyRwLock},
};
use pybridge_vm::{Heap, ObjectId};
use std::sync::{Arc, Weak};

/// The connection between one managed [`Heap`] and the native object world.
///
/// Everything the bridge knows lives here: the link table, the per-family
/// layout strategies, the exception slot and the global execution lock.
/// Native code reaches it through the thread's active bridge (see
/// [`enter`](Self::enter)) or the process-wide one (see
/// [`install`](Self::install)).
pub struct Bridge {
    pub heap: Arc<Heap>,
    pub settings: Settings,
    pub links: Arc<LinkTable>,
    pub typedescrs: TypeDescrRegistry,
    pub errors: ExceptionState,
    pub gil: GilLock,
    pub(crate) draining: AtomicBool,
    this: Weak<Bridge>,
}

impl core::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bridge")
            .field("heap", &self.heap)
            .field("settings", &self.settings)
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static BRIDGE_STACK: RefCell<Vec<Arc<Bridge>>> = const { RefCell::new(Vec::new()) };
}

static INSTALLED: LazyLock<PyRwLock<Option<Arc<Bridge>>>> = LazyLock::new(PyRwLock::default);

impl Bridge {
    /// Connects `heap` to the native side and builds the startup type
    /// descriptors that `settings.type_init` asks for.
    pub fn new(heap: Arc<Heap>, settings: Settings) -> BridgeResult<Arc<Self>> {
        let links = Arc::new(LinkTable::default());
        heap.add_external_roots(links.clone());
        let dead_links = Arc::downgrade(&links);
        heap.add_death_listener(Arc::new(move |id| {
            if let Some(links) = dead_links.upgrade() {
                links.queue_dead(id);
            }
        }));

        let bridge = Arc::new_cyclic(|this| Self {
            heap,
            settings,
            links,
            typedescrs: TypeDescrRegistry::default(),
            errors: ExceptionState::default(),
            gil: GilLock::new(),
            draining: AtomicBool::new(false),
            this: this.clone(),
        });
        bridge.enter(|| bridge.bootstrap())?;
        Ok(bridge)
    }

    /// Makes this bridge the one native code on this thread talks to while
    /// `f` runs.
    pub fn enter<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        BRIDGE_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        scopeguard::defer! {
            BRIDGE_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
        f()
    }

    /// Runs `f` with this bridge active, entering it only if it is not
    /// already the innermost one.
    pub(crate) fn entered<R>(&self, f: impl FnOnce() -> R) -> R {
        let active = BRIDGE_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .is_some_and(|top| core::ptr::eq(Arc::as_ptr(top), self))
        });
        match self.this.upgrade() {
            Some(this) if !active => this.enter(f),
            _ => f(),
        }
    }

    /// The bridge native code on this thread is talking to: the innermost
    /// [`enter`](Self::enter)ed one, else the installed one.
    pub fn current() -> Option<Arc<Self>> {
        BRIDGE_STACK
            .with(|stack| stack.borrow().last().cloned())
            .or_else(|| INSTALLED.read().clone())
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.this.clone()
    }

    pub(crate) fn current_or_fatal() -> Arc<Self> {
        Self::current().unwrap_or_else(|| crate::error::fatal_error(&BridgeError::NoBridge))
    }

    /// Makes this the process-wide bridge, returning the previous one.
    pub fn install(self: &Arc<Self>) -> Option<Arc<Self>> {
        INSTALLED.write().replace(self.clone())
    }

    pub fn uninstall() -> Option<Arc<Self>> {
        INSTALLED.write().take()
    }

    pub fn installed() -> Option<Arc<Self>> {
        INSTALLED.read().clone()
    }

    /// Builds the descriptors every later synthesis depends on.
    ///
    /// `type` is its own metatype and every descriptor's `tp_mro` is a
    /// tuple, so these are all allocated and linked first, then given their
    /// static fields, and only then readied.
    fn bootstrap(&self) -> BridgeResult<()> {
        let ctx = &self.heap.ctx;
        let types: Vec<ObjectId> = match self.settings.type_init {
            TypeInitPolicy::Eager => ctx.types().collect(),
            TypeInitPolicy::Lazy => vec![ctx.object_type, ctx.type_type, ctx.tuple_type],
        };

        let mut ptos = Vec::with_capacity(types.len());
        for &w_type in &types {
            let pto = typeobject::alloc_type_object()?;
            // SAFETY: freshly allocated with refcount 1, which is never
            // released, so static descriptors outlive every reference.
            unsafe { self.track_reference(PyObjectPtr::from_non_null(pto.cast()), w_type)? };
            ptos.push(pto);
        }
        for (&w_type, &pto) in types.iter().zip(&ptos) {
            let w_metatype = self
                .heap
                .class_of(w_type)
                .ok_or(BridgeError::DeadObject(w_type))?;
            let metatype = self.as_pyobj(w_metatype)?;
            // SAFETY: `pto` is a live, linked descriptor nobody else has seen yet.
            unsafe {
                (*pto.as_ptr()).ob_base.ob_base.ob_type = metatype.as_ptr().cast::<PyTypeObject>();
                typeobject::fill_type(self, pto.as_ptr(), w_type)?;
            }
        }
        for &pto in &ptos {
            // SAFETY: as above.
            unsafe { self.type_ready(pto.as_ptr())? };
        }
        debug!(
            "bootstrapped {} static type descriptors ({:?})",
            ptos.len(),
            self.settings.type_init
        );
        Ok(())
    }
}
