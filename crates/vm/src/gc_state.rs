//! Collection state and the mark-sweep pass.
//!
//! The collector does not know about native memory. Two hooks connect it to
//! the outside: [`ExternalRoots`] providers contribute extra roots at the start
//! of every pass, and [`DeathListener`]s hear about every swept object that
//! was [watched](crate::Heap::watch). Listeners run after the sweep, outside
//! the heap lock, and must not assume the object can still be inspected.

use crate::{Heap, ObjectId};
use pybridge_common::lock::{PyMutex, PyRwLock};
use std::{collections::HashSet, sync::Arc};

/// Source of roots the heap cannot see by itself.
pub trait ExternalRoots: Send + Sync {
    fn trace_roots(&self, tracer: &mut dyn FnMut(ObjectId));
}

pub type DeathListener = Arc<dyn Fn(ObjectId) + Send + Sync>;

/// Result of one [`Heap::collect`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub collected: usize,
    pub survivors: usize,
    pub external_roots: usize,
    /// Watched objects reported to the death listeners.
    pub notified: usize,
}

/// Totals over the life of the heap
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub collections: usize,
    pub collected: usize,
    pub notified: usize,
}

#[derive(Default)]
pub(crate) struct GcState {
    root_providers: PyRwLock<Vec<Arc<dyn ExternalRoots>>>,
    death_listeners: PyRwLock<Vec<DeathListener>>,
    stats: PyMutex<GcStats>,
    /// Prevents concurrent collections
    collecting: PyMutex<()>,
}

impl Heap {
    pub fn add_external_roots(&self, provider: Arc<dyn ExternalRoots>) {
        self.gc.root_providers.write().push(provider);
    }

    pub fn add_death_listener(&self, listener: DeathListener) {
        self.gc.death_listeners.write().push(listener);
    }

    pub fn gc_stats(&self) -> GcStats {
        *self.gc.stats.lock()
    }

    /// Runs a full mark-sweep pass.
    ///
    /// Roots are the builtins, explicit [roots](Heap::root) and whatever the
    /// external providers report. Callers must be at a safepoint: ids held
    /// only in local variables are not roots.
    pub fn collect(&self) -> CollectStats {
        let _collecting = self.gc.collecting.lock();

        let mut worklist: Vec<ObjectId> = self.ctx.permanent().collect();
        worklist.extend(self.root_ids());
        let providers = self.gc.root_providers.read().clone();
        let mut external_roots = 0;
        for provider in &providers {
            provider.trace_roots(&mut |id| {
                external_roots += 1;
                worklist.push(id);
            });
        }

        let (dead_watched, collected, survivors) = {
            let mut objects = self.objects().lock();
            let mut marked = HashSet::with_capacity(objects.len());
            while let Some(id) = worklist.pop() {
                if !marked.insert(id) {
                    continue;
                }
                if let Some(obj) = objects.get(&id) {
                    obj.trace(&mut |child| {
                        if !marked.contains(&child) {
                            worklist.push(child);
                        }
                    });
                }
            }

            let before = objects.len();
            let mut dead_watched = Vec::new();
            objects.retain(|id, obj| {
                let alive = marked.contains(id);
                if !alive && obj.watched {
                    dead_watched.push(*id);
                }
                alive
            });
            (dead_watched, before - objects.len(), objects.len())
        };

        let listeners = self.gc.death_listeners.read().clone();
        for &id in &dead_watched {
            for listener in &listeners {
                listener(id);
            }
        }

        let stats = CollectStats {
            collected,
            survivors,
            external_roots,
            notified: dead_watched.len(),
        };
        {
            let mut totals = self.gc.stats.lock();
            totals.collections += 1;
            totals.collected += collected;
            totals.notified += stats.notified;
        }
        debug!("gc: {stats:?}");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybridge_common::lock::PyMutex;

    struct FixedRoots(PyMutex<Vec<ObjectId>>);

    impl ExternalRoots for FixedRoots {
        fn trace_roots(&self, tracer: &mut dyn FnMut(ObjectId)) {
            self.0.lock().iter().copied().for_each(tracer);
        }
    }

    #[test]
    fn test_unrooted_objects_are_swept() {
        let heap = Heap::new();
        let baseline = heap.collect().survivors;
        let kept = heap.new_int(1);
        let dropped = heap.new_int(2);
        let root = heap.root(kept);

        let stats = heap.collect();
        assert_eq!(stats.collected, 1);
        assert_eq!(stats.survivors, baseline + 1);
        assert!(heap.is_alive(kept));
        assert!(!heap.is_alive(dropped));

        drop(root);
        heap.collect();
        assert!(!heap.is_alive(kept));
    }

    #[test]
    fn test_tracing_through_containers() {
        let heap = Heap::new();
        let item = heap.new_str("x");
        let tuple = heap.new_tuple(vec![item]);
        let _root = heap.root(tuple);
        heap.collect();
        assert!(heap.is_alive(item));
    }

    #[test]
    fn test_external_roots_and_death_listener() {
        let heap = Heap::new();
        let a = heap.new_int(1);
        let b = heap.new_int(2);
        assert!(heap.watch(a));
        assert!(heap.watch(b));

        let roots = Arc::new(FixedRoots(PyMutex::new(vec![a])));
        heap.add_external_roots(roots.clone());
        let dead = Arc::new(PyMutex::new(Vec::new()));
        let sink = dead.clone();
        heap.add_death_listener(Arc::new(move |id| sink.lock().push(id)));

        let stats = heap.collect();
        assert_eq!(stats.external_roots, 1);
        assert_eq!(stats.notified, 1);
        assert_eq!(*dead.lock(), [b]);

        roots.0.lock().clear();
        heap.collect();
        assert_eq!(*dead.lock(), [b, a]);
        assert_eq!(heap.gc_stats().notified, 2);
    }
}
