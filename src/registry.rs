use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, ThreadId};

use crate::instances::GuiInstance;
use crate::util::{read, write};

/// Per-process map from owning thread to a GUI instance.
///
/// GUI instances are thread-affine: the thread that created one is the only
/// thread that may touch it. Lookups and broadcasts take the read lock,
/// register/unregister take the write lock.
pub struct InstanceRegistry<T: ?Sized> {
    entries: RwLock<HashMap<ThreadId, Arc<T>>>,
}

impl<T: ?Sized> Default for InstanceRegistry<T> {
    fn default() -> Self {
        InstanceRegistry { entries: RwLock::new(HashMap::new()) }
    }
}

impl<T: ?Sized> InstanceRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `instance` for `thread`, returning whatever it replaced.
    pub fn register(&self, thread: ThreadId, instance: Arc<T>) -> Option<Arc<T>> {
        write(&self.entries).insert(thread, instance)
    }

    /// Remove the mapping for `thread`. `None` when nothing was registered,
    /// so a second unregister is a no-op.
    pub fn unregister(&self, thread: ThreadId) -> Option<Arc<T>> {
        write(&self.entries).remove(&thread)
    }

    pub fn lookup(&self, thread: ThreadId) -> Option<Arc<T>> {
        read(&self.entries).get(&thread).cloned()
    }

    pub fn current(&self) -> Option<Arc<T>> {
        self.lookup(thread::current().id())
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    pub fn snapshot(&self) -> Vec<(ThreadId, Arc<T>)> {
        read(&self.entries).iter().map(|(t, i)| (*t, i.clone())).collect()
    }
}

impl<T: ?Sized + GuiInstance> InstanceRegistry<T> {
    /// Run `f` against every instance not owned by the calling thread, each on
    /// its owner's thread. The caller is expected to have handled its own
    /// instance already. Returns the number of instances posted to.
    pub fn broadcast<F>(&self, f: F) -> usize
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let me = thread::current().id();
        let entries = read(&self.entries);
        let mut posted = 0;
        for (owner, instance) in entries.iter() {
            if *owner == me {
                continue;
            }
            let f = f.clone();
            let target = instance.clone();
            instance.invoke(Box::new(move || f(&*target)));
            posted += 1;
        }
        posted
    }
}
