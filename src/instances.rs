//! The face the GUI side talks to.
//!
//! Tab bars and button bars register here from the thread that owns them.
//! Tab bars also take part in the cross-process "current instance" stack;
//! button bars are only reached through the tab bar on the same thread.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::action::{Action, ActionError, ActionHandler, Delivery, ExecMode};
use crate::config::CoordConfig;
use crate::coordinator::Coordinator;
use crate::elector::WindowOwnerQuery;
use crate::platform::default_owner_query;
use crate::registry::InstanceRegistry;
use crate::stack::InstanceStack;
use crate::types::{InstanceKind, ProcessRole, WindowHandle};
use crate::util::lock;

/// Work posted to the thread that owns an instance.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread-affine GUI object. Only `invoke` may be called from a thread
/// other than the owner; it must run the job on the owner thread later.
pub trait GuiInstance: Send + Sync + 'static {
    fn handle(&self) -> WindowHandle;
    fn invoke(&self, job: Job);
    fn apply(&self, action: &Action) -> Result<(), ActionError>;
}

/// This process's registries plus the local order in which tab bars became
/// current.
#[derive(Default)]
pub struct LocalInstances {
    tab_bars: InstanceRegistry<dyn GuiInstance>,
    button_bars: InstanceRegistry<dyn GuiInstance>,
    current: Mutex<InstanceStack<WindowHandle, ThreadId>>,
}

impl LocalInstances {
    pub fn registry(&self, kind: InstanceKind) -> &InstanceRegistry<dyn GuiInstance> {
        match kind {
            InstanceKind::TabBar => &self.tab_bars,
            InstanceKind::ButtonBar => &self.button_bars,
        }
    }

    fn current_owner(&self) -> Option<ThreadId> {
        lock(&self.current).peek().map(|(_, owner)| *owner)
    }

    fn run_on_current(&self, action: &Action) -> Result<(), ActionError> {
        let owner = self.current_owner().ok_or(ActionError::NoInstance)?;
        let instance = self.registry(action.scope()).lookup(owner).ok_or(ActionError::NoInstance)?;
        if owner == thread::current().id() {
            return instance.apply(action);
        }
        let (done_tx, done_rx) = mpsc::channel();
        let target = instance.clone();
        let action = action.clone();
        instance.invoke(Box::new(move || {
            let _ = done_tx.send(target.apply(&action));
        }));
        // A dropped job drops the sender too.
        done_rx.recv().map_err(|_| ActionError::InstanceGone)?
    }

    /// Apply to every instance of the action's kind not owned by the
    /// calling thread.
    fn apply_to_others(&self, action: &Action) -> usize {
        let name = action.name();
        let action = action.clone();
        self.registry(action.scope()).broadcast(move |instance: &dyn GuiInstance| {
            if let Err(e) = instance.apply(&action) {
                let window = instance.handle();
                warn!(action = name, %window, error = %e, "broadcast action failed");
            }
        })
    }
}

impl ActionHandler for LocalInstances {
    fn execute(&self, action: &Action, delivery: Delivery) -> Result<(), ActionError> {
        match delivery {
            Delivery::Main => self.run_on_current(action),
            Delivery::Broadcast => {
                let posted = self.apply_to_others(action);
                debug!(action = action.name(), posted, "broadcast applied locally");
                Ok(())
            }
        }
    }
}

pub struct InstanceManager {
    local: Arc<LocalInstances>,
    coordinator: Coordinator,
}

impl InstanceManager {
    /// Elect with the platform's owner query and connect.
    pub fn start(config: CoordConfig) -> InstanceManager {
        let owner = default_owner_query(&config);
        Self::with_owner(config, owner, std::process::id())
    }

    pub fn with_owner(
        config: CoordConfig,
        owner: Arc<dyn WindowOwnerQuery>,
        self_pid: u32,
    ) -> InstanceManager {
        let local = Arc::new(LocalInstances::default());
        let handler: Arc<dyn ActionHandler> = local.clone();
        let coordinator = Coordinator::with_pid(config, owner, handler, self_pid);
        if coordinator.connect().is_none() {
            debug!(pid = self_pid, "no coordination window yet, starting solo");
        }
        InstanceManager { local, coordinator }
    }

    /// Register the calling thread's tab bar and make it current.
    pub fn register_tab_bar(&self, instance: Arc<dyn GuiInstance>) {
        let me = thread::current().id();
        let handle = instance.handle();
        if let Some(old) = self.local.tab_bars.register(me, instance) {
            if old.handle() != handle {
                lock(&self.local.current).remove(&old.handle());
                self.coordinator.remove_instance(old.handle());
            }
        }
        lock(&self.local.current).push(handle, me);
        self.coordinator.push_instance(handle);
    }

    /// The calling thread's tab bar became active again.
    pub fn activate_tab_bar(&self) -> bool {
        let Some(instance) = self.local.tab_bars.current() else { return false };
        let handle = instance.handle();
        lock(&self.local.current).push(handle, thread::current().id());
        self.coordinator.push_instance(handle);
        true
    }

    /// Idempotent: `None` when the calling thread has no tab bar.
    pub fn unregister_tab_bar(&self) -> Option<Arc<dyn GuiInstance>> {
        let removed = self.local.tab_bars.unregister(thread::current().id())?;
        let handle = removed.handle();
        lock(&self.local.current).remove(&handle);
        self.coordinator.remove_instance(handle);
        Some(removed)
    }

    pub fn register_button_bar(&self, instance: Arc<dyn GuiInstance>) {
        self.local.button_bars.register(thread::current().id(), instance);
    }

    pub fn unregister_button_bar(&self) -> Option<Arc<dyn GuiInstance>> {
        self.local.button_bars.unregister(thread::current().id())
    }

    pub fn tab_bar(&self) -> Option<Arc<dyn GuiInstance>> {
        self.local.tab_bars.current()
    }

    pub fn button_bar(&self) -> Option<Arc<dyn GuiInstance>> {
        self.local.button_bars.current()
    }

    /// Most recently activated tab bar of this process.
    pub fn current_tab_bar(&self) -> Option<Arc<dyn GuiInstance>> {
        let owner = self.local.current_owner()?;
        self.local.tab_bars.lookup(owner)
    }

    /// Apply `action` to every instance of its kind in every process. With
    /// `include_caller` the calling thread's own instance runs it first;
    /// otherwise the caller is assumed to have handled itself.
    pub fn broadcast_to_all_instances(&self, action: Action, include_caller: bool) {
        if include_caller {
            if let Some(mine) = self.local.registry(action.scope()).current() {
                if let Err(e) = mine.apply(&action) {
                    warn!(action = action.name(), error = %e, "action failed on calling instance");
                }
            }
        }
        let local = self.local.apply_to_others(&action);
        let remote = self.coordinator.broadcast(action);
        debug!(local, remote, "broadcast to all instances");
    }

    pub fn run_on_main_instance(&self, action: Action, mode: ExecMode) {
        self.coordinator.run_on_main(action, mode);
    }

    pub fn is_this_the_main_process(&self) -> bool {
        self.coordinator.is_main_process()
    }

    pub fn total_instance_count(&self) -> usize {
        self.coordinator.total_instance_count()
    }

    pub fn role(&self) -> Option<ProcessRole> {
        self.coordinator.role()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
