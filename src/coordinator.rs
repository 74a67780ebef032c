use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::action::{Action, ActionHandler, Delivery, ExecMode, LocalExecutor};
use crate::client::Client;
use crate::config::CoordConfig;
use crate::elector::{RoleElector, WindowOwnerQuery};
use crate::server::Server;
use crate::types::{ConnectionId, ProcessRole, WindowHandle};
use crate::util::lock;

/// Window handles this process has registered, oldest first. Survives
/// reconnects so a new server can be told about them again.
#[derive(Clone, Debug, Default)]
pub struct HandleLedger(Arc<Mutex<Vec<WindowHandle>>>);

impl HandleLedger {
    pub fn push(&self, handle: WindowHandle) {
        let mut handles = lock(&self.0);
        handles.retain(|h| *h != handle);
        handles.push(handle);
    }

    pub fn remove(&self, handle: WindowHandle) -> bool {
        let mut handles = lock(&self.0);
        let before = handles.len();
        handles.retain(|h| *h != handle);
        handles.len() != before
    }

    pub fn snapshot(&self) -> Vec<WindowHandle> {
        lock(&self.0).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }
}

#[derive(Clone)]
enum Link {
    Server(Arc<Server>),
    Client(Arc<Client>),
}

/// Per-process coordination state: the elected role and the live link to
/// the other processes.
///
/// The link is created on first use once a role can be elected. Until then
/// the process works alone: nothing is main, counts are local and actions
/// run here.
pub struct Coordinator {
    config: CoordConfig,
    elector: RoleElector,
    handler: Arc<dyn ActionHandler>,
    executor: Arc<LocalExecutor>,
    ledger: HandleLedger,
    link: Mutex<Option<Link>>,
    stopped: AtomicBool,
}

impl Coordinator {
    pub fn new(
        config: CoordConfig,
        owner: Arc<dyn WindowOwnerQuery>,
        handler: Arc<dyn ActionHandler>,
    ) -> Coordinator {
        Self::with_pid(config, owner, handler, std::process::id())
    }

    pub fn with_pid(
        config: CoordConfig,
        owner: Arc<dyn WindowOwnerQuery>,
        handler: Arc<dyn ActionHandler>,
        self_pid: u32,
    ) -> Coordinator {
        Coordinator {
            config,
            elector: RoleElector::new(owner, self_pid),
            executor: Arc::new(LocalExecutor::new(handler.clone())),
            handler,
            ledger: HandleLedger::default(),
            link: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn link(&self) -> Option<Link> {
        let mut slot = lock(&self.link);
        if let Some(link) = slot.as_ref() {
            return Some(link.clone());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let pid = self.elector.self_pid();
        let link = match self.elector.role()? {
            ProcessRole::Server => {
                match Server::start_with(&self.config, pid, self.executor.clone()) {
                    Ok(server) => {
                        for handle in self.ledger.snapshot() {
                            // The server's own pushes cannot be rejected.
                            let _ = server.push_instance(ConnectionId::LOCAL, handle);
                        }
                        Link::Server(server)
                    }
                    Err(e) => {
                        warn!(error = %e, "could not start coordination server");
                        return None;
                    }
                }
            }
            ProcessRole::Client => Link::Client(Client::connect(
                &self.config,
                pid,
                self.elector.query().clone(),
                self.handler.clone(),
                self.ledger.clone(),
            )),
        };
        *slot = Some(link.clone());
        Some(link)
    }

    /// Elect and link up now instead of on first use.
    pub fn connect(&self) -> Option<ProcessRole> {
        self.link()?;
        self.role()
    }

    pub fn role(&self) -> Option<ProcessRole> {
        self.elector.role()
    }

    pub fn pid(&self) -> u32 {
        self.elector.self_pid()
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    /// The hosted server, when this process is the server.
    pub fn server(&self) -> Option<Arc<Server>> {
        match self.link()? {
            Link::Server(server) => Some(server),
            Link::Client(_) => None,
        }
    }

    /// True for a server, and for a client with a live session.
    pub fn is_connected(&self) -> bool {
        match self.link() {
            Some(Link::Server(_)) => true,
            Some(Link::Client(client)) => client.is_connected(),
            None => false,
        }
    }

    /// Make `handle` the current instance everywhere.
    pub fn push_instance(&self, handle: WindowHandle) {
        self.ledger.push(handle);
        match self.link() {
            Some(Link::Server(server)) => {
                let _ = server.push_instance(ConnectionId::LOCAL, handle);
            }
            Some(Link::Client(client)) => client.push_instance(handle),
            None => {}
        }
    }

    pub fn remove_instance(&self, handle: WindowHandle) {
        self.ledger.remove(handle);
        match self.link() {
            Some(Link::Server(server)) => {
                server.delete_instance(handle);
            }
            Some(Link::Client(client)) => client.delete_instance(handle),
            None => {}
        }
    }

    pub fn is_main_process(&self) -> bool {
        match self.link() {
            Some(Link::Server(server)) => server.is_main_process(ConnectionId::LOCAL),
            Some(Link::Client(client)) => client.is_main_process(),
            None => false,
        }
    }

    pub fn total_instance_count(&self) -> usize {
        match self.link() {
            Some(Link::Server(server)) => server.total_instance_count(),
            Some(Link::Client(client)) => client.total_instance_count(),
            None => self.ledger.len(),
        }
    }

    /// Run `action` in the process that owns the current instance. With
    /// `Sync` this returns after it ran there; with `Async` once it is routed.
    pub fn run_on_main(&self, action: Action, mode: ExecMode) {
        let run_here = match self.link() {
            Some(Link::Server(server)) => {
                match server.execute_on_main(ConnectionId::LOCAL, action.clone(), mode) {
                    Ok(run_here) => run_here,
                    Err(e) => {
                        let name = action.name();
                        warn!(action = name, error = %e, "routing failed, running it here");
                        true
                    }
                }
            }
            Some(Link::Client(client)) => client.execute_on_main(action.clone(), mode),
            None => true,
        };
        if run_here {
            self.executor.run(action, Delivery::Main, mode);
        }
    }

    /// Send `action` to every other process. Returns how many it went to
    /// (for a client, 1 if the server took it).
    pub fn broadcast(&self, action: Action) -> usize {
        match self.link() {
            Some(Link::Server(server)) => server.broadcast(ConnectionId::LOCAL, action),
            Some(Link::Client(client)) => usize::from(client.broadcast(action)),
            None => 0,
        }
    }

    /// Tear down the link for good. Afterwards the process works alone.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let link = lock(&self.link).take();
        match link {
            Some(Link::Server(server)) => server.shutdown(),
            Some(Link::Client(client)) => client.shutdown(),
            None => return,
        }
        info!(pid = self.pid(), "coordination stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionError;
    use crate::elector::StaticOwner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        main: AtomicUsize,
    }

    impl ActionHandler for Counting {
        fn execute(&self, _action: &Action, delivery: Delivery) -> Result<(), ActionError> {
            if delivery == Delivery::Main {
                self.main.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn ledger_keeps_most_recent_last() {
        let ledger = HandleLedger::default();
        ledger.push(WindowHandle(1));
        ledger.push(WindowHandle(2));
        ledger.push(WindowHandle(1));
        assert_eq!(ledger.snapshot(), vec![WindowHandle(2), WindowHandle(1)]);
        assert!(ledger.remove(WindowHandle(2)));
        assert!(!ledger.remove(WindowHandle(2)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn without_a_window_owner_everything_stays_local() {
        let handler = Arc::new(Counting::default());
        let coord = Coordinator::with_pid(
            CoordConfig::default(),
            Arc::new(StaticOwner::new(None)),
            handler.clone(),
            55,
        );
        assert_eq!(coord.connect(), None);
        coord.push_instance(WindowHandle(9));
        assert_eq!(coord.total_instance_count(), 1);
        assert!(!coord.is_main_process());
        assert_eq!(coord.broadcast(Action::RefreshOptions), 0);

        coord.run_on_main(Action::SyncGroups, ExecMode::Sync);
        assert_eq!(handler.main.load(Ordering::SeqCst), 1);
    }
}
