//! Client side of the control channel.
//!
//! A client that cannot reach the server keeps working on its own and a
//! background thread keeps trying with exponential backoff. The same loop
//! starts again whenever an established session drops. Every attempt asks
//! the window owner afresh, so a restarted shell's server is found under its
//! new endpoint, and on success every live local handle is pushed again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tracing::{debug, info, warn};

use crate::action::{run_action, Action, ActionHandler, ExecMode};
use crate::config::CoordConfig;
use crate::coordinator::HandleLedger;
use crate::elector::WindowOwnerQuery;
use crate::error::{CoordError, Result};
use crate::protocol::{Call, Reply};
use crate::session::{CallHandler, Session};
use crate::transport::{dial, establish_on_worker, Endpoint};
use crate::types::{ConnectionId, WindowHandle};
use crate::util::lock;

pub struct Client {
    self_pid: u32,
    config: CoordConfig,
    owner: Arc<dyn WindowOwnerQuery>,
    handler: Arc<dyn ActionHandler>,
    ledger: HandleLedger,
    session: Mutex<Option<Arc<Session>>>,
    next_session: AtomicU64,
    reconnecting: AtomicBool,
    stopped: AtomicBool,
}

impl Client {
    /// Connect now if possible; otherwise start solo and keep retrying.
    pub fn connect(
        config: &CoordConfig,
        self_pid: u32,
        owner: Arc<dyn WindowOwnerQuery>,
        handler: Arc<dyn ActionHandler>,
        ledger: HandleLedger,
    ) -> Arc<Client> {
        let client = Arc::new(Client {
            self_pid,
            config: config.clone(),
            owner,
            handler,
            ledger,
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
            reconnecting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        if let Err(e) = client.try_connect() {
            warn!(error = %e, "coordination server unreachable, running solo");
            client.spawn_reconnect();
        }
        client
    }

    fn try_connect(self: &Arc<Self>) -> Result<()> {
        let owner = self
            .owner
            .coordination_window_owner()
            .filter(|pid| *pid != self.self_pid)
            .ok_or(CoordError::NoServer)?;
        let endpoint = Endpoint::for_owner(&self.config, owner);

        // Held through replay so a concurrent push lands after it.
        let mut slot = lock(&self.session);
        if slot.as_ref().map_or(false, |s| s.is_open()) {
            return Ok(());
        }
        let handles = self.ledger.snapshot();
        let replayed = handles.len();
        let conn = ConnectionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let dispatch = Arc::new(ClientDispatch {
            handler: self.handler.clone(),
            client: Arc::downgrade(self),
        });
        let pid = self.self_pid;
        let address = endpoint.address();

        let session = establish_on_worker("tabcoord-dial", move || {
            let stream = dial(&endpoint)?;
            let session = Session::start(conn, stream, dispatch)?;
            let setup = (|| -> Result<()> {
                session.call(Call::Subscribe { pid })?.into_ack()?;
                for handle in handles {
                    session.call(Call::PushInstance { handle })?.into_ack()?;
                }
                Ok(())
            })();
            match setup {
                Ok(()) => Ok(session),
                Err(e) => {
                    session.close();
                    Err(e)
                }
            }
        })?;
        *slot = Some(session);
        info!(owner, endpoint = %address, replayed, "connected to coordination server");
        Ok(())
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let retry = self.config.retry.clone();
        let spawned = thread::Builder::new()
            .name("tabcoord-reconnect".to_string())
            .spawn(move || {
                let mut delay = retry.initial_delay;
                let mut attempt: u32 = 0;
                loop {
                    thread::sleep(delay);
                    let Some(client) = weak.upgrade() else { return };
                    if client.stopped.load(Ordering::SeqCst) {
                        client.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    attempt += 1;
                    match client.try_connect() {
                        Ok(()) => {
                            info!(attempt, "reconnected to coordination server");
                            client.reconnecting.store(false, Ordering::SeqCst);
                            // Lost again before the flag cleared: nobody else will retry.
                            if !client.is_connected() {
                                client.spawn_reconnect();
                            }
                            return;
                        }
                        Err(e) => debug!(attempt, error = %e, "reconnect attempt failed"),
                    }
                    if retry.max_attempts != 0 && attempt >= retry.max_attempts {
                        warn!(attempts = attempt, "giving up on coordination server");
                        client.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    delay = (delay * 2).min(retry.max_delay);
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn reconnect thread");
            self.reconnecting.store(false, Ordering::SeqCst);
        }
    }

    /// The open session, if any. A closed one is forgotten here.
    fn session(&self) -> Option<Arc<Session>> {
        let mut slot = lock(&self.session);
        match slot.as_ref() {
            Some(s) if s.is_open() => Some(s.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    pub fn push_instance(&self, handle: WindowHandle) {
        if let Some(session) = self.session() {
            let pushed = session.call(Call::PushInstance { handle }).and_then(Reply::into_ack);
            if let Err(e) = pushed {
                warn!(%handle, error = %e, "push to server failed");
            }
        }
    }

    pub fn delete_instance(&self, handle: WindowHandle) {
        if let Some(session) = self.session() {
            let deleted = session.call(Call::DeleteInstance { handle }).and_then(Reply::into_ack);
            if let Err(e) = deleted {
                debug!(%handle, error = %e, "delete on server failed");
            }
        }
    }

    /// False when solo: without a server nobody is main.
    pub fn is_main_process(&self) -> bool {
        let Some(session) = self.session() else { return false };
        match session.call(Call::IsMainProcess).and_then(Reply::into_flag) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "main-process query failed");
                false
            }
        }
    }

    /// Solo, only this process's own instances are known.
    pub fn total_instance_count(&self) -> usize {
        let count = self
            .session()
            .map(|session| session.call(Call::GetTotalInstanceCount).and_then(Reply::into_count));
        match count {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                debug!(error = %e, "instance count query failed");
                self.ledger.len()
            }
            None => self.ledger.len(),
        }
    }

    /// Returns true when the caller should run `action` itself.
    pub fn execute_on_main(&self, action: Action, mode: ExecMode) -> bool {
        let Some(session) = self.session() else { return true };
        let name = action.name();
        match session.call(Call::ExecuteOnMainProcess { action, mode }).and_then(Reply::into_flag) {
            Ok(run_yourself) => run_yourself,
            Err(e) => {
                warn!(action = name, error = %e, "could not route action, running it here");
                true
            }
        }
    }

    /// Returns whether the server accepted the broadcast.
    pub fn broadcast(&self, action: Action) -> bool {
        let Some(session) = self.session() else { return false };
        match session.notify(Call::Broadcast { action }) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "broadcast not sent");
                false
            }
        }
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
        debug!(pid = self.self_pid, "client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves what the server sends down a client session.
struct ClientDispatch {
    handler: Arc<dyn ActionHandler>,
    client: Weak<Client>,
}

impl CallHandler for ClientDispatch {
    fn handle_call(&self, _session: &Arc<Session>, call: Call) -> Reply {
        match call {
            Call::Execute { action, delivery } => {
                run_action(self.handler.as_ref(), &action, delivery);
                Reply::Ack
            }
            other => Reply::failed(format!("clients do not serve {other:?}")),
        }
    }

    fn on_closed(&self, _session: &Arc<Session>) {
        if let Some(client) = self.client.upgrade() {
            if !client.stopped.load(Ordering::SeqCst) {
                warn!("lost coordination server, reconnecting");
                client.spawn_reconnect();
            }
        }
    }
}
