mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::action::{Action, ActionHandler, Delivery, ExecMode, LocalExecutor};
use crate::config::CoordConfig;
use crate::error::{CoordError, Result};
use crate::protocol::{Call, Reply};
use crate::session::Session;
use crate::stack::InstanceStack;
use crate::transport::{dial, establish_on_worker, Endpoint, Listener, Stream};
use crate::types::{ConnectionId, WindowHandle};
use crate::util::lock;

use connection::PeerDispatch;

/// A subscribed client as seen by `peers()`.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: ConnectionId,
    pub pid: u32,
    pub connected_at: DateTime<Local>,
}

/// Work queued for one peer. A single writer per peer drains it, so
/// everything sent to that peer arrives in the order it was queued.
enum Outbound {
    Notify(Call),
    Call(Call, Sender<Result<Reply>>),
}

struct Peer {
    pid: u32,
    session: Arc<Session>,
    outbox: Sender<Outbound>,
    connected_at: DateTime<Local>,
}

/// Drain one peer's queue until the peer is dropped from the server state.
/// A peer that stops reading only stalls its own writer.
fn drain_outbox(conn: ConnectionId, session: Arc<Session>, outbox: Receiver<Outbound>) {
    for item in outbox {
        match item {
            Outbound::Notify(call) => {
                if let Err(e) = session.notify(call) {
                    debug!(%conn, error = %e, "delivery to peer failed");
                }
            }
            Outbound::Call(call, reply) => {
                let _ = reply.send(session.call(call));
            }
        }
    }
    debug!(%conn, "peer writer stopped");
}

#[derive(Default)]
struct ServerState {
    /// Every accepted session, subscribed or not.
    sessions: HashMap<ConnectionId, Arc<Session>>,
    /// Sessions that sent `Subscribe`; only these may own instances.
    peers: HashMap<ConnectionId, Peer>,
    stack: InstanceStack<WindowHandle, ConnectionId>,
}

impl ServerState {
    /// Drop peers whose transport is no longer open, then every stack entry
    /// they owned.
    fn purge_dead(&mut self) {
        self.sessions.retain(|_, s| s.is_open());
        let dead: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.session.is_open())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(peer) = self.peers.remove(&id) {
                info!(conn = %id, pid = peer.pid, "dropping dead peer");
            }
        }
        let peers = &self.peers;
        let dropped = self.stack.retain(|_, owner| owner.is_local() || peers.contains_key(owner));
        if dropped > 0 {
            info!(dropped, remaining = self.stack.len(), "purged instances of dead peers");
        }
    }
}

/// Hosts the control channel and owns the current-instance stack.
///
/// Every operation purges dead peers first. The state lock is never held
/// across a remote call.
pub struct Server {
    self_pid: u32,
    endpoint: Endpoint,
    state: Mutex<ServerState>,
    executor: Arc<LocalExecutor>,
    next_conn: AtomicU64,
    shutting_down: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the endpoint for `self_pid` and start accepting sessions.
    pub fn start(
        config: &CoordConfig,
        self_pid: u32,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Arc<Server>> {
        Self::start_with(config, self_pid, Arc::new(LocalExecutor::new(handler)))
    }

    /// Like `start`, running the server's own actions on `executor`.
    pub(crate) fn start_with(
        config: &CoordConfig,
        self_pid: u32,
        executor: Arc<LocalExecutor>,
    ) -> Result<Arc<Server>> {
        let endpoint = Endpoint::for_owner(config, self_pid);
        let listener = {
            let endpoint = endpoint.clone();
            establish_on_worker("tabcoord-bind", move || Ok(Listener::bind(&endpoint)?))?
        };
        info!(endpoint = %endpoint.address(), pid = self_pid, "coordination server listening");

        let server = Arc::new(Server {
            self_pid,
            endpoint,
            state: Mutex::new(ServerState::default()),
            executor,
            next_conn: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            accept_thread: Mutex::new(None),
        });
        let weak = Arc::downgrade(&server);
        let accept = thread::Builder::new()
            .name("tabcoord-accept".to_string())
            .spawn(move || accept_loop(weak, listener))?;
        *lock(&server.accept_thread) = Some(accept);
        Ok(server)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> u32 {
        self.self_pid
    }

    fn adopt(self: &Arc<Self>, stream: Stream) {
        let conn = ConnectionId(self.next_conn.fetch_add(1, Ordering::SeqCst));
        let dispatch = Arc::new(PeerDispatch::new(Arc::downgrade(self), conn));
        match Session::start(conn, stream, dispatch) {
            Ok(session) => {
                debug!(%conn, "session accepted");
                lock(&self.state).sessions.insert(conn, session);
            }
            Err(e) => warn!(%conn, error = %e, "could not start session"),
        }
    }

    fn lock_live(&self) -> MutexGuard<'_, ServerState> {
        let mut state = lock(&self.state);
        state.purge_dead();
        state
    }

    pub(crate) fn purge(&self) {
        drop(self.lock_live());
    }

    pub(crate) fn subscribe(
        &self,
        conn: ConnectionId,
        pid: u32,
        session: &Arc<Session>,
    ) -> Result<()> {
        let (outbox, queued) = mpsc::channel();
        let writer = session.clone();
        thread::Builder::new()
            .name(format!("tabcoord-out-{}", conn.0))
            .spawn(move || drain_outbox(conn, writer, queued))?;
        let mut state = self.lock_live();
        let peer = Peer {
            pid,
            session: session.clone(),
            outbox,
            connected_at: Local::now(),
        };
        state.peers.insert(conn, peer);
        info!(%conn, pid, peers = state.peers.len(), "peer subscribed");
        Ok(())
    }

    /// Make `handle` the current instance, owned by `origin`.
    pub fn push_instance(&self, origin: ConnectionId, handle: WindowHandle) -> Result<()> {
        let mut state = self.lock_live();
        if !origin.is_local() && !state.peers.contains_key(&origin) {
            return Err(CoordError::NotSubscribed(origin));
        }
        state.stack.push(handle, origin);
        debug!(%handle, owner = %origin, depth = state.stack.len(), "instance pushed");
        Ok(())
    }

    /// Returns whether `handle` was on the stack.
    pub fn delete_instance(&self, handle: WindowHandle) -> bool {
        let mut state = self.lock_live();
        let removed = state.stack.remove(&handle);
        if let Some(owner) = removed {
            debug!(%handle, %owner, depth = state.stack.len(), "instance removed");
        }
        removed.is_some()
    }

    /// True iff `origin` owns the current instance.
    pub fn is_main_process(&self, origin: ConnectionId) -> bool {
        let state = self.lock_live();
        state.stack.peek().map_or(false, |(_, owner)| *owner == origin)
    }

    pub fn total_instance_count(&self) -> usize {
        self.lock_live().stack.len()
    }

    pub fn current_instance(&self) -> Option<(WindowHandle, ConnectionId)> {
        self.lock_live().stack.peek().map(|(h, o)| (*h, *o))
    }

    /// Route `action` to the owner of the current instance.
    ///
    /// `Ok(true)` tells the caller to run it itself: nothing is current, or
    /// the caller already owns the current instance.
    pub fn execute_on_main(
        &self,
        origin: ConnectionId,
        action: Action,
        mode: ExecMode,
    ) -> Result<bool> {
        let owner = match self.current_instance() {
            None => return Ok(true),
            Some((_, owner)) if owner == origin => return Ok(true),
            Some((_, owner)) => owner,
        };
        if owner.is_local() {
            self.executor.run(action, Delivery::Main, mode);
            return Ok(false);
        }

        let outbox = lock(&self.state).peers.get(&owner).map(|p| p.outbox.clone());
        let Some(outbox) = outbox else {
            debug!(%owner, "owner of current instance vanished");
            return Ok(true);
        };
        let call = Call::Execute { action, delivery: Delivery::Main };
        match mode {
            ExecMode::Sync => {
                let (reply_tx, reply_rx) = mpsc::channel();
                let reply = match outbox.send(Outbound::Call(call, reply_tx)) {
                    Ok(()) => reply_rx.recv().unwrap_or(Err(CoordError::Disconnected)),
                    Err(_) => Err(CoordError::Disconnected),
                };
                match reply {
                    Ok(reply) => reply.into_ack().map(|()| false),
                    Err(CoordError::Disconnected) => {
                        warn!(%owner, "owner disconnected while running action");
                        self.purge();
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            }
            ExecMode::Async => {
                if outbox.send(Outbound::Notify(call)).is_err() {
                    warn!(%owner, "could not forward action, owner is gone");
                }
                Ok(false)
            }
        }
    }

    /// Deliver `action` to every subscribed client except `origin`. A client
    /// origin also gets the server's own instances. Returns the number of
    /// processes the action was queued for.
    pub fn broadcast(&self, origin: ConnectionId, action: Action) -> usize {
        let targets: Vec<(ConnectionId, Sender<Outbound>)> = {
            let state = self.lock_live();
            state
                .peers
                .iter()
                .filter(|(id, _)| **id != origin)
                .map(|(id, p)| (*id, p.outbox.clone()))
                .collect()
        };
        let mut sent = 0;
        for (conn, outbox) in targets {
            let call = Call::Execute { action: action.clone(), delivery: Delivery::Broadcast };
            match outbox.send(Outbound::Notify(call)) {
                Ok(()) => sent += 1,
                Err(_) => debug!(%conn, "peer left before broadcast was queued"),
            }
        }
        if !origin.is_local() {
            self.executor.run(action, Delivery::Broadcast, ExecMode::Async);
            sent += 1;
        }
        sent
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let state = self.lock_live();
        let mut peers: Vec<PeerInfo> = state
            .peers
            .iter()
            .map(|(id, p)| PeerInfo {
                id: *id,
                pid: p.pid,
                connected_at: p.connected_at,
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Stop accepting, close every session and forget remote instances.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<Arc<Session>> = {
            let mut state = lock(&self.state);
            state.peers.clear();
            state.stack.retain(|_, owner| owner.is_local());
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
        // Unblock accept so the loop sees the flag and drops the listener.
        let _ = dial(&self.endpoint);
        if let Some(accept) = lock(&self.accept_thread).take() {
            if accept.thread().id() != thread::current().id() {
                let _ = accept.join();
            }
        }
        info!(endpoint = %self.endpoint.address(), "coordination server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(server: Weak<Server>, listener: Listener) {
    loop {
        let accepted = listener.accept();
        let Some(server) = server.upgrade() else { break };
        if server.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        match accepted {
            Ok(stream) => server.adopt(stream),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!(endpoint = %listener.endpoint().address(), "accept loop stopped");
}
