use std::sync::{Arc, Weak};

use tracing::debug;

use crate::protocol::{Call, Reply};
use crate::session::{CallHandler, Session};
use crate::types::ConnectionId;

use super::Server;

/// Serves the calls one client session makes against the server state.
pub(crate) struct PeerDispatch {
    server: Weak<Server>,
    conn: ConnectionId,
}

impl PeerDispatch {
    pub(crate) fn new(server: Weak<Server>, conn: ConnectionId) -> PeerDispatch {
        PeerDispatch { server, conn }
    }
}

impl CallHandler for PeerDispatch {
    fn handle_call(&self, session: &Arc<Session>, call: Call) -> Reply {
        let Some(server) = self.server.upgrade() else {
            return Reply::failed("server stopped");
        };
        let conn = self.conn;
        match call {
            Call::Subscribe { pid } => match server.subscribe(conn, pid, session) {
                Ok(()) => Reply::Ack,
                Err(e) => Reply::failed(e),
            },
            Call::PushInstance { handle } => match server.push_instance(conn, handle) {
                Ok(()) => Reply::Ack,
                Err(e) => Reply::failed(e),
            },
            Call::DeleteInstance { handle } => {
                server.delete_instance(handle);
                Reply::Ack
            }
            Call::IsMainProcess => Reply::Flag { value: server.is_main_process(conn) },
            Call::GetTotalInstanceCount => Reply::Count { value: server.total_instance_count() },
            Call::ExecuteOnMainProcess { action, mode } => {
                match server.execute_on_main(conn, action, mode) {
                    Ok(run_yourself) => Reply::Flag { value: run_yourself },
                    Err(e) => Reply::failed(e),
                }
            }
            Call::Broadcast { action } => {
                let sent = server.broadcast(conn, action);
                debug!(%conn, sent, "broadcast relayed");
                Reply::Ack
            }
            Call::Execute { .. } => Reply::failed("execute is only sent to clients"),
        }
    }

    fn on_closed(&self, _session: &Arc<Session>) {
        if let Some(server) = self.server.upgrade() {
            debug!(conn = %self.conn, "peer session closed");
            server.purge();
        }
    }
}
