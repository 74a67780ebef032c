//! One duplex session over a `Stream`.
//!
//! Either side may issue calls. A reader thread routes replies to whoever is
//! waiting on them and queues inbound calls for a worker thread, which runs
//! them in arrival order and writes the replies. A thread blocked in an
//! outbound `call` therefore never stops this side from serving the peer.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::error::{CoordError, Result};
use crate::protocol::{read_frame, write_frame, Call, Frame, Reply};
use crate::transport::Stream;
use crate::types::ConnectionId;
use crate::util::lock;

/// Serves calls the peer issues on a session.
pub trait CallHandler: Send + Sync + 'static {
    fn handle_call(&self, session: &Arc<Session>, call: Call) -> Reply;

    /// The session stopped being open, for whatever reason.
    fn on_closed(&self, _session: &Arc<Session>) {}
}

enum Inbound {
    Call(u64, Call),
    Notify(Call),
}

pub struct Session {
    id: ConnectionId,
    stream: Stream,
    write_lock: Mutex<()>,
    pending: Mutex<HashMap<u64, Sender<Reply>>>,
    next_id: AtomicU64,
    open: AtomicBool,
    handler: Arc<dyn CallHandler>,
}

impl Session {
    /// Take ownership of `stream` and start its reader and call worker.
    pub fn start(
        id: ConnectionId,
        stream: Stream,
        handler: Arc<dyn CallHandler>,
    ) -> Result<Arc<Session>> {
        let session = Arc::new(Session {
            id,
            stream,
            write_lock: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            handler,
        });
        let (inbound_tx, inbound_rx) = mpsc::channel();

        let worker = session.clone();
        thread::Builder::new()
            .name(format!("tabcoord-call-{}", id.0))
            .spawn(move || worker.serve_inbound(inbound_rx))?;

        let reader = session.clone();
        let spawned = thread::Builder::new()
            .name(format!("tabcoord-read-{}", id.0))
            .spawn(move || reader.read_loop(inbound_tx));
        if let Err(e) = spawned {
            // Dropping the sender with the closure lets the worker exit.
            session.close();
            return Err(e.into());
        }
        Ok(session)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Issue a call and block until its reply arrives or the session closes.
    pub fn call(self: &Arc<Self>, call: Call) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(id, tx);
        // Checked after registering so a concurrent close either sees the
        // entry and drops it, or we see the close here.
        if !self.is_open() {
            lock(&self.pending).remove(&id);
            return Err(CoordError::Disconnected);
        }
        if let Err(e) = self.send(&Frame::Call { id, call }) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        rx.recv().map_err(|_| CoordError::Disconnected)
    }

    /// Fire-and-forget.
    pub fn notify(self: &Arc<Self>, call: Call) -> Result<()> {
        if !self.is_open() {
            return Err(CoordError::Disconnected);
        }
        self.send(&Frame::Notify { call })
    }

    pub fn close(self: &Arc<Self>) {
        self.mark_closed();
    }

    fn send(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        let result = {
            let _guard = lock(&self.write_lock);
            let mut writer = &self.stream;
            write_frame(&mut writer, frame)
        };
        if let Err(CoordError::Io(e)) = &result {
            debug!(session = %self.id, error = %e, "write failed");
            self.mark_closed();
        }
        result
    }

    fn mark_closed(self: &Arc<Self>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders wakes every waiting caller with Disconnected.
        lock(&self.pending).clear();
        self.stream.shutdown();
        debug!(session = %self.id, "session closed");
        self.handler.on_closed(self);
    }

    fn read_loop(self: Arc<Self>, inbound: Sender<Inbound>) {
        let mut reader = &self.stream;
        loop {
            match read_frame(&mut reader) {
                Ok(Some(Frame::Reply { id, reply })) => match lock(&self.pending).remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(session = %self.id, id, "reply for unknown call"),
                },
                Ok(Some(Frame::Call { id, call })) => {
                    if inbound.send(Inbound::Call(id, call)).is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Notify { call })) => {
                    if inbound.send(Inbound::Notify(call)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(session = %self.id, "peer closed the session");
                    break;
                }
                // The payload was consumed in full, so framing is intact.
                Err(CoordError::Codec(e)) => {
                    warn!(session = %self.id, error = %e, "dropping undecodable frame");
                }
                Err(e) => {
                    debug!(session = %self.id, error = %e, "read failed");
                    break;
                }
            }
        }
        self.mark_closed();
    }

    fn serve_inbound(self: Arc<Self>, inbound: Receiver<Inbound>) {
        for item in inbound {
            match item {
                Inbound::Call(id, call) => {
                    let reply = self.dispatch(call);
                    if let Err(e) = self.send(&Frame::Reply { id, reply }) {
                        debug!(session = %self.id, id, error = %e, "could not send reply");
                    }
                }
                Inbound::Notify(call) => {
                    if let Reply::Failed { message } = self.dispatch(call) {
                        warn!(session = %self.id, %message, "notification failed");
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, call: Call) -> Reply {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle_call(self, call))) {
            Ok(reply) => reply,
            Err(_) => {
                warn!(session = %self.id, "call handler panicked");
                Reply::failed("handler panicked")
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Answers counts with a fixed number; answers `IsMainProcess` by asking
    /// the peer for its count first, which needs the peer to serve inbound
    /// calls while its own call is outstanding.
    struct Answer {
        count: usize,
        closed: AtomicUsize,
        hold: Mutex<Option<Receiver<()>>>,
    }

    impl Answer {
        fn new(count: usize) -> Arc<Answer> {
            Arc::new(Answer {
                count,
                closed: AtomicUsize::new(0),
                hold: Mutex::new(None),
            })
        }
    }

    impl CallHandler for Answer {
        fn handle_call(&self, session: &Arc<Session>, call: Call) -> Reply {
            match call {
                Call::GetTotalInstanceCount => Reply::Count { value: self.count },
                Call::IsMainProcess => match session.call(Call::GetTotalInstanceCount) {
                    Ok(Reply::Count { value }) => Reply::Flag { value: value > self.count },
                    other => Reply::failed(format!("{other:?}")),
                },
                Call::Subscribe { .. } => {
                    let hold = self.hold.lock().unwrap().take();
                    if let Some(rx) = hold {
                        let _ = rx.recv();
                    }
                    Reply::Ack
                }
                Call::PushInstance { .. } => panic!("boom"),
                _ => Reply::failed("unsupported"),
            }
        }

        fn on_closed(&self, _session: &Arc<Session>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pair(a: Arc<Answer>, b: Arc<Answer>) -> (Arc<Session>, Arc<Session>) {
        let (x, y) = UnixStream::pair().unwrap();
        let left = Session::start(ConnectionId(1), Stream::from_unix(x), a).unwrap();
        let right = Session::start(ConnectionId(2), Stream::from_unix(y), b).unwrap();
        (left, right)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn calls_are_answered_in_both_directions() {
        let (left, right) = pair(Answer::new(1), Answer::new(2));
        assert_eq!(left.call(Call::GetTotalInstanceCount).unwrap(), Reply::Count { value: 2 });
        assert_eq!(right.call(Call::GetTotalInstanceCount).unwrap(), Reply::Count { value: 1 });
    }

    #[test]
    fn nested_call_back_to_the_caller_completes() {
        let (left, _right) = pair(Answer::new(5), Answer::new(2));
        // right asks left for its count (5) while left waits on right.
        assert_eq!(left.call(Call::IsMainProcess).unwrap(), Reply::Flag { value: true });
    }

    #[test]
    fn handler_panic_becomes_failed_reply() {
        let (left, _right) = pair(Answer::new(0), Answer::new(0));
        let push = Call::PushInstance { handle: crate::types::WindowHandle(1) };
        let reply = left.call(push).unwrap();
        assert!(matches!(reply, Reply::Failed { .. }));
        assert!(left.is_open());
    }

    #[test]
    fn close_fails_pending_calls_and_notifies_both_sides() {
        let a = Answer::new(0);
        let b = Answer::new(0);
        let (release_tx, release_rx) = mpsc::channel();
        *b.hold.lock().unwrap() = Some(release_rx);
        let (left, right) = pair(a.clone(), b.clone());

        let caller = {
            let left = left.clone();
            thread::spawn(move || left.call(Call::Subscribe { pid: 1 }))
        };
        thread::sleep(Duration::from_millis(50));
        left.close();
        let result = caller.join().unwrap();
        assert!(matches!(result, Err(CoordError::Disconnected)));
        drop(release_tx);

        assert!(matches!(left.call(Call::GetTotalInstanceCount), Err(CoordError::Disconnected)));
        assert!(matches!(left.notify(Call::IsMainProcess), Err(CoordError::Disconnected)));
        assert!(wait_until(|| !right.is_open()));
        assert!(wait_until(|| b.closed.load(Ordering::SeqCst) == 1));
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
    }
}
