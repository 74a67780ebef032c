//! Several "processes" in one test binary: each one is an `InstanceManager`
//! with its own pid, all sharing one owner query and one socket directory.
#![cfg(unix)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tabcoord::config::RetryPolicy;
use tabcoord::demo::{AppliedLog, WindowThread};
use tabcoord::protocol::{write_frame, Call, Frame};
use tabcoord::server::Server;
use tabcoord::transport::dial;
use tabcoord::{
    Action, ActionError, ActionHandler, ConnectionId, CoordConfig, Delivery, ExecMode,
    InstanceManager, ProcessRole, StaticOwner, WindowHandle,
};

fn config(dir: &Path) -> CoordConfig {
    CoordConfig {
        socket_dir: dir.to_path_buf(),
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 0,
        },
        ..CoordConfig::default()
    }
}

struct Proc {
    mgr: Arc<InstanceManager>,
    log: AppliedLog,
}

impl Proc {
    fn start(dir: &Path, owner: &Arc<StaticOwner>, pid: u32) -> Proc {
        let mgr = Arc::new(InstanceManager::with_owner(config(dir), owner.clone(), pid));
        Proc { mgr, log: Arc::new(Mutex::new(Vec::new())) }
    }

    fn open(&self, handle: u64) -> WindowThread {
        WindowThread::open(self.mgr.clone(), WindowHandle(handle), self.log.clone()).unwrap()
    }

    fn applied(&self) -> Vec<(WindowHandle, Action)> {
        self.log.lock().unwrap().clone()
    }

    /// What one window received, in the order it ran.
    fn applied_to(&self, handle: u64) -> Vec<Action> {
        self.applied()
            .into_iter()
            .filter(|(h, _)| *h == WindowHandle(handle))
            .map(|(_, action)| action)
            .collect()
    }

    fn is_main(&self) -> bool {
        self.mgr.is_this_the_main_process()
    }

    fn count(&self) -> usize {
        self.mgr.total_instance_count()
    }
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

struct Nop;

impl ActionHandler for Nop {
    fn execute(&self, _action: &Action, _delivery: Delivery) -> Result<(), ActionError> {
        Ok(())
    }
}

#[test]
fn exactly_one_process_becomes_server() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let procs: Vec<Proc> = (100..104).map(|pid| Proc::start(dir.path(), &owner, pid)).collect();

    let servers = procs.iter().filter(|p| p.mgr.role() == Some(ProcessRole::Server)).count();
    assert_eq!(servers, 1);
    assert!(procs[0].mgr.coordinator().server().is_some());
    for p in &procs[1..] {
        assert_eq!(p.mgr.role(), Some(ProcessRole::Client));
        assert!(p.mgr.coordinator().server().is_none());
        assert!(p.mgr.coordinator().is_connected());
    }
    let server = procs[0].mgr.coordinator().server().unwrap();
    assert_eq!(server.peers().len(), 3);

    // The endpoint is taken while the first server lives.
    assert!(Server::start(&config(dir.path()), 100, Arc::new(Nop)).is_err());
}

#[test]
fn current_instance_follows_push_order_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let client = Proc::start(dir.path(), &owner, 101);

    let w1 = client.open(1);
    let w2 = server.open(2);
    let w3 = client.open(3);
    assert_eq!(server.count(), 3);
    assert_eq!(client.count(), 3);
    assert!(client.is_main());
    assert!(!server.is_main());

    w2.close();
    assert!(client.is_main());
    assert_eq!(server.count(), 2);

    w3.close();
    assert!(client.is_main());
    let _w4 = server.open(4);
    assert!(server.is_main());
    assert!(!client.is_main());

    w1.close();
    assert_eq!(client.count(), 1);
}

#[test]
fn dead_client_instances_are_purged() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let client = Proc::start(dir.path(), &owner, 101);

    let _s1 = server.open(1);
    let _c1 = client.open(2);
    let _c2 = client.open(3);
    assert_eq!(server.count(), 3);
    assert!(!server.is_main());

    // The client process goes away without removing anything.
    client.mgr.shutdown();

    assert!(wait_until(|| server.count() == 1));
    assert!(server.is_main());
    let srv = server.mgr.coordinator().server().unwrap();
    assert_eq!(srv.current_instance(), Some((WindowHandle(1), ConnectionId::LOCAL)));
    assert!(srv.peers().is_empty());
}

#[test]
fn broadcast_reaches_everyone_but_the_sender() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let a = Proc::start(dir.path(), &owner, 101);
    let b = Proc::start(dir.path(), &owner, 102);
    let _ws = server.open(1);
    let wa = a.open(2);
    let _wb = b.open(3);

    let mgr = a.mgr.clone();
    wa.exec(move || mgr.broadcast_to_all_instances(Action::RefreshOptions, false)).unwrap();

    let got = |p: &Proc, h: u64| p.applied().contains(&(WindowHandle(h), Action::RefreshOptions));
    assert!(wait_until(|| got(&b, 3) && got(&server, 1)));
    thread::sleep(Duration::from_millis(100));
    assert!(a.applied().is_empty());

    // From the server: both clients, not the server itself.
    let srv = server.mgr.coordinator().server().unwrap();
    assert_eq!(srv.broadcast(ConnectionId::LOCAL, Action::SyncGroups), 2);
    let synced = |p: &Proc, h: u64| p.applied().contains(&(WindowHandle(h), Action::SyncGroups));
    assert!(wait_until(|| synced(&a, 2) && synced(&b, 3)));
    thread::sleep(Duration::from_millis(100));
    assert!(!synced(&server, 1));
}

#[test]
fn sync_run_on_main_executes_in_owner_process_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let a = Proc::start(dir.path(), &owner, 101);
    let b = Proc::start(dir.path(), &owner, 102);
    let ws = server.open(1);
    let wb = b.open(3);
    let _wa = a.open(2);

    let open_tab = Action::OpenTab { path: "/srv/share".into(), activate: true };

    // Server asks; A owns the top.
    let mgr = server.mgr.clone();
    let action = open_tab.clone();
    ws.exec(move || mgr.run_on_main_instance(action, ExecMode::Sync)).unwrap();
    assert_eq!(a.applied(), vec![(WindowHandle(2), open_tab.clone())]);

    // Another client asks; routed through the server to A.
    let mgr = b.mgr.clone();
    let action = Action::CloseTab { path: "/srv/share".into() };
    wb.exec(move || mgr.run_on_main_instance(action, ExecMode::Sync)).unwrap();
    assert_eq!(a.applied().len(), 2);
    assert!(server.applied().is_empty());
    assert!(b.applied().is_empty());

    // Async from B still lands on A.
    let mgr = b.mgr.clone();
    wb.exec(move || mgr.run_on_main_instance(Action::SyncGroups, ExecMode::Async)).unwrap();
    assert!(wait_until(|| a.applied().len() == 3));
}

#[test]
fn server_owning_top_runs_action_itself() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let client = Proc::start(dir.path(), &owner, 101);
    let srv = server.mgr.coordinator().server().unwrap();

    // Nothing current yet: run it yourself.
    let refresh = || {
        srv.execute_on_main(ConnectionId::LOCAL, Action::RefreshOptions, ExecMode::Sync)
    };
    assert!(refresh().unwrap());

    let _wc = client.open(2);
    let ws = server.open(1);
    assert!(refresh().unwrap());

    let mgr = server.mgr.clone();
    ws.exec(move || mgr.run_on_main_instance(Action::RefreshOptions, ExecMode::Sync)).unwrap();
    assert_eq!(server.applied(), vec![(WindowHandle(1), Action::RefreshOptions)]);
    assert!(client.applied().is_empty());
}

#[test]
fn client_started_before_server_catches_up() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(200)));
    let client = Proc::start(dir.path(), &owner, 201);
    let _w = client.open(7);

    // Solo: nobody is main, only local instances are known.
    assert!(!client.is_main());
    assert_eq!(client.count(), 1);

    let server = Proc::start(dir.path(), &owner, 200);
    assert!(wait_until(|| server.count() == 1));
    assert!(wait_until(|| client.is_main()));
    let srv = server.mgr.coordinator().server().unwrap();
    assert_eq!(srv.peers()[0].pid, 201);

    // The shell restarts under a new pid: the client follows it.
    server.mgr.shutdown();
    owner.set(Some(300));
    let restarted = Proc::start(dir.path(), &owner, 300);
    assert_eq!(restarted.mgr.role(), Some(ProcessRole::Server));
    assert!(wait_until(|| restarted.count() == 1));
    assert!(wait_until(|| client.is_main()));
}

#[test]
fn broadcasts_from_one_sender_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let client = Proc::start(dir.path(), &owner, 101);
    let _ws = server.open(1);
    let wc = client.open(2);
    let srv = server.mgr.coordinator().server().unwrap();

    let opens: Vec<Action> = (0..300)
        .map(|i| Action::OpenTab { path: format!("/srv/tabs/{i}"), activate: false })
        .collect();
    for action in &opens {
        assert_eq!(srv.broadcast(ConnectionId::LOCAL, action.clone()), 1);
    }
    assert!(wait_until(|| client.applied_to(2).len() == opens.len()));
    assert_eq!(client.applied_to(2), opens);

    // The other way round: a client's broadcasts reach the server's window in order.
    let closes: Vec<Action> = (0..100)
        .map(|i| Action::CloseTab { path: format!("/srv/tabs/{i}") })
        .collect();
    let mgr = client.mgr.clone();
    let sent = closes.clone();
    wc.exec(move || {
        for action in sent {
            mgr.broadcast_to_all_instances(action, false);
        }
    })
    .unwrap();
    assert!(wait_until(|| server.applied_to(1).len() == closes.len()));
    assert_eq!(server.applied_to(1), closes);
}

#[test]
fn a_peer_that_stops_reading_does_not_hold_up_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let owner = Arc::new(StaticOwner::new(Some(100)));
    let server = Proc::start(dir.path(), &owner, 100);
    let client = Proc::start(dir.path(), &owner, 101);
    let _ws = server.open(1);
    let _wc = client.open(2);
    let srv = server.mgr.coordinator().server().unwrap();

    // Subscribes, then never reads another byte.
    let stuck = dial(srv.endpoint()).unwrap();
    write_frame(&mut &stuck, &Frame::Call { id: 1, call: Call::Subscribe { pid: 999 } }).unwrap();
    assert!(wait_until(|| srv.peers().len() == 2));

    // Far more than a socket buffer holds, so the writer for `stuck` blocks.
    let bulky = Action::OpenWindow { path: "x".repeat(64 * 1024) };
    for _ in 0..40 {
        assert_eq!(srv.broadcast(ConnectionId::LOCAL, bulky.clone()), 2);
    }
    assert_eq!(srv.broadcast(ConnectionId::LOCAL, Action::RefreshOptions), 2);

    assert!(wait_until(|| client.applied_to(2).last() == Some(&Action::RefreshOptions)));
    assert_eq!(client.applied_to(2).len(), 41);
    drop(stuck);
}
