//! Deciding which process hosts the coordination server.
//!
//! The process that owns the shell's singleton window is the server; all
//! others are clients. The window may not exist yet early in a session, in
//! which case no role is assigned and the question is asked again next time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::types::ProcessRole;

/// Reports the pid of the process owning the coordination window.
pub trait WindowOwnerQuery: Send + Sync {
    fn coordination_window_owner(&self) -> Option<u32>;
}

pub fn elect(owner: Option<u32>, self_pid: u32) -> Option<ProcessRole> {
    match owner {
        Some(pid) if pid == self_pid => Some(ProcessRole::Server),
        Some(_) => Some(ProcessRole::Client),
        None => None,
    }
}

/// Owner pid supplied from outside: configuration, environment, or a test.
#[derive(Debug, Default)]
pub struct StaticOwner {
    // 0 = no window
    pid: AtomicU32,
}

impl StaticOwner {
    pub fn new(pid: Option<u32>) -> StaticOwner {
        StaticOwner { pid: AtomicU32::new(pid.unwrap_or(0)) }
    }

    pub fn set(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }
}

impl WindowOwnerQuery for StaticOwner {
    fn coordination_window_owner(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

pub struct RoleElector {
    query: Arc<dyn WindowOwnerQuery>,
    self_pid: u32,
    role: OnceLock<ProcessRole>,
}

impl RoleElector {
    pub fn new(query: Arc<dyn WindowOwnerQuery>, self_pid: u32) -> RoleElector {
        RoleElector { query, self_pid, role: OnceLock::new() }
    }

    /// The elected role, electing now if that has not happened yet.
    /// Once a role is returned it never changes.
    pub fn role(&self) -> Option<ProcessRole> {
        if let Some(role) = self.role.get() {
            return Some(*role);
        }
        let owner = self.query.coordination_window_owner();
        let role = elect(owner, self.self_pid)?;
        Some(*self.role.get_or_init(|| {
            info!(%role, pid = self.self_pid, owner = ?owner, "process role elected");
            role
        }))
    }

    pub fn self_pid(&self) -> u32 {
        self.self_pid
    }

    pub fn query(&self) -> &Arc<dyn WindowOwnerQuery> {
        &self.query
    }
}
