//! Remote actions.
//!
//! An `Action` is a unit of behaviour one process asks another to run. It is
//! a closed set of commands with explicit arguments so it can cross the wire
//! as plain data; the receiving process decides how to carry it out through
//! its `ActionHandler`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::InstanceKind;
use crate::util::lock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Open `path` as a new tab in the target window.
    OpenTab { path: String, activate: bool },
    /// Open `path` in a new Explorer window owned by the target process.
    OpenWindow { path: String },
    CloseTab { path: String },
    /// Re-read options after they were changed in another window.
    RefreshOptions,
    /// Re-read tab groups after they were edited elsewhere.
    SyncGroups,
    RefreshButtons,
}

impl Action {
    /// Which kind of instance carries this action out.
    pub fn scope(&self) -> InstanceKind {
        match self {
            Action::RefreshButtons => InstanceKind::ButtonBar,
            _ => InstanceKind::TabBar,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::OpenTab { .. } => "open_tab",
            Action::OpenWindow { .. } => "open_window",
            Action::CloseTab { .. } => "close_tab",
            Action::RefreshOptions => "refresh_options",
            Action::SyncGroups => "sync_groups",
            Action::RefreshButtons => "refresh_buttons",
        }
    }
}

/// Whether the caller waits for the destination to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Sync,
    Async,
}

/// How an action reached this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Run against the current instance; this process is the main one.
    Main,
    /// Run against every local instance.
    Broadcast,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no live instance to run the action on")]
    NoInstance,
    #[error("target instance went away before the action ran")]
    InstanceGone,
    #[error("{0}")]
    Failed(String),
}

/// Carries out actions that arrive from other processes (or that this process
/// is told to run itself).
pub trait ActionHandler: Send + Sync + 'static {
    fn execute(&self, action: &Action, delivery: Delivery) -> Result<(), ActionError>;
}

/// Run an action, logging and discarding both errors and panics. Failures of
/// remote logic stay on the executing side.
pub(crate) fn run_action(handler: &dyn ActionHandler, action: &Action, delivery: Delivery) {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(action, delivery))) {
        Ok(Ok(())) => debug!(action = action.name(), ?delivery, "action done"),
        Ok(Err(e)) => warn!(action = action.name(), ?delivery, error = %e, "action failed"),
        Err(_) => warn!(action = action.name(), ?delivery, "action panicked"),
    }
}

/// Runs actions in this process. `Sync` runs inline on the caller; `Async`
/// goes to one FIFO worker, so queued actions run in the order they came.
pub(crate) struct LocalExecutor {
    handler: Arc<dyn ActionHandler>,
    queue: Mutex<Option<Sender<(Action, Delivery)>>>,
}

impl LocalExecutor {
    pub(crate) fn new(handler: Arc<dyn ActionHandler>) -> LocalExecutor {
        LocalExecutor { handler, queue: Mutex::new(None) }
    }

    pub(crate) fn run(&self, action: Action, delivery: Delivery, mode: ExecMode) {
        match mode {
            ExecMode::Sync => run_action(self.handler.as_ref(), &action, delivery),
            ExecMode::Async => self.enqueue(action, delivery),
        }
    }

    fn enqueue(&self, action: Action, delivery: Delivery) {
        let mut queue = lock(&self.queue);
        if queue.is_none() {
            let (tx, rx) = mpsc::channel::<(Action, Delivery)>();
            let handler = self.handler.clone();
            let spawned = thread::Builder::new()
                .name("tabcoord-action".to_string())
                .spawn(move || {
                    for (action, delivery) in rx {
                        run_action(handler.as_ref(), &action, delivery);
                    }
                });
            match spawned {
                Ok(_) => *queue = Some(tx),
                Err(e) => {
                    warn!(error = %e, "could not spawn action worker, running inline");
                    drop(queue);
                    run_action(self.handler.as_ref(), &action, delivery);
                    return;
                }
            }
        }
        if let Some(tx) = queue.as_ref() {
            if let Err(mpsc::SendError((action, _))) = tx.send((action, delivery)) {
                warn!(action = action.name(), "action worker gone, dropping action");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    struct Flaky {
        seen: Mutex<Vec<&'static str>>,
    }

    impl ActionHandler for Flaky {
        fn execute(&self, action: &Action, _delivery: Delivery) -> Result<(), ActionError> {
            self.seen.lock().unwrap().push(action.name());
            match action {
                Action::CloseTab { .. } => Err(ActionError::Failed("no such tab".into())),
                Action::SyncGroups => panic!("groups file corrupt"),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn wire_form_is_tagged() {
        let open = Action::OpenTab { path: "C:\\Users".into(), activate: true };
        let json = serde_json::to_string(&open).unwrap();
        assert_eq!(json, r#"{"action":"open_tab","path":"C:\\Users","activate":true}"#);
        let back: Action = serde_json::from_str(r#"{"action":"refresh_options"}"#).unwrap();
        assert_eq!(back, Action::RefreshOptions);
    }

    #[test]
    fn unknown_action_does_not_decode() {
        assert!(serde_json::from_str::<Action>(r#"{"action":"format_disk"}"#).is_err());
    }

    #[test]
    fn scope_routes_button_actions() {
        assert_eq!(Action::RefreshButtons.scope(), InstanceKind::ButtonBar);
        assert_eq!(Action::SyncGroups.scope(), InstanceKind::TabBar);
    }

    #[test]
    fn failures_and_panics_are_contained() {
        let h = Flaky { seen: Mutex::new(Vec::new()) };
        run_action(&h, &Action::CloseTab { path: "x".into() }, Delivery::Main);
        run_action(&h, &Action::SyncGroups, Delivery::Broadcast);
        run_action(&h, &Action::RefreshOptions, Delivery::Broadcast);
        let seen = h.seen.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(*seen, vec!["close_tab", "sync_groups", "refresh_options"]);
    }

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    impl ActionHandler for Recording {
        fn execute(&self, action: &Action, _delivery: Delivery) -> Result<(), ActionError> {
            if let Action::OpenTab { path, .. } = action {
                // Uneven work so a racing worker would finish out of order.
                if path.len() % 3 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                self.seen.lock().unwrap().push(path.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn async_actions_run_in_submission_order() {
        let handler = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
        let executor = LocalExecutor::new(handler.clone());
        let paths: Vec<String> = (0..50).map(|i| format!("C:\\t{i}")).collect();
        for path in &paths {
            let action = Action::OpenTab { path: path.clone(), activate: false };
            executor.run(action, Delivery::Broadcast, ExecMode::Async);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.seen.lock().unwrap().len() < paths.len() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*handler.seen.lock().unwrap(), paths);
    }
}
