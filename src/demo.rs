//! Simulated GUI windows for the `host` command and the integration tests.
//!
//! Each window is a thread that registers a tab bar and then runs posted jobs
//! in order, like a message loop would.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::action::{Action, ActionError};
use crate::instances::{GuiInstance, InstanceManager, Job};
use crate::types::WindowHandle;
use crate::util::lock;

/// Everything applied to demo windows that share a log: (window, action).
pub type AppliedLog = Arc<Mutex<Vec<(WindowHandle, Action)>>>;

enum Msg {
    Run(Job),
    Close,
}

pub struct DemoWindow {
    handle: WindowHandle,
    jobs: Mutex<Sender<Msg>>,
    log: AppliedLog,
}

impl GuiInstance for DemoWindow {
    fn handle(&self) -> WindowHandle {
        self.handle
    }

    fn invoke(&self, job: Job) {
        // A closed window drops the job.
        let _ = lock(&self.jobs).send(Msg::Run(job));
    }

    fn apply(&self, action: &Action) -> Result<(), ActionError> {
        if let Action::CloseTab { path } = action {
            if path.is_empty() {
                return Err(ActionError::Failed("empty path".to_string()));
            }
        }
        info!(window = %self.handle, ?action, "applied");
        lock(&self.log).push((self.handle, action.clone()));
        Ok(())
    }
}

/// Owner side of a running demo window.
pub struct WindowThread {
    handle: WindowHandle,
    jobs: Sender<Msg>,
    join: Option<JoinHandle<()>>,
}

impl WindowThread {
    /// Start a window thread that registers with `manager`. Returns once the
    /// window is registered.
    pub fn open(
        manager: Arc<InstanceManager>,
        handle: WindowHandle,
        log: AppliedLog,
    ) -> io::Result<WindowThread> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let window_tx = tx.clone();
        let join = thread::Builder::new()
            .name(format!("window-{handle}"))
            .spawn(move || {
                let window = Arc::new(DemoWindow {
                    handle,
                    jobs: Mutex::new(window_tx),
                    log,
                });
                manager.register_tab_bar(window);
                let _ = ready_tx.send(());
                for msg in rx {
                    match msg {
                        Msg::Run(job) => job(),
                        Msg::Close => break,
                    }
                }
                manager.unregister_tab_bar();
            })?;
        ready_rx
            .recv()
            .map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "window thread exited during startup")
            })?;
        Ok(WindowThread { handle, jobs: tx, join: Some(join) })
    }

    pub fn handle(&self) -> WindowHandle {
        self.handle
    }

    /// Run `f` on the window thread and wait for its result. `None` if the
    /// window is gone.
    pub fn exec<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        self.jobs.send(Msg::Run(job)).ok()?;
        rx.recv().ok()
    }

    /// Unregister and stop the window thread.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.jobs.send(Msg::Close);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WindowThread {
    fn drop(&mut self) {
        self.stop();
    }
}
