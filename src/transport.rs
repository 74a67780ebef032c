//! Named, session-oriented transport.
//!
//! An endpoint is `<prefix>-<owner pid>`, so clients only ever reach the
//! server incarnation that belongs to the current shell session. On Windows it
//! is a named pipe; elsewhere a Unix domain socket in the configured directory.

use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::PathBuf;

#[cfg(windows)]
use std::sync::Mutex;

use tracing::debug;

use crate::config::CoordConfig;
use crate::error::{CoordError, Result};
#[cfg(windows)]
use crate::pipe::{self, PipeStream};
use crate::util::sanitize_endpoint_name;

/// How long a dialer waits for a busy pipe instance.
#[cfg(windows)]
const PIPE_BUSY_WAIT_MS: u32 = 2000;

pub fn endpoint_name(prefix: &str, owner_pid: u32) -> String {
    format!("{}-{}", sanitize_endpoint_name(prefix), owner_pid)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    #[cfg(unix)]
    path: PathBuf,
}

impl Endpoint {
    pub fn for_owner(config: &CoordConfig, owner_pid: u32) -> Endpoint {
        let name = endpoint_name(&config.endpoint_prefix, owner_pid);
        Endpoint {
            #[cfg(unix)]
            path: config.socket_dir.join(format!("{name}.sock")),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS-level address: the socket path or the pipe path.
    pub fn address(&self) -> String {
        #[cfg(unix)]
        {
            self.path.display().to_string()
        }
        #[cfg(windows)]
        {
            pipe::pipe_path(&self.name)
        }
    }
}

/// One end of a duplex session. `Read` and `Write` are implemented on
/// `&Stream` so the reader thread and writers share it.
pub struct Stream {
    #[cfg(unix)]
    inner: UnixStream,
    #[cfg(windows)]
    inner: PipeStream,
}

impl Stream {
    #[cfg(all(test, unix))]
    pub(crate) fn from_unix(inner: UnixStream) -> Stream {
        Stream { inner }
    }

    /// End the stream: blocked and later reads return EOF, writes fail.
    pub fn shutdown(&self) {
        #[cfg(unix)]
        {
            let _ = self.inner.shutdown(std::net::Shutdown::Both);
        }
        #[cfg(windows)]
        {
            self.inner.shutdown();
        }
    }
}

impl Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

pub struct Listener {
    endpoint: Endpoint,
    #[cfg(unix)]
    inner: UnixListener,
    /// The pipe instance the next client will land on.
    #[cfg(windows)]
    next: Mutex<isize>,
}

impl Listener {
    #[cfg(unix)]
    pub fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
        if let Some(dir) = endpoint.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if endpoint.path.exists() {
            // A live listener means another server owns this name.
            if UnixStream::connect(&endpoint.path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("endpoint {} is already served", endpoint.address()),
                ));
            }
            debug!(path = %endpoint.path.display(), "removing stale endpoint");
            std::fs::remove_file(&endpoint.path)?;
        }
        let inner = UnixListener::bind(&endpoint.path)?;
        Ok(Listener { endpoint: endpoint.clone(), inner })
    }

    #[cfg(windows)]
    pub fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
        let first = pipe::create_server_pipe(&endpoint.address(), true)?;
        Ok(Listener { endpoint: endpoint.clone(), next: Mutex::new(first) })
    }

    #[cfg(unix)]
    pub fn accept(&self) -> io::Result<Stream> {
        let (inner, _addr) = self.inner.accept()?;
        Ok(Stream { inner })
    }

    #[cfg(windows)]
    pub fn accept(&self) -> io::Result<Stream> {
        let mut next = crate::util::lock(&self.next);
        pipe::wait_for_connection(*next)?;
        let connected = *next;
        // Create the next instance before handing this one out.
        *next = pipe::create_server_pipe(&self.endpoint.address(), false)?;
        Ok(Stream { inner: PipeStream::from_handle(connected)? })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.endpoint.path);
        }
        #[cfg(windows)]
        {
            pipe::close_handle(*crate::util::lock(&self.next));
        }
    }
}

pub fn dial(endpoint: &Endpoint) -> io::Result<Stream> {
    #[cfg(unix)]
    {
        Ok(Stream { inner: UnixStream::connect(&endpoint.path)? })
    }
    #[cfg(windows)]
    {
        Ok(Stream { inner: pipe::connect_to_pipe(&endpoint.address(), PIPE_BUSY_WAIT_MS)? })
    }
}

/// Run channel setup on a dedicated worker thread and block until it reports.
///
/// A duplex session may have to service an inbound call while the caller is
/// still waiting on the setup round-trip, so setup never runs on the caller's
/// (possibly UI) thread. The worker exits as soon as it has reported.
pub(crate) fn establish_on_worker<T, F>(label: &str, setup: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    thread::Builder::new()
        .name(label.to_string())
        .spawn(move || {
            let _ = done_tx.send(setup());
        })?;
    done_rx.recv().map_err(|_| CoordError::WorkerLost)?
}


#[cfg(test)]
mod shutdown_tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(dir: &std::path::Path, owner: u32) -> Endpoint {
        let config = CoordConfig {
            endpoint_prefix: format!("tabcoord-shutdown-{}", std::process::id()),
            socket_dir: dir.to_path_buf(),
            ..CoordConfig::default()
        };
        Endpoint::for_owner(&config, owner)
    }

    #[test]
    fn read_after_shutdown_returns_eof_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path(), 1);
        let listener = Listener::bind(&ep).unwrap();
        let _client = dial(&ep).unwrap();
        let server = listener.accept().unwrap();

        // Nothing is in flight when the stream is shut down.
        server.shutdown();
        let mut buf = [0u8; 16];
        assert_eq!((&server).read(&mut buf).unwrap(), 0);
        assert_eq!((&server).read(&mut buf).unwrap(), 0);
        assert!((&server).write_all(b"late").is_err());
    }

    #[test]
    fn shutdown_wakes_a_blocked_reader() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path(), 2);
        let listener = Listener::bind(&ep).unwrap();
        let _client = dial(&ep).unwrap();
        let server = std::sync::Arc::new(listener.accept().unwrap());

        let (done_tx, done_rx) = mpsc::channel();
        let reader = server.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let _ = done_tx.send((&*reader).read(&mut buf).ok());
        });
        thread::sleep(Duration::from_millis(50));
        server.shutdown();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(0));
    }
}
