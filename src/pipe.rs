/// Named pipe transport for Windows.
///
/// The coordination server owns `\\.\pipe\<prefix>-<pid>`; every Explorer
/// process dials it. Byte-mode duplex pipes, one server instance per client,
/// a fresh instance created as soon as the previous one is connected.
///
/// Handles are opened with `FILE_FLAG_OVERLAPPED`. A synchronous handle
/// serializes all I/O on its file object, so a reader parked in `ReadFile`
/// would stall every write on the same session. Each call still blocks the
/// calling thread; it just waits on its own event instead of the file lock.
///
/// FFI is declared with raw `#[link]` extern blocks.

use std::io;

// ── Windows constants ──────────────────────────────────────────────────
const PIPE_ACCESS_DUPLEX: u32 = 0x00000003;
const FILE_FLAG_FIRST_PIPE_INSTANCE: u32 = 0x00080000;
const PIPE_TYPE_BYTE: u32 = 0x00000000;
const PIPE_READMODE_BYTE: u32 = 0x00000000;
const PIPE_WAIT: u32 = 0x00000000;
const PIPE_REJECT_REMOTE_CLIENTS: u32 = 0x00000008;
const PIPE_UNLIMITED_INSTANCES: u32 = 255;
const OPEN_EXISTING: u32 = 3;
const GENERIC_READ: u32 = 0x80000000;
const GENERIC_WRITE: u32 = 0x40000000;
const INVALID_HANDLE_VALUE: isize = -1;
const ERROR_BROKEN_PIPE: u32 = 109;
const ERROR_OPERATION_ABORTED: u32 = 995;
const ERROR_PIPE_CONNECTED: u32 = 535;
const ERROR_PIPE_BUSY: u32 = 231;
const ERROR_INVALID_HANDLE: u32 = 6;
const ERROR_IO_PENDING: u32 = 997;
const FILE_FLAG_OVERLAPPED: u32 = 0x40000000;
const WAIT_OBJECT_0: u32 = 0;
const INFINITE: u32 = 0xFFFFFFFF;

// ── FFI declarations ───────────────────────────────────────────────────

#[repr(C)]
#[allow(non_snake_case)]
struct OVERLAPPED {
    Internal: usize,
    InternalHigh: usize,
    Offset: u32,
    OffsetHigh: u32,
    hEvent: isize,
}

#[link(name = "kernel32")]
extern "system" {
    fn CreateNamedPipeW(
        lpName: *const u16,
        dwOpenMode: u32,
        dwPipeMode: u32,
        nMaxInstances: u32,
        nOutBufferSize: u32,
        nInBufferSize: u32,
        nDefaultTimeOut: u32,
        lpSecurityAttributes: *const std::ffi::c_void,
    ) -> isize;

    fn ConnectNamedPipe(hNamedPipe: isize, lpOverlapped: *mut OVERLAPPED) -> i32;

    fn CreateFileW(
        lpFileName: *const u16,
        dwDesiredAccess: u32,
        dwShareMode: u32,
        lpSecurityAttributes: *const std::ffi::c_void,
        dwCreationDisposition: u32,
        dwFlagsAndAttributes: u32,
        hTemplateFile: *const std::ffi::c_void,
    ) -> isize;

    fn ReadFile(
        hFile: isize,
        lpBuffer: *mut u8,
        nNumberOfBytesToRead: u32,
        lpNumberOfBytesRead: *mut u32,
        lpOverlapped: *mut OVERLAPPED,
    ) -> i32;

    fn WriteFile(
        hFile: isize,
        lpBuffer: *const u8,
        nNumberOfBytesToWrite: u32,
        lpNumberOfBytesWritten: *mut u32,
        lpOverlapped: *mut OVERLAPPED,
    ) -> i32;

    fn FlushFileBuffers(hFile: isize) -> i32;
    fn CancelIoEx(hFile: isize, lpOverlapped: *mut OVERLAPPED) -> i32;
    fn GetOverlappedResult(
        hFile: isize,
        lpOverlapped: *mut OVERLAPPED,
        lpNumberOfBytesTransferred: *mut u32,
        bWait: i32,
    ) -> i32;
    fn CreateEventW(
        lpEventAttributes: *const std::ffi::c_void,
        bManualReset: i32,
        bInitialState: i32,
        lpName: *const u16,
    ) -> isize;
    fn SetEvent(hEvent: isize) -> i32;
    fn WaitForSingleObject(hHandle: isize, dwMilliseconds: u32) -> u32;
    fn WaitForMultipleObjects(
        nCount: u32,
        lpHandles: *const isize,
        bWaitAll: i32,
        dwMilliseconds: u32,
    ) -> u32;
    fn CloseHandle(handle: isize) -> i32;
    fn WaitNamedPipeW(lpNamedPipeName: *const u16, nTimeOut: u32) -> i32;

    fn GetLastError() -> u32;
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn new_event() -> io::Result<isize> {
    let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
    if event == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(event)
    }
}

/// Start an overlapped operation with `start` and block until it finishes.
/// Returns the byte count, or the raw Win32 error code.
///
/// `stop` is a manual-reset event (or 0 for none). Once it is signaled every
/// operation, running or not yet started, fails with `ERROR_OPERATION_ABORTED`.
fn overlapped<F>(handle: isize, stop: isize, start: F) -> Result<u32, u32>
where
    F: FnOnce(*mut OVERLAPPED) -> i32,
{
    if stop != 0 && unsafe { WaitForSingleObject(stop, 0) } == WAIT_OBJECT_0 {
        return Err(ERROR_OPERATION_ABORTED);
    }
    let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
    if event == 0 {
        return Err(unsafe { GetLastError() });
    }
    let mut ov = OVERLAPPED {
        Internal: 0,
        InternalHigh: 0,
        Offset: 0,
        OffsetHigh: 0,
        hEvent: event,
    };
    let started = start(&mut ov);
    let start_err = if started == 0 {
        unsafe { GetLastError() }
    } else {
        ERROR_IO_PENDING
    };
    let result = if start_err != ERROR_IO_PENDING {
        Err(start_err)
    } else {
        let waits = [event, stop];
        let count = if stop == 0 { 1 } else { 2 };
        let woke = unsafe { WaitForMultipleObjects(count, waits.as_ptr(), 0, INFINITE) };
        if woke == WAIT_OBJECT_0 + 1 {
            unsafe {
                CancelIoEx(handle, &mut ov);
            }
        }
        // `ov` must outlive the operation, so wait for it even after a cancel.
        let mut transferred: u32 = 0;
        let ok = unsafe { GetOverlappedResult(handle, &mut ov, &mut transferred, 1) };
        if ok == 0 {
            Err(unsafe { GetLastError() })
        } else {
            Ok(transferred)
        }
    };
    unsafe {
        CloseHandle(event);
    }
    result
}

// ── PipeStream ─────────────────────────────────────────────────────────

/// A bidirectional named pipe stream wrapping a Windows HANDLE.
/// `Read` and `Write` are implemented for `&PipeStream` so a reader thread and
/// a writer can share one handle, the way `&TcpStream` works.
pub struct PipeStream {
    handle: isize,
    /// Signaled by `shutdown`; stays signaled.
    stop: isize,
}

// The handle is a kernel object; access is synchronized by the kernel.
unsafe impl Send for PipeStream {}
unsafe impl Sync for PipeStream {}

impl PipeStream {
    /// Wrap a raw handle. Takes ownership, and closes it on failure.
    pub fn from_handle(handle: isize) -> io::Result<Self> {
        match new_event() {
            Ok(stop) => Ok(PipeStream { handle, stop }),
            Err(e) => {
                close_handle(handle);
                Err(e)
            }
        }
    }

    /// End the stream for good. Blocked reads and writes return at once,
    /// and later ones never start: reads see EOF, writes fail.
    pub fn shutdown(&self) {
        unsafe {
            SetEvent(self.stop);
            CancelIoEx(self.handle, std::ptr::null_mut());
        }
    }
}

impl io::Read for &PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.handle;
        let res = overlapped(handle, self.stop, |ov| unsafe {
            ReadFile(handle, buf.as_mut_ptr(), buf.len() as u32, std::ptr::null_mut(), ov)
        });
        match res {
            Ok(n) => Ok(n as usize),
            // Other end gone, or our own shutdown: both end the stream.
            Err(ERROR_BROKEN_PIPE) | Err(ERROR_OPERATION_ABORTED) => Ok(0),
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }
}

impl io::Write for &PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.handle;
        overlapped(handle, self.stop, |ov| unsafe {
            WriteFile(handle, buf.as_ptr(), buf.len() as u32, std::ptr::null_mut(), ov)
        })
        .map(|n| n as usize)
        .map_err(|err| io::Error::from_raw_os_error(err as i32))
    }

    fn flush(&mut self) -> io::Result<()> {
        let ok = unsafe { FlushFileBuffers(self.handle) };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_INVALID_HANDLE {
                Ok(())
            } else {
                Err(io::Error::from_raw_os_error(err as i32))
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
            CloseHandle(self.stop);
        }
    }
}

// ── Public API ─────────────────────────────────────────────────────────

/// `\\.\pipe\<name>`; `name` must already be sanitized.
pub fn pipe_path(name: &str) -> String {
    format!("\\\\.\\pipe\\{}", name)
}

/// Create a server-side pipe instance.
///
/// `first_instance`: true for the very first instance so that creation fails
/// if another process already owns the name.
pub fn create_server_pipe(path: &str, first_instance: bool) -> io::Result<isize> {
    let wide_name = to_wide(path);

    let mut open_mode = PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED;
    if first_instance {
        open_mode |= FILE_FLAG_FIRST_PIPE_INSTANCE;
    }

    let handle = unsafe {
        CreateNamedPipeW(
            wide_name.as_ptr(),
            open_mode,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            PIPE_UNLIMITED_INSTANCES,
            65536,
            65536,
            0,
            std::ptr::null(),
        )
    };

    if handle == INVALID_HANDLE_VALUE {
        Err(io::Error::last_os_error())
    } else {
        Ok(handle)
    }
}

/// Block until a client connects to `handle`.
pub fn wait_for_connection(handle: isize) -> io::Result<()> {
    match overlapped(handle, 0, |ov| unsafe { ConnectNamedPipe(handle, ov) }) {
        Ok(_) => Ok(()),
        // Client connected between CreateNamedPipe and ConnectNamedPipe.
        Err(ERROR_PIPE_CONNECTED) => Ok(()),
        Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
    }
}

pub fn close_handle(handle: isize) {
    unsafe {
        CloseHandle(handle);
    }
}

/// Connect to a named pipe as a client, waiting up to `timeout_ms` if every
/// server instance is busy.
pub fn connect_to_pipe(path: &str, timeout_ms: u32) -> io::Result<PipeStream> {
    let wide_name = to_wide(path);
    let open = || unsafe {
        CreateFileW(
            wide_name.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            std::ptr::null(),
        )
    };

    let handle = open();
    if handle != INVALID_HANDLE_VALUE {
        return PipeStream::from_handle(handle);
    }

    let err = unsafe { GetLastError() };
    if err != ERROR_PIPE_BUSY {
        return Err(io::Error::from_raw_os_error(err as i32));
    }

    let ok = unsafe { WaitNamedPipeW(wide_name.as_ptr(), timeout_ms) };
    if ok == 0 {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe wait timed out"));
    }

    let handle = open();
    if handle == INVALID_HANDLE_VALUE {
        Err(io::Error::last_os_error())
    } else {
        PipeStream::from_handle(handle)
    }
}
