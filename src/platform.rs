use std::sync::Arc;

use crate::config::CoordConfig;
use crate::elector::{StaticOwner, WindowOwnerQuery};

/// Finds the shell's tray window by class and reports its owning process.
#[cfg(windows)]
pub struct ShellTrayOwner {
    class: Vec<u16>,
}

#[cfg(windows)]
impl ShellTrayOwner {
    pub fn new(class: &str) -> ShellTrayOwner {
        ShellTrayOwner { class: class.encode_utf16().chain(std::iter::once(0)).collect() }
    }
}

#[cfg(windows)]
impl WindowOwnerQuery for ShellTrayOwner {
    fn coordination_window_owner(&self) -> Option<u32> {
        use windows_sys::Win32::UI::WindowsAndMessaging::{FindWindowW, GetWindowThreadProcessId};

        let hwnd = unsafe { FindWindowW(self.class.as_ptr(), std::ptr::null()) };
        if hwnd.is_null() {
            return None;
        }
        let mut pid: u32 = 0;
        unsafe { GetWindowThreadProcessId(hwnd, &mut pid) };
        if pid == 0 { None } else { Some(pid) }
    }
}

/// The owner query for this platform. An explicit `owner-pid` always wins;
/// otherwise Windows looks up the tray window and other platforms have no
/// owner until one is configured.
pub fn default_owner_query(config: &CoordConfig) -> Arc<dyn WindowOwnerQuery> {
    #[cfg(windows)]
    {
        if config.owner_pid.is_none() {
            return Arc::new(ShellTrayOwner::new(&config.window_class));
        }
    }
    Arc::new(StaticOwner::new(config.owner_pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_owner_pid_is_reported() {
        let cfg = CoordConfig { owner_pid: Some(4321), ..CoordConfig::default() };
        assert_eq!(default_owner_query(&cfg).coordination_window_owner(), Some(4321));
    }
}
