//! Single-Instance Sentinel — a PID lock file that terminates a still-alive
//! previous instance before the new one starts, and removes itself on clean
//! shutdown. External to the core engine; this is the concrete
//! binary-boundary behavior grounded in
//! `original_source/midi_router.py`'s `ensure_single_instance`/
//! `cleanup_lock`.
//!
//! Every failure mode here is non-fatal: a lock file that can't be read,
//! written, or removed is logged and ignored, matching the Python
//! original's broad `except Exception: pass` — losing the single-instance
//! guarantee is never worth refusing to start the engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lock file location: `<config dir>/tr_router/instance.lock`,
/// falling back to the system temp dir if no config dir is resolvable.
pub fn default_lock_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
    base.join("tr_router").join("instance.lock")
}

/// An acquired instance lock. Removes its own lock file on drop, but only
/// if the file still names this process (a second instance racing cleanup
/// must not clobber a third instance's fresh lock).
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Terminate a previous instance (if one is still alive at `path`) and
    /// write the current PID into a fresh lock file.
    pub fn acquire(path: &Path) -> Self {
        let pid = std::process::id();

        if let Some(old_pid) = read_pid(path) {
            if old_pid != pid {
                terminate_if_alive(old_pid);
            }
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("could not remove stale lock file {path:?}: {e}");
                }
            }
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!("could not create lock directory {parent:?}: {e}");
            }
        }
        if let Err(e) = fs::write(path, pid.to_string()) {
            log::warn!("could not create lock file {path:?}: {e}");
        }

        Self { path: path.to_path_buf(), pid }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("could not remove lock file {:?} on shutdown: {e}", self.path);
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn terminate_if_alive(pid: u32) {
    if !process_is_alive(pid) {
        return;
    }
    log::info!("found previous instance (pid {pid}), terminating");
    // SAFETY: `kill` with a plain integer pid and a real signal number is a
    // well-defined libc call; we only ever inspect its return value.
    let sigterm_result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if sigterm_result != 0 {
        log::warn!("failed to send SIGTERM to previous instance (pid {pid})");
    }

    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(300));
        if !process_is_alive(pid) {
            return;
        }
    }

    log::warn!("previous instance (pid {pid}) did not exit in time, sending SIGKILL");
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 sends no signal, only checks existence/permission.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn terminate_if_alive(pid: u32) {
    log::warn!(
        "a previous instance (pid {pid}) may still be running; this platform has no \
         portable way to signal it, so its stale lock is being overwritten"
    );
}
