//! Identity of the running process and liveness probing of other processes.
//!
//! Liveness is only decidable for processes on the local host. A record owned
//! by another host reports [`Liveness::Unknown`] and callers fall back to an
//! age threshold.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub host: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// Owner lives on another host, or the platform has no liveness check.
    Unknown,
}

impl ProcessIdentity {
    pub fn new(pid: u32, host: impl Into<String>) -> Self {
        Self {
            pid,
            host: host.into(),
        }
    }

    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: local_hostname().to_owned(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.host == local_hostname()
    }

    pub fn is_current(&self) -> bool {
        self.is_local() && self.pid == std::process::id()
    }

    pub fn liveness(&self) -> Liveness {
        if !self.is_local() {
            return Liveness::Unknown;
        }
        pid_liveness(self.pid)
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.host)
    }
}

/// Hostname of this machine, resolved once.
pub fn local_hostname() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| resolve_hostname().unwrap_or_else(|| "localhost".to_owned()))
}

#[cfg(unix)]
fn resolve_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_owned();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn resolve_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(unix)]
fn pid_liveness(pid: u32) -> Liveness {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Liveness::Dead;
    };
    if raw <= 0 {
        return Liveness::Dead;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return Liveness::Alive;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        // Exists but owned by another user.
        Some(libc::EPERM) => Liveness::Alive,
        Some(libc::ESRCH) => Liveness::Dead,
        _ => Liveness::Unknown,
    }
}

#[cfg(not(unix))]
fn pid_liveness(_pid: u32) -> Liveness {
    Liveness::Unknown
}
