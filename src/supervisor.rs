//! Process-supervisor notifications (`sd_notify` datagram protocol).
//!
//! When started by systemd with `Type=notify`, `NOTIFY_SOCKET` names a
//! datagram socket that accepts newline-separated `KEY=VALUE` assignments.
//! A name starting with `@` is a Linux abstract socket. With
//! `WatchdogSec=` set, `WATCHDOG_USEC` gives the deadline and the service
//! must send `WATCHDOG=1` more often than that; we ping at half the period.
//!
//! Without `NOTIFY_SOCKET` every call is a no-op.

use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct Notifier {
    socket: Option<String>,
    watchdog: Option<Duration>,
}

impl Notifier {
    /// A notifier that sends nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(socket: impl Into<String>, watchdog: Option<Duration>) -> Self {
        Self {
            socket: Some(socket.into()),
            watchdog,
        }
    }

    /// Read `NOTIFY_SOCKET`, `WATCHDOG_USEC` and `WATCHDOG_PID`.
    pub fn from_env() -> Self {
        let socket = std::env::var("NOTIFY_SOCKET").ok().filter(|s| !s.is_empty());
        let pid_matches = match std::env::var("WATCHDOG_PID") {
            Ok(pid) => pid.trim().parse::<u32>().ok() == Some(std::process::id()),
            Err(_) => true,
        };
        let watchdog = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|usec| *usec > 0 && pid_matches)
            .map(Duration::from_micros);
        if let Some(socket) = &socket {
            tracing::debug!(socket = %socket, watchdog = ?watchdog, "Supervisor notifications enabled");
        }
        Self { socket, watchdog }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// How often to send `WATCHDOG=1`, if the supervisor asked for it.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.socket.as_ref()?;
        self.watchdog.map(|w| (w / 2).max(Duration::from_millis(1)))
    }

    pub fn ready(&self) -> Result<()> {
        self.notify("READY=1")
    }

    pub fn watchdog(&self) -> Result<()> {
        self.notify("WATCHDOG=1")
    }

    pub fn stopping(&self) -> Result<()> {
        self.notify("STOPPING=1")
    }

    /// Free-form status line shown by `systemctl status`.
    pub fn status(&self, text: &str) -> Result<()> {
        let line = text.replace('\n', " ");
        self.notify(&format!("STATUS={}", line))
    }

    pub fn notify(&self, state: &str) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        send_datagram(socket, state.as_bytes())
    }
}

#[cfg(unix)]
fn send_datagram(socket: &str, payload: &[u8]) -> Result<()> {
    use std::os::unix::net::UnixDatagram;

    let sock = UnixDatagram::unbound()?;
    #[cfg(target_os = "linux")]
    if let Some(name) = socket.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        sock.send_to_addr(payload, &addr)?;
        return Ok(());
    }
    sock.send_to(payload, socket)?;
    Ok(())
}

#[cfg(not(unix))]
fn send_datagram(_socket: &str, _payload: &[u8]) -> Result<()> {
    Ok(())
}
