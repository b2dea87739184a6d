//! Host-side TCP port discovery and the process-wide lease registry
//!
//! Ports are obtained by binding `127.0.0.1:0` and reading back the
//! ephemeral port the OS assigned. The registry records every port currently
//! handed out, so two devices in the same process never receive the same
//! host port even if the OS would hand it out again after the probe socket
//! closed.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::{LazyLock, Mutex};

use devhost_core::prelude::*;

/// Attempts before [`reserve_free_port`] gives up
pub const MAX_PORT_ATTEMPTS: usize = 32;

static RESERVED: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

fn reserved() -> std::sync::MutexGuard<'static, HashSet<u16>> {
    // A poisoned registry still holds a consistent set of u16s
    RESERVED.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ask the OS for an ephemeral port on the loopback interface
pub fn ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// True if nothing on the host is listening on `port`
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Pick a free port that no other lease in this process holds, and record it.
pub fn reserve_free_port() -> Result<u16> {
    for _ in 0..MAX_PORT_ATTEMPTS {
        let port = ephemeral_port()?;
        if reserved().insert(port) {
            trace!("reserved host port {}", port);
            return Ok(port);
        }
        debug!("host port {} already reserved, retrying", port);
    }
    Err(Error::NoFreePort {
        attempts: MAX_PORT_ATTEMPTS,
    })
}

/// Record `port` as leased. Returns false if it is already held.
pub fn reserve(port: u16) -> bool {
    reserved().insert(port)
}

/// Return `port` to the pool. Unknown ports are ignored.
pub fn release(port: u16) {
    if reserved().remove(&port) {
        trace!("released host port {}", port);
    }
}

/// True if `port` is currently held by some lease in this process
pub fn is_reserved(port: u16) -> bool {
    reserved().contains(&port)
}
