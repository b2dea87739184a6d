//! Port lease tracking for one device
//!
//! Each [`PortRole`] maps to at most one host port. Leasing a role picks a
//! free host port from the process-wide registry and installs the matching
//! forward (or reverse forward for the callback role); releasing undoes both.

use std::collections::BTreeMap;

use devhost_bridge::ports;
use devhost_bridge::CommandBridge;
use devhost_core::prelude::*;
use devhost_core::{ForwardDirection, PortRole};

/// What to do when a role is already leased
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Fail with [`Error::PortRoleLeased`]
    Exclusive,
    /// Keep the old host port if nothing on the host is using it and
    /// re-install the forward; otherwise release it and lease a new port.
    /// Used after a reboot, which drops every forward on the device side.
    ReuseIfFree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub role: PortRole,
    pub host_port: u16,
    pub device_port: u16,
}

/// Role → host port mapping for one device
#[derive(Debug)]
pub struct PortLeaseTracker {
    serial: String,
    leases: BTreeMap<PortRole, PortLease>,
}

impl PortLeaseTracker {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            leases: BTreeMap::new(),
        }
    }

    /// Lease a host port for `role` and forward it to `device_port`.
    pub async fn lease<B: CommandBridge>(
        &mut self,
        bridge: &B,
        role: PortRole,
        device_port: u16,
        mode: LeaseMode,
    ) -> Result<u16> {
        if let Some(existing) = self.leases.get(&role).copied() {
            match mode {
                LeaseMode::Exclusive => {
                    return Err(Error::PortRoleLeased {
                        role: role.to_string(),
                        host_port: existing.host_port,
                    });
                }
                LeaseMode::ReuseIfFree
                    if existing.device_port == device_port
                        && ports::is_port_available(existing.host_port) =>
                {
                    debug!(
                        "{}: reusing host port {} for {}",
                        self.serial, existing.host_port, role
                    );
                    install(bridge, &existing).await?;
                    return Ok(existing.host_port);
                }
                LeaseMode::ReuseIfFree => {
                    debug!(
                        "{}: host port {} for {} is busy, leasing a new one",
                        self.serial, existing.host_port, role
                    );
                    if let Err(e) = self.release(bridge, role).await {
                        warn!("{}: releasing stale {} lease: {}", self.serial, role, e);
                    }
                }
            }
        }

        let host_port = ports::reserve_free_port()?;
        let lease = PortLease {
            role,
            host_port,
            device_port,
        };

        if let Err(e) = install(bridge, &lease).await {
            ports::release(host_port);
            return Err(e);
        }

        info!(
            "{}: leased host port {} for {} (device port {})",
            self.serial, host_port, role, device_port
        );
        self.leases.insert(role, lease);
        Ok(host_port)
    }

    /// Remove the forward for `role` and free its host port.
    ///
    /// The mapping is dropped even if removing the forward fails; that
    /// failure is returned. Releasing an unleased role is a no-op.
    pub async fn release<B: CommandBridge>(&mut self, bridge: &B, role: PortRole) -> Result<()> {
        let Some(lease) = self.leases.remove(&role) else {
            return Ok(());
        };
        ports::release(lease.host_port);
        debug!(
            "{}: released host port {} for {}",
            self.serial, lease.host_port, role
        );

        match role.direction() {
            ForwardDirection::Forward => bridge.remove_forward(lease.host_port).await,
            ForwardDirection::Reverse => bridge.remove_reverse(lease.device_port).await,
        }
    }

    /// Release every lease, logging failures
    pub async fn release_all<B: CommandBridge>(&mut self, bridge: &B) {
        let roles: Vec<PortRole> = self.leases.keys().copied().collect();
        for role in roles {
            if let Err(e) = self.release(bridge, role).await {
                warn!("{}: failed to remove {} forward: {}", self.serial, role, e);
            }
        }
    }

    pub fn is_leased(&self, role: PortRole) -> bool {
        self.leases.contains_key(&role)
    }

    pub fn host_port(&self, role: PortRole) -> Option<u16> {
        self.leases.get(&role).map(|l| l.host_port)
    }

    pub fn get(&self, role: PortRole) -> Option<&PortLease> {
        self.leases.get(&role)
    }

    /// Host ports currently held, in role order
    pub fn leased_ports(&self) -> Vec<u16> {
        self.leases.values().map(|l| l.host_port).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

async fn install<B: CommandBridge>(bridge: &B, lease: &PortLease) -> Result<()> {
    match lease.role.direction() {
        ForwardDirection::Forward => bridge.forward(lease.host_port, lease.device_port).await,
        ForwardDirection::Reverse => {
            bridge
                .reverse_forward(lease.device_port, lease.host_port)
                .await
        }
    }
}

impl Drop for PortLeaseTracker {
    fn drop(&mut self) {
        if !self.leases.is_empty() {
            warn!(
                "{}: port tracker dropped with {} live lease(s); call release_all first",
                self.serial,
                self.leases.len()
            );
            for lease in self.leases.values() {
                ports::release(lease.host_port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhost_bridge::test_utils::FakeBridge;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_lease_installs_forward() {
        let bridge = FakeBridge::new("A");
        let mut tracker = PortLeaseTracker::new("A");

        let port = tracker
            .lease(&bridge, PortRole::Command, 5001, LeaseMode::Exclusive)
            .await
            .unwrap();

        assert!(tracker.is_leased(PortRole::Command));
        assert_eq!(tracker.host_port(PortRole::Command), Some(port));
        assert_eq!(bridge.forwards().get(&port), Some(&5001));
        assert!(ports::is_reserved(port));

        tracker.release_all(&bridge).await;
        assert!(bridge.forwards().is_empty());
        assert!(!ports::is_reserved(port));
    }

    #[tokio::test]
    async fn test_callback_role_uses_reverse_forward() {
        let bridge = FakeBridge::new("A");
        let mut tracker = PortLeaseTracker::new("A");

        let port = tracker
            .lease(&bridge, PortRole::Callback, 5010, LeaseMode::Exclusive)
            .await
            .unwrap();
        assert_eq!(bridge.reverses().get(&5010), Some(&port));
        assert!(bridge.forwards().is_empty());

        tracker.release(&bridge, PortRole::Callback).await.unwrap();
        assert!(bridge.reverses().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_lease_twice_fails() {
        let bridge = FakeBridge::new("A");
        let mut tracker = PortLeaseTracker::new("A");

        tracker
            .lease(&bridge, PortRole::Scripting, 8082, LeaseMode::Exclusive)
            .await
            .unwrap();
        let err = tracker
            .lease(&bridge, PortRole::Scripting, 8082, LeaseMode::Exclusive)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PortRoleLeased { .. }));
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        tracker.release_all(&bridge).await;
    }

    #[tokio::test]
    async fn test_reuse_if_free_keeps_port() {
        let bridge = FakeBridge::new("A");
        let mut tracker = PortLeaseTracker::new("A");

        let first = tracker
            .lease(&bridge, PortRole::Scripting, 8082, LeaseMode::Exclusive)
            .await
            .unwrap();
        // A reboot drops the device-side forwards
        bridge.reboot().await.unwrap();
        assert!(bridge.forwards().is_empty());

        let second = tracker
            .lease(&bridge, PortRole::Scripting, 8082, LeaseMode::ReuseIfFree)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(bridge.forwards().get(&second), Some(&8082));
        tracker.release_all(&bridge).await;
    }

    #[tokio::test]
    async fn test_reuse_if_free_moves_off_busy_port() {
        let bridge = FakeBridge::new("A");
        let mut tracker = PortLeaseTracker::new("A");

        let first = tracker
            .lease(&bridge, PortRole::Scripting, 8082, LeaseMode::Exclusive)
            .await
            .unwrap();
        // Something else grabbed the host port
        let squatter = std::net::TcpListener::bind(("127.0.0.1", first));

        let second = tracker
            .lease(&bridge, PortRole::Scripting, 8082, LeaseMode::ReuseIfFree)
            .await
            .unwrap();
        if squatter.is_ok() {
            assert_ne!(first, second);
            assert!(!bridge.forwards().contains_key(&first));
            assert!(!ports::is_reserved(first));
        }
        assert_eq!(tracker.leased_ports(), vec![second]);
        tracker.release_all(&bridge).await;
    }

    #[tokio::test]
    async fn test_failed_forward_frees_port() {
        let bridge = FakeBridge::new("A");
        bridge.set_fail_forward(true);
        let mut tracker = PortLeaseTracker::new("A");

        let err = tracker
            .lease(&bridge, PortRole::Command, 5001, LeaseMode::Exclusive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bridge { .. }));
        assert!(!tracker.is_leased(PortRole::Command));
    }

    #[tokio::test]
    async fn test_release_unleased_role_is_noop() {
        let bridge = FakeBridge::new("A");
        let mut tracker = PortLeaseTracker::new("A");
        tracker.release(&bridge, PortRole::Command).await.unwrap();
        tracker.release_all(&bridge).await;
    }

    #[tokio::test]
    async fn test_interleaved_leases_never_share_ports() {
        let bridges = [FakeBridge::new("A"), FakeBridge::new("B")];
        let mut trackers = [PortLeaseTracker::new("A"), PortLeaseTracker::new("B")];
        let roles = [PortRole::Command, PortRole::Callback, PortRole::Scripting];

        // Deterministic pseudo-random walk over lease/release
        let mut seed: u32 = 12345;
        for _ in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let device = (seed >> 8) as usize % 2;
            let role = roles[(seed >> 12) as usize % roles.len()];

            let tracker = &mut trackers[device];
            if tracker.is_leased(role) {
                tracker.release(&bridges[device], role).await.unwrap();
            } else {
                tracker
                    .lease(&bridges[device], role, 5000, LeaseMode::Exclusive)
                    .await
                    .unwrap();
            }

            let all: Vec<u16> = trackers.iter().flat_map(|t| t.leased_ports()).collect();
            let unique: HashSet<u16> = all.iter().copied().collect();
            assert_eq!(all.len(), unique.len(), "duplicate host port leased");
        }

        for (tracker, bridge) in trackers.iter_mut().zip(bridges.iter()) {
            let held = tracker.leased_ports();
            tracker.release_all(bridge).await;
            assert!(tracker.is_empty());
            assert!(held.iter().all(|p| !ports::is_reserved(*p)));
            assert!(bridge.forwards().is_empty());
            assert!(bridge.reverses().is_empty());
        }
    }
}
