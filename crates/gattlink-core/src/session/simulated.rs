// ── Scripted in-memory session ──
//
// Plays back a per-address behavior on Tokio time. Used by the test suite
// and by the CLI's dry-run mode.

use std::future::pending;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{LinkEvent, Session};
use crate::model::{ConnectFailureKind, DeviceIdentity, MacAddress};

const LINK_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_LATENCY: Duration = Duration::from_millis(100);
const DEFAULT_SERVICES: usize = 3;

/// What the simulated radio does for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimBehavior {
    /// Every step succeeds after `latency`.
    Healthy { latency: Duration, services: usize },
    /// The scan never locates the device.
    NeverFound,
    /// The device is located but `open` fails immediately with the given reason.
    RejectOpen(ConnectFailureKind),
    /// The device is located but `open` never completes.
    HangOnOpen,
    /// The link comes up but service discovery never completes.
    HangOnDiscovery,
    /// The first `failures` opens are rejected; later ones succeed.
    Flaky { failures: u32, latency: Duration },
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self::Healthy {
            latency: DEFAULT_LATENCY,
            services: DEFAULT_SERVICES,
        }
    }
}

impl SimBehavior {
    fn latency(&self) -> Duration {
        match self {
            Self::Healthy { latency, .. } | Self::Flaky { latency, .. } => *latency,
            _ => DEFAULT_LATENCY,
        }
    }
}

/// Per-address call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub scans: u32,
    pub opens: u32,
    pub discoveries: u32,
    pub closes: u32,
}

pub struct SimulatedSession {
    default: SimBehavior,
    behaviors: DashMap<MacAddress, SimBehavior>,
    stats: DashMap<MacAddress, SimStats>,
    links: broadcast::Sender<LinkEvent>,
}

impl SimulatedSession {
    pub fn new(default: SimBehavior) -> Self {
        let (links, _) = broadcast::channel(LINK_CHANNEL_CAPACITY);
        Self {
            default,
            behaviors: DashMap::new(),
            stats: DashMap::new(),
            links,
        }
    }

    pub fn with_behavior(self, address: MacAddress, behavior: SimBehavior) -> Self {
        self.behaviors.insert(address, behavior);
        self
    }

    pub fn set_behavior(&self, address: MacAddress, behavior: SimBehavior) {
        self.behaviors.insert(address, behavior);
    }

    pub fn stats(&self, address: &MacAddress) -> SimStats {
        self.stats.get(address).map(|s| *s).unwrap_or_default()
    }

    /// Push an unsolicited link loss for `address`.
    pub fn drop_link(&self, address: &MacAddress) {
        debug!(address = %address, "simulating link loss");
        let _ = self.links.send(LinkEvent::Lost {
            address: address.clone(),
        });
    }

    fn behavior(&self, address: &MacAddress) -> SimBehavior {
        self.behaviors
            .get(address)
            .map_or_else(|| self.default.clone(), |b| b.clone())
    }

    fn record(&self, address: &MacAddress, update: impl FnOnce(&mut SimStats)) -> SimStats {
        let mut entry = self.stats.entry(address.clone()).or_default();
        update(&mut entry);
        *entry
    }
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new(SimBehavior::default())
    }
}

impl Session for SimulatedSession {
    async fn scan(&self, identity: &DeviceIdentity) -> Result<(), ConnectFailureKind> {
        self.record(&identity.address, |s| s.scans += 1);
        let behavior = self.behavior(&identity.address);
        if behavior == SimBehavior::NeverFound {
            return pending().await;
        }
        tokio::time::sleep(behavior.latency()).await;
        Ok(())
    }

    async fn open(&self, identity: &DeviceIdentity) -> Result<(), ConnectFailureKind> {
        let stats = self.record(&identity.address, |s| s.opens += 1);
        match self.behavior(&identity.address) {
            SimBehavior::RejectOpen(reason) => Err(reason),
            SimBehavior::HangOnOpen => pending().await,
            SimBehavior::Flaky { failures, latency } => {
                tokio::time::sleep(latency).await;
                if stats.opens <= failures {
                    Err(ConnectFailureKind::TransportRejected)
                } else {
                    Ok(())
                }
            }
            behavior => {
                tokio::time::sleep(behavior.latency()).await;
                Ok(())
            }
        }
    }

    async fn discover_services(&self, identity: &DeviceIdentity) -> Result<usize, ConnectFailureKind> {
        self.record(&identity.address, |s| s.discoveries += 1);
        match self.behavior(&identity.address) {
            SimBehavior::HangOnDiscovery => pending().await,
            SimBehavior::Healthy { latency, services } => {
                tokio::time::sleep(latency).await;
                Ok(services)
            }
            behavior => {
                tokio::time::sleep(behavior.latency()).await;
                Ok(DEFAULT_SERVICES)
            }
        }
    }

    fn close(&self, identity: &DeviceIdentity) {
        self.record(&identity.address, |s| s.closes += 1);
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.links.subscribe()
    }
}
