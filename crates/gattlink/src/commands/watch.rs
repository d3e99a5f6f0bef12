//! `gattlink watch`: connect devices through one registry and stream events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info};

use gattlink_config::{Config, Profile, profile_to_connection_config};
use gattlink_core::{
    ConnectionConfig, ConnectionRegistry, ConnectionState, DeviceIdentity, MacAddress,
    SimulatedSession,
};

use crate::cli::{GlobalOpts, WatchArgs};
use crate::commands::load_config;
use crate::error::CliError;
use crate::output::EventPrinter;

/// How long to wait for the final `Released` events after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn handle(args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let targets = resolve_targets(&cfg, &args, global)?;

    let behavior = args.sim.behavior(Duration::from_millis(args.latency_ms));
    let registry = ConnectionRegistry::new(Arc::new(SimulatedSession::new(behavior)));
    let (subscription, mut events) = registry.subscribe_channel();
    let printer = EventPrinter::new(global);

    let mut pending: HashSet<MacAddress> = HashSet::new();
    for (identity, connection) in targets {
        info!(device = %identity, "connecting");
        pending.insert(identity.address.clone());
        registry.connect(identity, connection);
    }

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let stop = async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(stop, interrupt);

    loop {
        tokio::select! {
            biased;
            _ = &mut interrupt => {
                debug!("interrupted");
                break;
            }
            () = &mut stop => break,
            event = events.recv() => match event {
                Some(event) => printer.print(&event)?,
                None => break,
            },
        }
    }

    registry.release_all();

    // Print the Released events before exiting.
    while !pending.is_empty() {
        match timeout(DRAIN_TIMEOUT, events.recv()).await {
            Ok(Some(event)) => {
                if event.state() == Some(ConnectionState::Released) {
                    pending.remove(&event.identity().address);
                }
                printer.print(&event)?;
            }
            Ok(None) | Err(_) => break,
        }
    }
    registry.unsubscribe(subscription);
    Ok(())
}

/// Resolve every device argument and its effective connection config.
fn resolve_targets(
    cfg: &Config,
    args: &WatchArgs,
    global: &GlobalOpts,
) -> Result<Vec<(DeviceIdentity, ConnectionConfig)>, CliError> {
    args.devices
        .iter()
        .map(|device| -> Result<_, CliError> {
            let resolved = cfg.resolve_device(device)?;
            let profile_name = global.profile.as_deref().or(resolved.profile.as_deref());
            let (name, profile) = cfg.profile(profile_name)?;
            debug!(device = %resolved.identity, profile = name, "resolved device");
            let connection = profile_to_connection_config(&with_overrides(profile, args))?;
            Ok((resolved.identity, connection))
        })
        .collect()
}

/// Apply command-line overrides on top of a profile.
fn with_overrides(profile: &Profile, args: &WatchArgs) -> Profile {
    let mut profile = profile.clone();
    if args.auto_reconnect {
        profile.auto_reconnect = true;
    }
    if let Some(ms) = args.discover_delay_ms {
        profile.discover_services_delay_ms = ms;
    }
    if let Some(ms) = args.connect_timeout_ms {
        profile.connect_timeout_ms = ms;
    }
    profile
}
