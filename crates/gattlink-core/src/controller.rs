// ── Connection controller ──
//
// One state machine per remote device. Every mutation happens under the
// controller's own `phase` lock; session calls, phase timers, and backoff
// delays run as spawned tasks that re-enter through that lock carrying the
// epoch or timer id they were started with, so late arrivals are dropped.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::CoreError;
use crate::model::{
    ConnectFailureKind, ConnectionEvent, ConnectionState, DeviceIdentity, TimeoutKind,
};
use crate::notifier::EventNotifier;
use crate::session::{LinkEvent, Session};

// ── Controller ───────────────────────────────────────────────────────

/// Handle to the state machine driving one device.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. Obtained from a
/// [`ConnectionRegistry`](crate::ConnectionRegistry); never constructed
/// directly by consumers.
pub struct ConnectionController<S: Session> {
    inner: Arc<ControllerInner<S>>,
}

struct ControllerInner<S> {
    identity: DeviceIdentity,
    config: ConnectionConfig,
    session: Arc<S>,
    notifier: EventNotifier,
    state_tx: watch::Sender<ConnectionState>,
    phase: Mutex<Phase>,
    /// Parent of every task this controller spawns. Cancelled by `release()`.
    cancel: CancellationToken,
}

struct Phase {
    state: ConnectionState,
    /// Bumped on every transition. In-flight steps carry the epoch they
    /// were spawned in and are ignored once it no longer matches.
    epoch: u64,
    /// Cancels the step (session call or delay) owned by the current state.
    step: CancellationToken,
    timer: Option<ArmedTimer>,
    next_timer_id: u64,
    /// Automatic reconnect attempts since the last successful discovery.
    attempts: u32,
    /// Set by `disconnect()`: suppresses automatic reconnects.
    held: bool,
}

struct ArmedTimer {
    id: u64,
    cancel: CancellationToken,
}

impl<S: Session> Clone for ConnectionController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Session> fmt::Debug for ConnectionController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<S: Session> ConnectionController<S> {
    /// Build an idle controller and start watching the session's link
    /// notifications. Must be called from within a Tokio runtime.
    pub(crate) fn new(
        identity: DeviceIdentity,
        config: ConnectionConfig,
        session: Arc<S>,
        notifier: EventNotifier,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let phase = Phase {
            state: ConnectionState::Idle,
            epoch: 0,
            step: cancel.child_token(),
            timer: None,
            next_timer_id: 0,
            attempts: 0,
            held: false,
        };

        let controller = Self {
            inner: Arc::new(ControllerInner {
                identity,
                config,
                session,
                notifier,
                state_tx,
                phase: Mutex::new(phase),
                cancel,
            }),
        };
        controller.spawn_link_watcher();
        controller
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current state, for synchronous polling.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state changes of this controller only.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_released(&self) -> bool {
        self.state().is_released()
    }

    /// Whether two handles refer to the same controller instance.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Lifecycle requests ───────────────────────────────────────────

    /// Leave `Idle` and begin scanning for the device.
    pub(crate) fn start(&self) {
        let mut phase = self.lock();
        if phase.state == ConnectionState::Idle {
            info!(address = %self.inner.identity.address, "starting connection");
            self.transition(&mut phase, ConnectionState::Scanning);
        }
    }

    /// Restart the connect cycle from `Idle` or `Disconnected`, resetting
    /// the reconnect counter and lifting a previous `disconnect()`.
    ///
    /// A no-op while a connection attempt or link is already active.
    pub fn reconnect(&self) -> Result<(), CoreError> {
        let mut phase = self.lock();
        if phase.state.is_released() {
            return Err(self.already_released());
        }
        phase.held = false;
        phase.attempts = 0;
        if matches!(
            phase.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            debug!(address = %self.inner.identity.address, "reconnect requested");
            self.transition(&mut phase, ConnectionState::Scanning);
        }
        Ok(())
    }

    /// Drop the link (or abandon the attempt) and stay `Disconnected`
    /// until [`reconnect()`](Self::reconnect), even with auto-reconnect on.
    pub fn disconnect(&self) -> Result<(), CoreError> {
        let mut phase = self.lock();
        if phase.state.is_released() {
            return Err(self.already_released());
        }
        phase.held = true;
        if !matches!(
            phase.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            debug!(address = %self.inner.identity.address, "disconnect requested");
            self.transition(&mut phase, ConnectionState::Disconnected);
        }
        Ok(())
    }

    /// Tear the controller down for good.
    ///
    /// Cancels every timer and in-flight step, detaches from the session,
    /// and publishes the final `Released` event. Returns `false` if the
    /// controller was already released.
    pub fn release(&self) -> bool {
        let mut phase = self.lock();
        if phase.state.is_released() {
            return false;
        }
        self.inner.cancel.cancel();
        phase.timer = None;
        self.set_state(&mut phase, ConnectionState::Released);
        // Local state is final before the collaborator is touched.
        self.inner.session.close(&self.inner.identity);
        info!(address = %self.inner.identity.address, "connection released");
        true
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Update the state field, then publish. Callers hold the phase lock.
    fn set_state(&self, phase: &mut Phase, next: ConnectionState) {
        let from = phase.state;
        phase.state = next;
        phase.epoch += 1;
        self.inner.state_tx.send_replace(next);
        debug!(address = %self.inner.identity.address, %from, to = %next, "state transition");
        self.inner.notifier.publish(ConnectionEvent::StateChanged {
            identity: self.inner.identity.clone(),
            state: next,
        });
    }

    fn transition(&self, phase: &mut Phase, next: ConnectionState) {
        let from = phase.state;

        phase.step.cancel();
        phase.step = self.inner.cancel.child_token();
        // The connect-phase timer spans Scanning and Connecting.
        let keeps_timer = from == ConnectionState::Scanning && next == ConnectionState::Connecting;
        if !keeps_timer {
            disarm(phase);
        }

        self.set_state(phase, next);

        match next {
            ConnectionState::Scanning => {
                self.arm_timer(phase, self.inner.config.connect_timeout());
                let (session, identity) = self.session_parts();
                self.spawn_step(
                    phase,
                    async move { session.scan(&identity).await },
                    Self::on_located,
                );
            }
            ConnectionState::Connecting => {
                if !keeps_timer {
                    self.arm_timer(phase, self.inner.config.connect_timeout());
                }
                let (session, identity) = self.session_parts();
                self.spawn_step(
                    phase,
                    async move { session.open(&identity).await },
                    Self::on_opened,
                );
            }
            ConnectionState::Connected => {
                let delay = self.inner.config.discover_services_delay();
                self.spawn_step(phase, tokio::time::sleep(delay), |this, epoch, ()| {
                    this.begin_discovery(epoch);
                });
            }
            ConnectionState::ServiceDiscovering => {
                self.arm_timer(phase, self.inner.config.discover_timeout());
                let (session, identity) = self.session_parts();
                self.spawn_step(
                    phase,
                    async move { session.discover_services(&identity).await },
                    Self::on_discovered,
                );
            }
            ConnectionState::ServiceDiscovered => {
                phase.attempts = 0;
            }
            ConnectionState::Disconnected => {
                self.inner.session.close(&self.inner.identity);
                self.schedule_reconnect(phase);
            }
            ConnectionState::Idle | ConnectionState::Released => {}
        }
    }

    /// Publish `ConnectFailed` and drop to `Disconnected`.
    fn fail(&self, phase: &mut Phase, reason: ConnectFailureKind) {
        warn!(
            address = %self.inner.identity.address,
            state = %phase.state,
            %reason,
            "connect failed"
        );
        self.inner.notifier.publish(ConnectionEvent::ConnectFailed {
            identity: self.inner.identity.clone(),
            reason,
        });
        self.transition(phase, ConnectionState::Disconnected);
    }

    fn schedule_reconnect(&self, phase: &mut Phase) {
        if !self.inner.config.auto_reconnect() || phase.held {
            return;
        }

        let policy = self.inner.config.reconnect();
        if !policy.allows(phase.attempts) {
            warn!(
                address = %self.inner.identity.address,
                attempts = phase.attempts,
                "reconnect attempts exhausted"
            );
            self.inner.notifier.publish(ConnectionEvent::ConnectFailed {
                identity: self.inner.identity.clone(),
                reason: ConnectFailureKind::MaximumReconnection,
            });
            return;
        }

        let delay = policy.delay_before(phase.attempts);
        info!(
            address = %self.inner.identity.address,
            attempt = phase.attempts.saturating_add(1),
            immediate = policy.is_immediate(phase.attempts),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        self.spawn_step(phase, tokio::time::sleep(delay), |this, epoch, ()| {
            this.retry(epoch);
        });
    }

    // ── Step completions ─────────────────────────────────────────────

    fn on_located(&self, epoch: u64, result: Result<(), ConnectFailureKind>) {
        let mut phase = self.lock();
        if !current(&phase, epoch, ConnectionState::Scanning) {
            return;
        }
        match result {
            Ok(()) => {
                debug!(address = %self.inner.identity.address, "device located");
                self.transition(&mut phase, ConnectionState::Connecting);
            }
            Err(reason) => self.fail(&mut phase, reason),
        }
    }

    fn on_opened(&self, epoch: u64, result: Result<(), ConnectFailureKind>) {
        let mut phase = self.lock();
        if !current(&phase, epoch, ConnectionState::Connecting) {
            return;
        }
        match result {
            Ok(()) => {
                info!(address = %self.inner.identity.address, "link established");
                self.transition(&mut phase, ConnectionState::Connected);
            }
            Err(reason) => self.fail(&mut phase, reason),
        }
    }

    fn begin_discovery(&self, epoch: u64) {
        let mut phase = self.lock();
        if current(&phase, epoch, ConnectionState::Connected) {
            self.transition(&mut phase, ConnectionState::ServiceDiscovering);
        }
    }

    fn on_discovered(&self, epoch: u64, result: Result<usize, ConnectFailureKind>) {
        let mut phase = self.lock();
        if !current(&phase, epoch, ConnectionState::ServiceDiscovering) {
            return;
        }
        match result {
            Ok(0) => self.fail(&mut phase, ConnectFailureKind::NoServices),
            Ok(services) => {
                info!(address = %self.inner.identity.address, services, "services discovered");
                self.transition(&mut phase, ConnectionState::ServiceDiscovered);
            }
            Err(reason) => self.fail(&mut phase, reason),
        }
    }

    fn retry(&self, epoch: u64) {
        let mut phase = self.lock();
        if !current(&phase, epoch, ConnectionState::Disconnected) || phase.held {
            return;
        }
        let next = if self.inner.config.reconnect().is_immediate(phase.attempts) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Scanning
        };
        phase.attempts = phase.attempts.saturating_add(1);
        debug!(address = %self.inner.identity.address, attempt = phase.attempts, %next, "reconnecting");
        self.transition(&mut phase, next);
    }

    fn on_timer(&self, id: u64) {
        let mut phase = self.lock();
        if phase.timer.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        phase.timer = None;

        let kind = match phase.state {
            ConnectionState::Scanning => TimeoutKind::DeviceNotFound,
            ConnectionState::Connecting => TimeoutKind::CannotConnect,
            ConnectionState::ServiceDiscovering => TimeoutKind::ServiceDiscoveryFailed,
            _ => return,
        };
        warn!(address = %self.inner.identity.address, %kind, "connect timeout");
        self.inner.notifier.publish(ConnectionEvent::ConnectTimeout {
            identity: self.inner.identity.clone(),
            kind,
        });
        self.transition(&mut phase, ConnectionState::Disconnected);
    }

    fn on_link_lost(&self) {
        let mut phase = self.lock();
        if phase.state.has_link() {
            warn!(address = %self.inner.identity.address, state = %phase.state, "link lost");
            self.transition(&mut phase, ConnectionState::Disconnected);
        }
    }

    // ── Task plumbing ────────────────────────────────────────────────

    /// Run `work` as the current state's step; hand its output to
    /// `complete` unless the step is cancelled first.
    fn spawn_step<T, Fut>(&self, phase: &Phase, work: Fut, complete: fn(&Self, u64, T))
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let this = self.clone();
        let epoch = phase.epoch;
        let token = phase.step.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                output = work => complete(&this, epoch, output),
            }
        });
    }

    fn arm_timer(&self, phase: &mut Phase, duration: Duration) {
        disarm(phase);
        phase.next_timer_id += 1;
        let id = phase.next_timer_id;
        let cancel = self.inner.cancel.child_token();
        phase.timer = Some(ArmedTimer {
            id,
            cancel: cancel.clone(),
        });

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(duration) => this.on_timer(id),
            }
        });
    }

    fn spawn_link_watcher(&self) {
        // Subscribe before returning so no notification can slip past.
        let mut links = self.inner.session.link_events();
        let cancel = self.inner.cancel.clone();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = links.recv() => match event {
                        Ok(LinkEvent::Lost { address }) if address == this.inner.identity.address => {
                            this.on_link_lost();
                        }
                        Ok(LinkEvent::Lost { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "link event receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn session_parts(&self) -> (Arc<S>, DeviceIdentity) {
        (Arc::clone(&self.inner.session), self.inner.identity.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn already_released(&self) -> CoreError {
        CoreError::AlreadyReleased {
            address: self.inner.identity.address.to_string(),
        }
    }
}

fn disarm(phase: &mut Phase) {
    if let Some(timer) = phase.timer.take() {
        timer.cancel.cancel();
    }
}

fn current(phase: &Phase, epoch: u64, expected: ConnectionState) -> bool {
    phase.epoch == epoch && phase.state == expected
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{SimBehavior, SimulatedSession};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::parse("AA:BB:CC:DD:EE:10", "Scale").unwrap()
    }

    fn controller(
        behavior: SimBehavior,
        config: ConnectionConfig,
    ) -> (
        ConnectionController<SimulatedSession>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let notifier = EventNotifier::new();
        let (_handle, rx) = notifier.subscribe_channel();
        let session = Arc::new(SimulatedSession::new(behavior));
        (
            ConnectionController::new(identity(), config, session, notifier),
            rx,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_after_success_is_ignored() {
        let (ctrl, mut rx) = controller(SimBehavior::HangOnDiscovery, ConnectionConfig::default());
        ctrl.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctrl.state(), ConnectionState::ServiceDiscovering);

        // The connect timer (id 1) was disarmed on reaching Connected.
        ctrl.on_timer(1);
        settle().await;

        assert_eq!(ctrl.state(), ConnectionState::ServiceDiscovering);
        let events = drain(&mut rx);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ConnectionEvent::ConnectTimeout { .. })),
            "unexpected timeout in {events:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_step_completion_does_not_regress_state() {
        let (ctrl, mut rx) = controller(SimBehavior::HangOnOpen, ConnectionConfig::default());
        ctrl.start();
        settle().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctrl.state(), ConnectionState::Connecting);
        drain(&mut rx);

        // A scan result from the previous epoch arrives late.
        ctrl.on_located(0, Ok(()));
        ctrl.on_located(1, Err(ConnectFailureKind::AdapterDisabled));
        settle().await;

        assert_eq!(ctrl.state(), ConnectionState::Connecting);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_classification_follows_current_phase() {
        let config = ConnectionConfig::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let (ctrl, mut rx) = controller(SimBehavior::HangOnOpen, config);
        ctrl.start();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let events = drain(&mut rx);
        assert!(events.contains(&ConnectionEvent::ConnectTimeout {
            identity: identity(),
            kind: TimeoutKind::CannotConnect,
        }));
        assert_eq!(ctrl.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_holds_until_reconnect() {
        let config = ConnectionConfig::builder()
            .auto_reconnect(true)
            .build()
            .unwrap();
        let (ctrl, _rx) = controller(SimBehavior::default(), config);
        ctrl.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctrl.state(), ConnectionState::ServiceDiscovered);

        ctrl.disconnect().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ctrl.state(), ConnectionState::Disconnected);

        ctrl.reconnect().unwrap();
        assert_eq!(ctrl.state(), ConnectionState::Scanning);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctrl.state(), ConnectionState::ServiceDiscovered);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_controls_fail_after_release() {
        let (ctrl, _rx) = controller(SimBehavior::default(), ConnectionConfig::default());
        ctrl.start();
        assert!(ctrl.release());
        assert!(!ctrl.release());
        assert!(matches!(ctrl.reconnect(), Err(CoreError::AlreadyReleased { .. })));
        assert!(matches!(ctrl.disconnect(), Err(CoreError::AlreadyReleased { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_state_tracks_transitions() {
        let (ctrl, _rx) = controller(SimBehavior::default(), ConnectionConfig::default());
        let mut watch = ctrl.watch_state();
        assert_eq!(*watch.borrow(), ConnectionState::Idle);

        ctrl.start();
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow_and_update(), ConnectionState::Scanning);
    }
}
