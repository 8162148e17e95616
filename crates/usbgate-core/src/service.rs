//! Async glue that runs the poll cadence and per-session countdown timers.

use crate::config::UsbgateConfig;
use crate::controller::{CountdownStep, LockController, SessionId, Transition};
use crate::device::DeviceId;
use crate::lister::DeviceLister;
use crate::registry::Registry;
use crate::remote::RemoteSynchronizer;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};

/// Drives a [`LockController`] from two independent schedules: the poll
/// cadence and the countdown of whichever lock session is active.
pub struct GateService {
    controller: Arc<LockController>,
    lister: Arc<dyn DeviceLister>,
    poll_interval: Duration,
    query_timeout: Duration,
    tick_interval: Duration,
    /// Query still running on the blocking pool after its timeout elapsed.
    stalled: Mutex<Option<JoinHandle<BTreeSet<DeviceId>>>>,
}

impl GateService {
    pub fn new(
        controller: Arc<LockController>,
        lister: Arc<dyn DeviceLister>,
        poll_interval: Duration,
        query_timeout: Duration,
        tick_interval: Duration,
    ) -> Self {
        Self {
            controller,
            lister,
            poll_interval,
            query_timeout,
            tick_interval,
            stalled: Mutex::new(None),
        }
    }

    pub fn from_config(
        controller: Arc<LockController>,
        lister: Arc<dyn DeviceLister>,
        config: &UsbgateConfig,
    ) -> Self {
        Self::new(
            controller,
            lister,
            config.poll_interval(),
            config.query_timeout(),
            config.tick_interval(),
        )
    }

    pub fn controller(&self) -> &Arc<LockController> {
        &self.controller
    }

    /// Poll the lister on a blocking worker, bounded by the query timeout.
    ///
    /// A stalled or panicking query reads as "no devices". While a stalled
    /// query is still running no new one is started, and each skipped poll
    /// also reads as "no devices".
    pub async fn poll_once(&self) -> BTreeSet<DeviceId> {
        let mut query = {
            let mut stalled = self.stalled.lock().unwrap_or_else(|p| p.into_inner());
            match stalled.take() {
                Some(query) if !query.is_finished() => {
                    *stalled = Some(query);
                    warn!(
                        "device lister `{}` has not returned yet; treating as no devices",
                        self.lister.name()
                    );
                    return BTreeSet::new();
                }
                _ => {
                    let lister = Arc::clone(&self.lister);
                    task::spawn_blocking(move || lister.poll())
                }
            }
        };

        match timeout(self.query_timeout, &mut query).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(err)) => {
                warn!("device lister `{}` failed: {err}", self.lister.name());
                BTreeSet::new()
            }
            Err(_) => {
                warn!(
                    "device lister `{}` exceeded {:?}; treating as no devices",
                    self.lister.name(),
                    self.query_timeout
                );
                *self.stalled.lock().unwrap_or_else(|p| p.into_inner()) = Some(query);
                BTreeSet::new()
            }
        }
    }

    /// Run one poll-and-evaluate cycle, starting a countdown on lock.
    pub async fn step(&self) -> Option<Transition> {
        let present = self.poll_once().await;
        debug!("poll observed {} device(s)", present.len());
        self.controller.registry().reload();
        let transition = self.controller.evaluate(&present);
        if let Some(Transition::Locked { session, .. }) = transition {
            self.spawn_countdown(session);
        }
        transition
    }

    /// Poll forever on the configured cadence.
    pub async fn run(self: Arc<Self>) {
        info!(
            "gate monitoring via `{}` every {:?} (query timeout {:?})",
            self.lister.name(),
            self.poll_interval,
            self.query_timeout
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.step().await;
        }
    }

    /// Start the countdown timer for `session`; it exits once the session ends.
    fn spawn_countdown(&self, session: SessionId) {
        let controller = Arc::clone(&self.controller);
        let period = self.tick_interval;
        let _timer: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match controller.countdown_tick(session) {
                    CountdownStep::Continue { .. } => {}
                    CountdownStep::Expired | CountdownStep::Stop => break,
                }
            }
            debug!("countdown timer for session {session} finished");
        });
    }
}

/// Re-fetch the remote list every `every` and merge it into `registry`.
pub async fn periodic_sync(remote: RemoteSynchronizer, registry: Arc<Registry>, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if remote.sync_into(&registry).await {
            info!("periodic remote sync added devices to the registry");
        }
    }
}
