//! Lock state machine and the controller that drives its collaborators.
//!
//! [`LockMachine`] is a pure state machine: each poll tick reports whether an
//! authorized device is present, and each countdown tick advances the active
//! session. [`LockController`] wraps it behind a mutex, consults the registry
//! and forwards the resulting events to the presentation and shutdown
//! collaborators.

use crate::device::DeviceId;
use crate::presentation::Presenter;
use crate::registry::Registry;
use crate::shutdown::ShutdownAction;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Distinguishes lock sessions so a stale countdown timer can tell it is stale.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LockSession {
    id: SessionId,
    remaining: u32,
    ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Locked(LockSession),
    /// Shutdown has been issued; nothing transitions out of here.
    Expired,
}

/// State change produced by a poll evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Locked { session: SessionId, grace: u32 },
    Unlocked,
}

/// Outcome of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    /// The session is still counting down.
    Continue { remaining: u32 },
    /// The session just ran out; shutdown is due.
    Expired,
    /// The session is gone (unlocked, replaced or already expired).
    Stop,
}

/// Externally visible gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Unlocked,
    Locked { remaining: u32, ticks: u64 },
    Expired,
}

impl GateStatus {
    pub fn is_locked(&self) -> bool {
        !matches!(self, GateStatus::Unlocked)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStatus::Unlocked => f.write_str("UNLOCKED"),
            GateStatus::Locked { remaining, .. } => write!(f, "LOCKED {remaining}"),
            GateStatus::Expired => f.write_str("EXPIRED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockMachine {
    grace: u32,
    state: LockState,
    next_session: SessionId,
}

impl LockMachine {
    pub fn new(grace: u32) -> Self {
        Self {
            grace,
            state: LockState::Unlocked,
            next_session: 1,
        }
    }

    /// Apply one poll observation.
    pub fn evaluate(&mut self, authorized_present: bool) -> Option<Transition> {
        match (self.state, authorized_present) {
            (LockState::Unlocked, false) => {
                let session = self.next_session;
                self.next_session += 1;
                self.state = LockState::Locked(LockSession {
                    id: session,
                    remaining: self.grace,
                    ticks: 0,
                });
                Some(Transition::Locked {
                    session,
                    grace: self.grace,
                })
            }
            (LockState::Locked(_), true) => {
                self.state = LockState::Unlocked;
                Some(Transition::Unlocked)
            }
            _ => None,
        }
    }

    /// Advance the countdown of `session` by one time unit.
    pub fn countdown_tick(&mut self, session: SessionId) -> CountdownStep {
        let LockState::Locked(mut current) = self.state else {
            return CountdownStep::Stop;
        };
        if current.id != session {
            return CountdownStep::Stop;
        }

        current.remaining = current.remaining.saturating_sub(1);
        current.ticks += 1;
        if current.remaining == 0 {
            self.state = LockState::Expired;
            return CountdownStep::Expired;
        }

        self.state = LockState::Locked(current);
        CountdownStep::Continue {
            remaining: current.remaining,
        }
    }

    pub fn status(&self) -> GateStatus {
        match self.state {
            LockState::Unlocked => GateStatus::Unlocked,
            LockState::Locked(session) => GateStatus::Locked {
                remaining: session.remaining,
                ticks: session.ticks,
            },
            LockState::Expired => GateStatus::Expired,
        }
    }
}

/// Serializes poll evaluations, countdown ticks and status reads.
pub struct LockController {
    registry: Arc<Registry>,
    presenter: Arc<dyn Presenter>,
    shutdown: Arc<dyn ShutdownAction>,
    machine: Mutex<LockMachine>,
}

impl LockController {
    pub fn new(
        registry: Arc<Registry>,
        presenter: Arc<dyn Presenter>,
        shutdown: Arc<dyn ShutdownAction>,
        grace: u32,
    ) -> Self {
        Self {
            registry,
            presenter,
            shutdown,
            machine: Mutex::new(LockMachine::new(grace)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Compare the polled devices against the registry and transition.
    ///
    /// Presentation events are emitted while the state lock is held so their
    /// order always matches the order of transitions.
    pub fn evaluate(&self, present: &BTreeSet<DeviceId>) -> Option<Transition> {
        let authorized = self.registry.intersects(present);
        let mut machine = self.machine();
        let transition = machine.evaluate(authorized);
        match transition {
            Some(Transition::Locked { session, grace }) => {
                warn!(
                    "no authorized device attached ({} present); locking host, session {session}, shutdown in {grace}",
                    present.len()
                );
                self.presenter.show(grace);
            }
            Some(Transition::Unlocked) => {
                info!("authorized device attached; unlocking host");
                self.presenter.hide();
            }
            None => {}
        }
        transition
    }

    /// Advance the countdown for `session`, triggering shutdown on expiry.
    pub fn countdown_tick(&self, session: SessionId) -> CountdownStep {
        let step = {
            let mut machine = self.machine();
            let step = machine.countdown_tick(session);
            match step {
                CountdownStep::Continue { remaining } => self.presenter.tick(remaining),
                CountdownStep::Expired => self.presenter.tick(0),
                CountdownStep::Stop => debug!("countdown for session {session} stopped"),
            }
            step
        };

        if step == CountdownStep::Expired {
            error!("grace period for session {session} expired; shutting down host");
            if let Err(err) = self.shutdown.shutdown() {
                error!("shutdown failed and will not be retried: {err}");
            }
        }
        step
    }

    pub fn status(&self) -> GateStatus {
        self.machine().status()
    }

    fn machine(&self) -> MutexGuard<'_, LockMachine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
