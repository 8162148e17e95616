//! Presentation collaborator contract and the channel that feeds it.
//!
//! The lock screen owns rendering and input blocking but no timing: it only
//! reacts to events emitted by the controller. Events travel over a channel so
//! the controller never runs presentation code on its own task.

use log::{debug, warn};
use tokio::sync::mpsc;

/// Receiver of lock-screen events.
pub trait Presenter: Send + Sync {
    /// Show the blocking screen with the full countdown.
    fn show(&self, initial: u32);

    /// Remove the blocking screen.
    fn hide(&self);

    /// Countdown update, delivered once per time unit while shown.
    fn tick(&self, remaining: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationEvent {
    Show { initial: u32 },
    Hide,
    Tick { remaining: u32 },
}

/// `Presenter` that forwards events to whichever task owns the lock screen.
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<PresentationEvent>,
}

impl ChannelPresenter {
    /// Create a presenter together with the receiving end for the screen task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PresentationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PresentationEvent) {
        if self.tx.send(event).is_err() {
            warn!("lock screen receiver dropped; discarding {event:?}");
        }
    }
}

impl Presenter for ChannelPresenter {
    fn show(&self, initial: u32) {
        self.send(PresentationEvent::Show { initial });
    }

    fn hide(&self) {
        self.send(PresentationEvent::Hide);
    }

    fn tick(&self, remaining: u32) {
        self.send(PresentationEvent::Tick { remaining });
    }
}

/// Visible state of a lock screen, used by screen implementations to make
/// `show` and `hide` idempotent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreenState {
    shown: bool,
    remaining: u32,
}

impl ScreenState {
    /// Apply `event`, returning whether anything visible changed.
    pub fn apply(&mut self, event: PresentationEvent) -> bool {
        match event {
            PresentationEvent::Show { initial } => {
                if self.shown {
                    debug!("lock screen already shown");
                    return false;
                }
                self.shown = true;
                self.remaining = initial;
                true
            }
            PresentationEvent::Hide => {
                if !self.shown {
                    return false;
                }
                self.shown = false;
                true
            }
            PresentationEvent::Tick { remaining } => {
                if !self.shown || self.remaining == remaining {
                    return false;
                }
                self.remaining = remaining;
                true
            }
        }
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_and_hide_are_idempotent() {
        let mut screen = ScreenState::default();
        assert!(!screen.apply(PresentationEvent::Hide));
        assert!(screen.apply(PresentationEvent::Show { initial: 160 }));
        assert!(!screen.apply(PresentationEvent::Show { initial: 160 }));
        assert!(screen.apply(PresentationEvent::Tick { remaining: 159 }));
        assert_eq!(screen.remaining(), 159);
        assert!(screen.apply(PresentationEvent::Hide));
        assert!(!screen.apply(PresentationEvent::Hide));
        assert!(!screen.is_shown());
    }

    #[test]
    fn ticks_while_hidden_are_ignored() {
        let mut screen = ScreenState::default();
        assert!(!screen.apply(PresentationEvent::Tick { remaining: 10 }));
        assert_eq!(screen.remaining(), 0);
    }

    #[test]
    fn channel_presenter_preserves_order() {
        let (presenter, mut rx) = ChannelPresenter::channel();
        presenter.show(5);
        presenter.tick(4);
        presenter.hide();

        assert_eq!(rx.try_recv().unwrap(), PresentationEvent::Show { initial: 5 });
        assert_eq!(rx.try_recv().unwrap(), PresentationEvent::Tick { remaining: 4 });
        assert_eq!(rx.try_recv().unwrap(), PresentationEvent::Hide);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sending_after_receiver_drop_is_harmless() {
        let (presenter, rx) = ChannelPresenter::channel();
        drop(rx);
        presenter.show(1);
        presenter.hide();
    }
}
