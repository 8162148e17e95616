//! Console rendition of the lock screen.
//!
//! Runs on its own task and only reacts to controller events; the countdown
//! and the shutdown decision stay with the controller.

use log::{error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use usbgate_core::{PresentationEvent, ScreenState};

/// Announce every remaining value at or below this, and every
/// `ANNOUNCE_EVERY` ticks above it.
const FINAL_COUNTDOWN: u32 = 10;
const ANNOUNCE_EVERY: u32 = 30;

pub(crate) async fn run(mut events: UnboundedReceiver<PresentationEvent>) {
    let mut screen = ScreenState::default();
    while let Some(event) = events.recv().await {
        if !screen.apply(event) {
            continue;
        }
        match event {
            PresentationEvent::Show { initial } => {
                warn!("SCREEN LOCKED: attach an authorized USB device; shutdown in {initial}s");
            }
            PresentationEvent::Hide => info!("screen unlocked"),
            PresentationEvent::Tick { remaining } => {
                if should_announce(remaining) {
                    warn!("shutdown in {remaining}s");
                }
                if remaining == 0 {
                    error!("countdown finished");
                }
            }
        }
    }
    info!("lock screen channel closed");
}

fn should_announce(remaining: u32) -> bool {
    remaining <= FINAL_COUNTDOWN || remaining % ANNOUNCE_EVERY == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcements_thin_out_early_in_the_countdown() {
        assert!(should_announce(150));
        assert!(!should_announce(149));
        assert!(should_announce(10));
        assert!(should_announce(1));
    }

    #[tokio::test]
    async fn screen_task_ends_when_controller_side_drops() {
        let (presenter, rx) = usbgate_core::ChannelPresenter::channel();
        let task = tokio::spawn(run(rx));
        usbgate_core::Presenter::show(&presenter, 3);
        usbgate_core::Presenter::hide(&presenter);
        drop(presenter);
        task.await.unwrap();
    }
}
