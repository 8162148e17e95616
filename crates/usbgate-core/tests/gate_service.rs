use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use usbgate_core::{
    ChannelPresenter, DeviceId, DeviceLister, GateResult, GateService, GateStatus,
    LockController, PresentationEvent, Registry, ShutdownAction, Transition,
};

/// Lister whose answer flips between "authorized key attached" and "nothing".
struct ToggleLister {
    attached: AtomicBool,
    key: DeviceId,
    stall: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ToggleLister {
    fn new(key: &str, attached: bool) -> Self {
        Self {
            attached: AtomicBool::new(attached),
            key: DeviceId::new(key).unwrap(),
            stall: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }
}

impl DeviceLister for ToggleLister {
    fn poll(&self) -> BTreeSet<DeviceId> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stall = *self.stall.lock().unwrap();
        if let Some(delay) = stall {
            thread::sleep(delay);
        }
        let mut ids = BTreeSet::new();
        ids.insert(DeviceId::new("UNRELATED0").unwrap());
        if self.attached.load(Ordering::SeqCst) {
            ids.insert(self.key.clone());
        }
        ids
    }

    fn name(&self) -> &'static str {
        "toggle"
    }
}

#[derive(Default)]
struct CountingShutdown {
    calls: AtomicUsize,
}

impl ShutdownAction for CountingShutdown {
    fn shutdown(&self) -> GateResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    service: Arc<GateService>,
    lister: Arc<ToggleLister>,
    shutdown: Arc<CountingShutdown>,
    events: UnboundedReceiver<PresentationEvent>,
}

fn fixture(grace: u32, poll: Duration, query_timeout: Duration, tick: Duration) -> Fixture {
    let dir = tempdir().unwrap();
    let registry = Arc::new(Registry::load(dir.path().join("allowed_serials.json")));
    registry.merge([DeviceId::new("KEY0001").unwrap()]);

    let lister = Arc::new(ToggleLister::new("key-0001", true));
    let (presenter, events) = ChannelPresenter::channel();
    let shutdown = Arc::new(CountingShutdown::default());
    let controller = Arc::new(LockController::new(
        registry,
        Arc::new(presenter),
        shutdown.clone(),
        grace,
    ));
    let service = Arc::new(GateService::new(
        controller,
        lister.clone(),
        poll,
        query_timeout,
        tick,
    ));

    Fixture {
        _dir: dir,
        service,
        lister,
        shutdown,
        events,
    }
}

fn drain(rx: &mut UnboundedReceiver<PresentationEvent>) -> Vec<PresentationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn flapping_device_relocks_with_full_grace() {
    let mut f = fixture(
        5,
        Duration::from_secs(3600),
        Duration::from_secs(1),
        Duration::from_secs(3600),
    );

    f.lister.set_attached(false);
    assert!(matches!(
        f.service.step().await,
        Some(Transition::Locked { grace: 5, .. })
    ));

    f.lister.set_attached(true);
    assert_eq!(f.service.step().await, Some(Transition::Unlocked));

    f.lister.set_attached(false);
    assert!(matches!(
        f.service.step().await,
        Some(Transition::Locked { grace: 5, .. })
    ));
    assert_eq!(
        f.service.controller().status(),
        GateStatus::Locked {
            remaining: 5,
            ticks: 0
        }
    );

    assert_eq!(
        drain(&mut f.events),
        vec![
            PresentationEvent::Show { initial: 5 },
            PresentationEvent::Hide,
            PresentationEvent::Show { initial: 5 },
        ]
    );
}

#[tokio::test]
async fn countdown_timer_expires_and_shuts_down_once() {
    let mut f = fixture(
        3,
        Duration::from_secs(3600),
        Duration::from_secs(1),
        Duration::from_millis(20),
    );

    f.lister.set_attached(false);
    f.service.step().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(f.service.controller().status(), GateStatus::Expired);
    assert_eq!(f.shutdown.calls.load(Ordering::SeqCst), 1);

    // Reattaching the key after expiry changes nothing.
    f.lister.set_attached(true);
    assert_eq!(f.service.step().await, None);
    assert_eq!(f.shutdown.calls.load(Ordering::SeqCst), 1);

    let events = drain(&mut f.events);
    assert_eq!(events.first(), Some(&PresentationEvent::Show { initial: 3 }));
    assert_eq!(events.last(), Some(&PresentationEvent::Tick { remaining: 0 }));
}

#[tokio::test]
async fn unlock_stops_countdown_before_expiry() {
    let f = fixture(
        10,
        Duration::from_secs(3600),
        Duration::from_secs(1),
        Duration::from_millis(20),
    );

    f.lister.set_attached(false);
    f.service.step().await;
    tokio::time::sleep(Duration::from_millis(70)).await;
    f.lister.set_attached(true);
    assert_eq!(f.service.step().await, Some(Transition::Unlocked));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(f.service.controller().status(), GateStatus::Unlocked);
    assert_eq!(f.shutdown.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stalled_query_reads_as_no_devices() {
    let f = fixture(
        160,
        Duration::from_secs(3600),
        Duration::from_millis(50),
        Duration::from_secs(3600),
    );
    *f.lister.stall.lock().unwrap() = Some(Duration::from_millis(500));

    assert!(f.service.poll_once().await.is_empty());
    assert!(matches!(
        f.service.step().await,
        Some(Transition::Locked { .. })
    ));
}

#[tokio::test]
async fn run_loop_follows_device_presence() {
    let mut f = fixture(
        160,
        Duration::from_millis(20),
        Duration::from_secs(1),
        Duration::from_secs(3600),
    );

    let runner = tokio::spawn(f.service.clone().run());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(f.service.controller().status(), GateStatus::Unlocked);
    assert!(drain(&mut f.events).is_empty());

    f.lister.set_attached(false);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(f.service.controller().status().is_locked());

    f.lister.set_attached(true);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(f.service.controller().status(), GateStatus::Unlocked);

    runner.abort();
    assert_eq!(
        drain(&mut f.events),
        vec![PresentationEvent::Show { initial: 160 }, PresentationEvent::Hide]
    );
}

#[tokio::test]
async fn stalled_query_is_not_started_again_until_it_returns() {
    let f = fixture(
        160,
        Duration::from_secs(3600),
        Duration::from_millis(50),
        Duration::from_secs(3600),
    );
    *f.lister.stall.lock().unwrap() = Some(Duration::from_millis(400));

    assert!(f.service.poll_once().await.is_empty());
    assert!(f.service.poll_once().await.is_empty());
    assert!(f.service.poll_once().await.is_empty());
    assert_eq!(f.lister.calls.load(Ordering::SeqCst), 1);

    *f.lister.stall.lock().unwrap() = None;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let present = f.service.poll_once().await;
    assert!(present.contains(&DeviceId::new("KEY0001").unwrap()));
    assert_eq!(f.lister.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn authorization_from_another_process_unlocks_on_next_poll() {
    let mut f = fixture(
        160,
        Duration::from_secs(3600),
        Duration::from_secs(1),
        Duration::from_secs(3600),
    );

    f.lister.set_attached(false);
    assert!(matches!(
        f.service.step().await,
        Some(Transition::Locked { .. })
    ));

    // The operator CLI opens the same store with its own registry.
    let operator = Registry::load(f._dir.path().join("allowed_serials.json"));
    assert!(operator.merge([DeviceId::new("unrelated-0").unwrap()]));

    assert_eq!(f.service.step().await, Some(Transition::Unlocked));
    assert!(f
        .service
        .controller()
        .registry()
        .contains(&DeviceId::new("UNRELATED0").unwrap()));

    let persisted = Registry::load(f._dir.path().join("allowed_serials.json")).snapshot();
    assert_eq!(
        persisted,
        vec![
            DeviceId::new("KEY0001").unwrap(),
            DeviceId::new("UNRELATED0").unwrap()
        ]
    );
    assert_eq!(
        drain(&mut f.events),
        vec![PresentationEvent::Show { initial: 160 }, PresentationEvent::Hide]
    );
}
