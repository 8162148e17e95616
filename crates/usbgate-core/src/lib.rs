//! Core building blocks for the usbgate device-presence gate.
//!
//! The registry, remote synchronizer and lock controller live here so the
//! daemon and CLI only wire collaborators together.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod lister;
pub mod logging;
pub mod presentation;
pub mod registry;
pub mod remote;
pub mod service;
pub mod shutdown;

pub use config::{
    LockCfg, PollCfg, RegistryCfg, RemoteCfg, ShutdownCfg, StatusCfg, UsbgateConfig,
};
pub use controller::{
    CountdownStep, GateStatus, LockController, LockMachine, SessionId, Transition,
};
pub use device::DeviceId;
pub use error::{GateError, GateResult};
pub use lister::{DeviceLister, NullLister};
pub use presentation::{ChannelPresenter, PresentationEvent, Presenter, ScreenState};
pub use registry::Registry;
pub use remote::RemoteSynchronizer;
pub use service::{periodic_sync, GateService};
pub use shutdown::{CommandShutdown, ShutdownAction};
