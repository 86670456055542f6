//! Cross-context USB device-session coordinator
//!
//! Several execution contexts of one origin (a page, its dedicated workers,
//! ports of its shared workers) use the same physical USB devices. The
//! coordinator keeps one consistent view of which device is connected, open
//! and interface-claimed, makes interface ownership exclusive, and serializes
//! transfers from concurrent contexts onto each device's single channel.
//!
//! ```no_run
//! use coordinator::backend::LoopbackBackend;
//! use coordinator::config::CoordinatorConfig;
//! use coordinator::Coordinator;
//! use protocol::SessionKind;
//! use std::sync::Arc;
//!
//! let coordinator = Coordinator::new(
//!     &CoordinatorConfig::default(),
//!     Arc::new(LoopbackBackend::new()),
//! );
//! let page = coordinator.create_session(SessionKind::Window);
//! let devices = page.devices().unwrap();
//! assert!(devices.is_empty());
//! ```

pub mod arbiter;
pub mod backend;
pub mod broadcaster;
pub mod capability;
pub mod config;
pub mod coordinator;
mod dispatch;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use arbiter::ClaimArbiter;
pub use broadcaster::{EventBroadcaster, EventStream};
pub use coordinator::Coordinator;
pub use registry::DeviceRegistry;
pub use scheduler::{CancelOutcome, TransferFuture, TransferResult, TransferScheduler};
pub use session::ContextSession;
