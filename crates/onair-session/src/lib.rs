//! Live-broadcast presence and session lifecycle.
//!
//! - [`bootstrap::go_live`] creates a broadcast and starts its [`HostSession`].
//! - [`ViewerPresence`] registers one viewer while they watch.
//! - [`BroadcastWatcher`] follows the record and leaves once it ends or vanishes.
//! - [`ViewerSession`] wires the last two together.
//!
//! All coordination between clients goes through an
//! [`onair_store::PresenceStore`]; each client only guards its own actions
//! with local latches.

pub mod bootstrap;
pub mod error;
pub mod host;
pub mod join;
pub mod latch;
pub mod loopback;
pub mod signal;
pub mod transport;
pub mod viewer;
pub mod watcher;

pub use bootstrap::go_live;
pub use error::{SessionError, TransportError};
pub use host::{EndTrigger, HostPhase, HostSession};
pub use join::ViewerSession;
pub use latch::{Latch, PresenceLatch};
pub use loopback::LoopbackTransport;
pub use signal::process_unload_signal;
pub use transport::{JoinRequest, MediaTransport, TransportHandle, TransportSession};
pub use viewer::{LeaveReason, ViewerPresence};
pub use watcher::{BroadcastWatcher, GoneReason, LeaveAction, WatchState};
