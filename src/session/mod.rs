//! The realtime session engine: connection lifecycle, task supervision,
//! and the turn pipeline between the client and the backing services.

pub mod handler;
pub mod recorder;
pub mod registry;
pub mod supervisor;

pub use handler::run_session;
pub use recorder::EventRecorder;
pub use registry::SessionRegistry;
pub use supervisor::{TaskGroup, TaskWaiter};

use crate::events::ServerEvent;

/// Items flowing toward the client. The emit loop always drains explicit
/// events before polling the producers, and encodes PCM on the way out.
#[derive(Debug)]
pub enum OutboundItem {
    Event(ServerEvent),
    Pcm(Vec<i16>),
    /// Orderly transport close requested by the producer side.
    Close,
}
