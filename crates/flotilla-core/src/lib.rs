//! Domain model shared by the flotilla store and engine.

pub mod agents;
pub mod checkpoints;
pub mod clock;
pub mod errors;
pub mod events;
pub mod ids;
pub mod locks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::ValidationError;
