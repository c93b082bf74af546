//! Driver layer: in-process HAL, uniform-error façade and queue wrapper.

pub mod facade;
pub mod hal;
pub mod queue;

pub use facade::Driver;
pub use hal::{DevId, EventId, EventInfo, EventPayload, GroupId, Hal, QueueId};
pub use queue::QueueWrapper;
