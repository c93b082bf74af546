//! # Flow-function executor
//!
//! On-device runtime for a dataflow graph: each process hosts one or more
//! flow-function processors, each driving an operator that consumes tensor
//! messages from device-resident input queues and produces messages on
//! output queues. A small worker pool multiplexes the processors over a
//! kernel-style event bus; lifecycle commands (suspend, recover, exception
//! forwarding) arrive from the host deployer on a request queue and are
//! answered on a response queue.
//!
//! ## Layout
//! - `driver` — in-process HAL (queues, events, mbufs) plus the uniform
//!   error façade and the queue wrapper.
//! - `timer` — process-wide timer service with worker-dispatched and
//!   inline delivery.
//! - `flowfunc` — operator trait, context, registry and the two built-in
//!   stream batchers (count-batch, time-batch).
//! - `executor` — processors, the event loop and the control-message
//!   protocol.
//! - `manifest` / `wire` / `dump` — the file and wire formats the executor
//!   consumes.

pub mod driver;
pub mod dump;
pub mod error;
pub mod executor;
pub mod flowfunc;
pub mod manifest;
pub mod metrics;
pub mod msg;
pub mod timer;
pub mod wire;

pub use error::{FlowError, FlowResult};
pub use executor::{ExecutorConfig, FlowFuncExecutor};
pub use manifest::ModelManifest;
