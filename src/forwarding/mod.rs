//! Port Forwarding Module
//!
//! Local (-L), remote (-R) and dynamic SOCKS5 (-D) forwarding over SSH
//! sessions, plus the registry that owns forwarding records.
//! Designed for HPC/supercomputing workflows (Jupyter, TensorBoard, etc.)

mod bridge;
mod dynamic;
mod error;
mod events;
mod lifecycle;
mod local;
pub mod registry;
mod remote;
pub mod socks5;
mod stats;

pub use bridge::splice;
pub use dynamic::{start_dynamic_forward, DynamicForward, DynamicForwardHandle};
pub use error::ForwardError;
pub use events::{ForwardEvent, ForwardEventEmitter, ForwardEventKind};
pub use lifecycle::ForwardLifecycle;
pub use local::{start_local_forward, LocalForward, LocalForwardHandle};
pub use registry::{
    ForwardKey, ForwardOrigin, ForwardRequest, ForwardStatus, ForwardType, ForwardingRecord,
    ForwardingRegistry,
};
pub use remote::{start_remote_forward, RemoteForward, RemoteForwardHandle};
pub use stats::{ForwardStats, StatsCounters};
