//! Wire format shared by the `roma` host library and the `roma-worker`
//! sandbox process.
//!
//! Both sides of the sandbox boundary link this crate: the parent to frame
//! requests onto each worker's socketpair, the child to read them back. The
//! types here are the *only* thing that crosses the process boundary — no
//! pointers, no handles, no shared state beyond the optional shared-memory
//! region used to carry large payloads out of band.

#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod frame;
mod shm;
mod wire;

pub use frame::{Channel, ChannelError, Side, INLINE_FRAME_MAX};
pub use shm::SharedRegion;
pub use wire::{
    CodeSpec, ExecuteSpec, ExecutionStats, FunctionBindingIo, Payload, Reply, Request, RpcWrapper,
    WireError, WireErrorKind, WorkerInit, BINDING_UNAVAILABLE_ERROR, LOG_FUNCTION_NAME,
};
