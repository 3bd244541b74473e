//! This crate executes untrusted JavaScript handlers inside isolated worker
//! processes on behalf of a trusted host.
//!
//! The host embeds [`RomaService`]: it registers code versions through
//! [`RomaService::load_code_obj`], then dispatches invocations naming a
//! version and a handler through [`RomaService::execute`]. Results flow
//! back asynchronously through completion callbacks. Guest code can call
//! back into host-registered functions by name; those callbacks cross the
//! sandbox boundary as typed RPC frames, never as pointers.
//!
//! Two guarantees hold throughout: malicious guest code cannot escape its
//! worker process, and the host is never blocked by a slow or looping
//! guest — every invocation carries a wall-clock deadline enforced inside
//! the worker, with a parent-side stall backstop behind it.

#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod config;
mod error;
mod key_cache;
mod logging;
mod metadata_storage;
mod metrics;
mod objects;
mod service;

/// Host-registered functions callable from sandboxed code.
pub mod native_function;
/// Worker process façades and the dispatcher that schedules across them.
pub mod sandbox;

pub use config::{Config, DefaultMetadata};
pub use error::{Result, RomaError};
pub use key_cache::{EncryptedPrivateKey, PrivateKey, PrivateKeyCache, PrivateKeySource};
pub use logging::{ConsentedLogger, LogRecord, LogSeverity, LogSink, TracingLogSink};
pub use metadata_storage::{MetadataStorage, ReaderError, RequestEntry, ScopedReader};
pub use objects::{
    CodeObject, ExecutionMetrics, InvocationRequest, RequestLogContext, ResponseObject,
};
pub use service::RomaService;

/// The wire-level payload union and callback record, re-exported for
/// function-binding handlers.
pub use roma_common::{FunctionBindingIo, Payload, RpcWrapper};
/// Wire specs, re-exported for code driving [`sandbox::Dispatcher`] or
/// [`sandbox::WorkerSandbox`] directly.
pub use roma_common::{CodeSpec, ExecuteSpec};
/// The framed channel type, re-exported for wiring callback listeners to
/// hand-built worker pools.
pub use roma_common::{Channel, Side};
