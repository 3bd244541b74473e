//! The sandboxed side of the roma execution runtime.
//!
//! One process hosts one QuickJS isolate. The parent talks to it over two
//! framed channels: the main channel carries load/execute control frames,
//! the callback channel carries [`roma_common::RpcWrapper`] round trips
//! issued while guest code is running (host bindings and the console
//! bridge).
//!
//! Guest execution is single-threaded and cooperative; the only other
//! thread in the process is the [`watchdog::Watchdog`], which exists solely
//! to flip the engine's interrupt flag when a deadline expires.

mod convert;
mod engine;
pub mod service;
mod watchdog;

pub use engine::{EngineOptions, ExecutionOutcome, JsEngine};
pub use watchdog::Watchdog;

use roma_common::RpcWrapper;

/// Transport used by binding stubs and the console bridge to reach the
/// parent process.
///
/// The engine is written against this trait rather than a concrete channel
/// so it can run without a parent (the standalone CLI, tests). `invoke`
/// fills the wrapper's `io.output` and `io.errors` in place.
pub trait HostCallInvoker {
    /// Perform one synchronous callback round trip.
    fn invoke(&self, wrapper: &mut RpcWrapper) -> anyhow::Result<()>;
}
