//! The sandboxed execution pipeline: worker process façades and the
//! dispatcher that schedules work across them.

pub(crate) mod dispatcher;
pub(crate) mod worker;

pub use dispatcher::{CompletionCallback, Dispatcher};
pub use worker::{default_worker_binary, WorkerOptions, WorkerSandbox};
