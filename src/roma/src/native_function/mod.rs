//! Host-registered functions callable from sandboxed code.
//!
//! The guest sees a stub; the stub produces an [`roma_common::RpcWrapper`]
//! on the worker's callback channel; the listener pool here resolves the
//! request's metadata, invokes the registered handler, and echoes the
//! wrapper back with any errors appended. No pointer ever crosses the
//! process boundary — the function name in the wrapper is the only link
//! between the two sides.

pub(crate) mod handler;
pub(crate) mod table;

pub use handler::{
    NativeFunctionHandler, ERR_FUNCTION_NOT_FOUND, ERR_HANDLER_EXECUTION_FAILED,
    ERR_METADATA_MUTEX_NOT_FOUND, ERR_METADATA_NOT_FOUND,
};
pub use table::{BindingHandler, FunctionBinding, NativeFunctionTable, TableCallError};
