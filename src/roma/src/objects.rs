//! The immutable records the host exchanges with the runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use roma_common::{CodeSpec, ExecuteSpec, ExecutionStats};
use uuid::Uuid;

/// One version of guest code.
///
/// Created by the host, installed through the load path, cached in every
/// worker until the worker terminates; never mutated.
#[derive(Debug, Clone, Default)]
pub struct CodeObject {
    /// Opaque host-assigned identifier, echoed in responses.
    pub id: String,
    /// Label invocations use to select this code.
    pub version_string: String,
    /// Script source.
    pub js: String,
    /// Optional precompiled module byte-code.
    pub bytecode: Option<Vec<u8>>,
    /// Handler names that must resolve once the code is evaluated; loading
    /// fails if any is missing.
    pub precompile_handlers: Vec<String>,
}

impl CodeObject {
    pub(crate) fn to_spec(&self) -> CodeSpec {
        CodeSpec {
            id: self.id.clone(),
            version_string: self.version_string.clone(),
            js: self.js.clone(),
            bytecode: self.bytecode.clone(),
            precompile_handlers: self.precompile_handlers.clone(),
        }
    }
}

/// Per-request logging inputs: the client's consent token and the context
/// fields stamped onto every record the request emits.
#[derive(Debug, Clone, Default)]
pub struct RequestLogContext {
    /// Consent token supplied by the client. Records are emitted only when
    /// this matches the server token configured on the runtime.
    pub client_token: Option<String>,
    /// Key/value pairs describing the request; empty values are skipped
    /// when the context is formatted.
    pub context: BTreeMap<String, String>,
}

/// One invocation of a loaded handler.
#[derive(Debug, Clone)]
pub struct InvocationRequest<M = crate::config::DefaultMetadata> {
    /// Host-assigned request id, echoed in the response.
    pub id: String,
    /// Globally unique id correlating callbacks with this request's
    /// metadata. At most one in-flight request may use a given uuid.
    pub uuid: Uuid,
    /// Which loaded [`CodeObject`] to execute.
    pub version_string: String,
    /// Name of the handler function to call.
    pub handler_name: String,
    /// JSON-serialized arguments, one per handler parameter.
    pub input: Vec<String>,
    /// Wall-clock budget for the call. `Duration::ZERO` applies the
    /// worker's default budget.
    pub execution_timeout: Duration,
    /// Host metadata, opaque to the runtime; visible to function-binding
    /// handlers for the lifetime of the request.
    pub metadata: M,
    /// Logging inputs for records emitted while this request runs.
    pub log_context: RequestLogContext,
}

impl<M: Default> Default for InvocationRequest<M> {
    fn default() -> Self {
        Self {
            id: String::new(),
            uuid: Uuid::new_v4(),
            version_string: String::new(),
            handler_name: String::new(),
            input: Vec::new(),
            execution_timeout: Duration::ZERO,
            metadata: M::default(),
            log_context: RequestLogContext::default(),
        }
    }
}

impl<M> InvocationRequest<M> {
    pub(crate) fn to_spec(&self) -> ExecuteSpec {
        ExecuteSpec {
            request_id: self.id.clone(),
            request_uuid: self.uuid.to_string(),
            version_string: self.version_string.clone(),
            handler_name: self.handler_name.clone(),
            inputs: self.input.clone(),
            deadline_ms: self.execution_timeout.as_millis() as u64,
        }
    }
}

/// Statistics attached to every successful response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionMetrics {
    /// Wall time the engine spent on the call.
    pub duration: Duration,
    /// Engine heap high-water mark in bytes.
    pub peak_memory_bytes: u64,
}

impl From<ExecutionStats> for ExecutionMetrics {
    fn from(stats: ExecutionStats) -> Self {
        Self {
            duration: Duration::from_millis(stats.duration_ms),
            peak_memory_bytes: stats.peak_memory_bytes,
        }
    }
}

/// The successful result of a load or invocation.
#[derive(Debug, Clone, Default)]
pub struct ResponseObject {
    /// The id of the request this responds to.
    pub id: String,
    /// JSON-serialized handler return value; empty for load responses.
    pub resp: String,
    /// Execution statistics; zeroed for load responses.
    pub metrics: ExecutionMetrics,
}
