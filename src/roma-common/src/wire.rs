//! Message types carried over a worker channel.
//!
//! Every frame is one of two shapes: a control frame ([`Request`] /
//! [`Reply`]) on the worker's main channel, or an [`RpcWrapper`] on the
//! callback channel. Both directions of the callback channel carry the same
//! wrapper; the parent annotates `io.errors` before echoing it back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved function name used by the guest's console bridge.
///
/// Callbacks carrying this name are routed to the consented-logging sink on
/// the parent side and never reach host-registered bindings.
pub const LOG_FUNCTION_NAME: &str = "ROMA_LOG";

/// Message thrown into the guest when a callback round trip itself failed
/// (as opposed to the parent answering with errors). Both sides match on
/// this text, so it lives with the wire contract.
pub const BINDING_UNAVAILABLE_ERROR: &str = "Could not run the native function binding.";

/// The tagged union of values a host callback can receive or return.
///
/// These are the only shapes that cross the sandbox boundary; anything else
/// the guest passes to a binding stub is rejected on the child side before
/// a frame is ever produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A single UTF-8 string.
    Str(String),
    /// An ordered list of strings.
    StrList(Vec<String>),
    /// A map of string keys to string values.
    StrMap(BTreeMap<String, String>),
    /// An opaque byte buffer (a `Uint8Array` on the guest side).
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

/// The in/out halves of one host-callback round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionBindingIo {
    /// Value the guest passed to the binding stub, if any.
    pub input: Option<Payload>,
    /// Value the host handler produced, if any. Absent maps to `undefined`
    /// in the guest.
    pub output: Option<Payload>,
    /// Errors appended by the parent when the call could not be completed.
    /// Non-empty errors make the guest-side stub throw.
    pub errors: Vec<String>,
}

/// One host-callback round trip, correlated to the invocation that issued it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcWrapper {
    /// Name of the host binding the guest called.
    pub function_name: String,
    /// Id of the invocation executing on the originating worker.
    pub request_id: String,
    /// Uuid of the invocation executing on the originating worker. Used to
    /// resolve the request's metadata on the parent side.
    pub request_uuid: String,
    /// The payload of the call.
    pub io: FunctionBindingIo,
}

/// Startup configuration handed to a freshly spawned worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Host binding names to install as stubs on the guest's global object.
    pub binding_names: Vec<String>,
    /// Engine heap size at which garbage collection starts, in MiB.
    /// Zero leaves the engine default in place.
    pub initial_heap_mb: u32,
    /// Hard engine heap cap in MiB. Zero means uncapped.
    pub maximum_heap_mb: u32,
    /// Cap on loadable module byte-code, in 64 KiB pages. Zero means
    /// uncapped.
    pub max_wasm_pages: u32,
}

/// One version of guest code, shipped to a worker for compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeSpec {
    /// Host-assigned identifier, echoed in replies.
    pub id: String,
    /// Label selecting this code at invocation time.
    pub version_string: String,
    /// Script source.
    pub js: String,
    /// Optional precompiled module byte-code.
    #[serde(default, with = "opt_base64_bytes")]
    pub bytecode: Option<Vec<u8>>,
    /// Handler names that must resolve after evaluation; the load fails if
    /// any is missing.
    pub precompile_handlers: Vec<String>,
}

/// One invocation, shipped to the worker that will run it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteSpec {
    /// Host-assigned request id.
    pub request_id: String,
    /// Globally unique request uuid; stamped into callback wrappers.
    pub request_uuid: String,
    /// Which loaded version to execute.
    pub version_string: String,
    /// Name of the handler function to call.
    pub handler_name: String,
    /// JSON-serialized arguments, one per handler parameter.
    pub inputs: Vec<String>,
    /// Wall-clock budget for this call in milliseconds.
    pub deadline_ms: u64,
}

/// Frames the parent sends on a worker's main channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Startup configuration; must be the first frame after spawn.
    Init(WorkerInit),
    /// Compile and cache a code version.
    LoadCode(CodeSpec),
    /// Run a handler of a previously loaded version.
    Execute(ExecuteSpec),
    /// Tear down the engine and exit the process.
    Shutdown,
}

/// Frames the worker sends back on its main channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Response to [`Request::Init`].
    InitDone {
        /// Set when engine initialization failed.
        error: Option<WireError>,
    },
    /// Response to [`Request::LoadCode`].
    CodeLoaded {
        /// The version that was loaded (or failed to load).
        version_string: String,
        /// Set when compilation or handler pre-validation failed.
        error: Option<WireError>,
    },
    /// Response to [`Request::Execute`].
    Executed {
        /// JSON-serialized handler return value on success.
        response: Option<String>,
        /// Statistics for the execution attempt.
        stats: ExecutionStats,
        /// Set when the execution failed.
        error: Option<WireError>,
    },
    /// Acknowledgement of [`Request::Shutdown`]; the process exits right
    /// after sending it.
    ShuttingDown,
}

/// Statistics collected around one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Wall time spent inside the engine, in milliseconds.
    pub duration_ms: u64,
    /// Engine heap high-water mark observed for the call, in bytes.
    pub peak_memory_bytes: u64,
}

/// Error kinds a worker can report; the parent maps these onto the host
/// error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorKind {
    /// Source failed to compile or a pre-validated handler was missing.
    Compile,
    /// The guest threw; the message carries the stringified exception.
    Runtime,
    /// The engine heap cap was reached.
    OutOfMemory,
    /// The watchdog terminated the call.
    DeadlineExceeded,
    /// The requested version has not been loaded on this worker.
    UnknownVersion,
    /// A payload did not fit the shared buffer.
    PayloadTooLarge,
    /// The isolate was lost and could not be recreated; the worker cannot
    /// serve any further requests and must be replaced.
    Fatal,
    /// Anything else; not expected during normal operation.
    Internal,
}

/// An error crossing the sandbox boundary as part of a [`Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Classification used by the parent to pick the host error kind.
    pub kind: WireErrorKind,
    /// Human-readable detail (engine diagnostic, exception text, ...).
    pub message: String,
}

impl WireError {
    /// Build an error of `kind` with the given message.
    pub fn new(kind: WireErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod opt_base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::base64_bytes::serialize(bytes, ser),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(de)?;
        encoded
            .map(|encoded| {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
