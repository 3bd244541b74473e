//! Runtime configuration.

use std::path::PathBuf;
use std::sync::Arc;

use roma_common::FunctionBindingIo;

use crate::logging::LogSink;
use crate::native_function::table::FunctionBinding;

/// The default host metadata type: a string map.
pub type DefaultMetadata = std::collections::HashMap<String, String>;

/// Configuration for [`crate::RomaService::new`].
///
/// Generic over the host metadata type `M` carried by invocation requests
/// and handed to function-binding handlers.
pub struct Config<M = DefaultMetadata> {
    /// Size of the worker pool. Must be greater than zero.
    pub number_of_workers: usize,
    /// Admission cap: in-flight plus queued requests never exceed this.
    pub max_pending_requests: usize,
    /// Address-space cap per worker process in MiB (0 = unlimited).
    pub worker_virtual_memory_mb: u32,
    /// Engine heap size at which garbage collection starts, in MiB.
    pub engine_initial_heap_mb: u32,
    /// Hard engine heap cap per worker in MiB (0 = uncapped).
    pub engine_maximum_heap_mb: u32,
    /// Cap on loadable module byte-code, in 64 KiB pages (0 = uncapped).
    pub engine_max_wasm_pages: u32,
    /// Size of the shared payload region per worker in MiB (0 = disabled).
    pub shared_buffer_mb: u32,
    /// Route every payload through the shared region; oversized payloads
    /// fail instead of falling back to inline frames.
    pub shared_buffer_only: bool,
    /// Server consent token for guest logging. `None` or empty disables
    /// consented logging; non-empty tokens must be at least six characters.
    pub server_token: Option<String>,
    /// Worker binary to spawn. Defaults to `roma-worker` next to the
    /// current executable, or the `ROMA_WORKER_PATH` environment variable.
    pub worker_binary: Option<PathBuf>,
    /// Destination for consented guest log records. Defaults to a sink that
    /// forwards to `tracing`.
    pub log_sink: Option<Arc<dyn LogSink>>,
    /// Host functions callable from guest code, registered via
    /// [`Config::register_function_binding`].
    pub function_bindings: Vec<FunctionBinding<M>>,
}

impl<M> Default for Config<M> {
    fn default() -> Self {
        Self {
            number_of_workers: 1,
            max_pending_requests: 100,
            worker_virtual_memory_mb: 0,
            engine_initial_heap_mb: 0,
            engine_maximum_heap_mb: 0,
            engine_max_wasm_pages: 0,
            shared_buffer_mb: 0,
            shared_buffer_only: false,
            server_token: None,
            worker_binary: None,
            log_sink: None,
            function_bindings: Vec::new(),
        }
    }
}

impl<M> Config<M> {
    /// Register a host function callable from guest code.
    ///
    /// The handler reads the callback's input payload, writes its output
    /// payload (or appends errors), and sees the invoking request's
    /// metadata. Registering the same name twice keeps the later handler.
    pub fn register_function_binding(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut FunctionBindingIo, &M) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.function_bindings.push(FunctionBinding {
            name: name.into(),
            handler: Arc::new(handler),
        });
        self
    }
}

impl<M> std::fmt::Debug for Config<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("number_of_workers", &self.number_of_workers)
            .field("max_pending_requests", &self.max_pending_requests)
            .field("worker_virtual_memory_mb", &self.worker_virtual_memory_mb)
            .field("engine_initial_heap_mb", &self.engine_initial_heap_mb)
            .field("engine_maximum_heap_mb", &self.engine_maximum_heap_mb)
            .field("engine_max_wasm_pages", &self.engine_max_wasm_pages)
            .field("shared_buffer_mb", &self.shared_buffer_mb)
            .field("shared_buffer_only", &self.shared_buffer_only)
            .field(
                "function_bindings",
                &self
                    .function_bindings
                    .iter()
                    .map(|binding| binding.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
