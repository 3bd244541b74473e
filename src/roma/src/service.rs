//! The embeddable runtime: the host-facing library surface.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roma_common::{Channel, Side};
use tracing::{instrument, Level};

use crate::config::Config;
use crate::error::{Result, RomaError};
use crate::logging::{ConsentedLogger, TracingLogSink};
use crate::metadata_storage::{MetadataStorage, RequestEntry};
use crate::metrics::METRIC_ACTIVE_WORKERS;
use crate::native_function::handler::NativeFunctionHandler;
use crate::native_function::table::NativeFunctionTable;
use crate::objects::{CodeObject, InvocationRequest, ResponseObject};
use crate::sandbox::dispatcher::Dispatcher;
use crate::sandbox::worker::{default_worker_binary, WorkerOptions, WorkerSandbox};

/// A running multi-tenant execution runtime.
///
/// Owns the worker pool, the dispatcher, the native-function listener pool,
/// and the per-request metadata store. All entry points return immediately;
/// results arrive through the supplied completion callbacks, which run on
/// the consumer thread of the worker that served the request.
pub struct RomaService<M: Send + Sync + 'static = crate::config::DefaultMetadata> {
    dispatcher: Dispatcher,
    handler: Arc<NativeFunctionHandler<M>>,
    storage: Arc<MetadataStorage<M>>,
    stopped: AtomicBool,
}

impl<M: Send + Sync + 'static> RomaService<M> {
    /// Bring up the runtime: spawn the worker pool, start the listener and
    /// consumer threads.
    #[instrument(err(Debug), skip_all, level = Level::INFO, fields(version = env!("CARGO_PKG_VERSION")))]
    pub fn new(config: Config<M>) -> Result<Self> {
        if config.number_of_workers == 0 {
            return Err(RomaError::InvalidArgument(
                "number_of_workers must be greater than zero".to_string(),
            ));
        }
        if config.max_pending_requests == 0 {
            return Err(RomaError::InvalidArgument(
                "max_pending_requests must be greater than zero".to_string(),
            ));
        }

        let sink = config
            .log_sink
            .unwrap_or_else(|| Arc::new(TracingLogSink));
        let logger = Arc::new(ConsentedLogger::new(config.server_token, sink)?);
        let table = Arc::new(NativeFunctionTable::new(config.function_bindings));
        let storage = Arc::new(MetadataStorage::new());
        let handler = Arc::new(NativeFunctionHandler::new(
            Arc::clone(&table),
            Arc::clone(&storage),
            logger,
        ));

        let worker_binary = match config.worker_binary {
            Some(path) => path,
            None => default_worker_binary()?,
        };
        let options = WorkerOptions {
            worker_binary,
            max_virtual_memory_mb: config.worker_virtual_memory_mb,
            engine_initial_heap_mb: config.engine_initial_heap_mb,
            engine_maximum_heap_mb: config.engine_maximum_heap_mb,
            engine_max_wasm_pages: config.engine_max_wasm_pages,
            shared_buffer_mb: config.shared_buffer_mb,
            shared_buffer_only: config.shared_buffer_only,
            binding_names: table.names(),
        };

        let workers = match spawn_pool(&options, config.number_of_workers, &handler) {
            Ok(workers) => workers,
            Err(err) => {
                // Dropping half-spawned workers kills their children; the
                // listener threads still need explicit shutdown.
                handler.stop();
                return Err(err);
            }
        };
        metrics::gauge!(METRIC_ACTIVE_WORKERS).set(config.number_of_workers as f64);

        Ok(Self {
            dispatcher: Dispatcher::new(workers, config.max_pending_requests),
            handler,
            storage,
            stopped: AtomicBool::new(false),
        })
    }

    /// Install a code version on every worker.
    ///
    /// `on_complete` fires once all workers acknowledged the load (or with
    /// the first failure once all have answered). Invocations against the
    /// version are valid as soon as the callback reports success.
    #[instrument(skip(self, code, on_complete), level = Level::DEBUG, fields(version = %code.version_string))]
    pub fn load_code_obj(
        &self,
        code: CodeObject,
        on_complete: impl FnOnce(Result<ResponseObject>) + Send + 'static,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RomaError::Shutdown);
        }
        if code.version_string.is_empty() {
            return Err(RomaError::InvalidArgument(
                "version_string must not be empty".to_string(),
            ));
        }
        if code.js.is_empty() && code.bytecode.is_none() {
            return Err(RomaError::InvalidArgument(
                "code object carries neither source nor byte-code".to_string(),
            ));
        }
        self.dispatcher.load(code.to_spec(), on_complete)
    }

    /// Queue one invocation.
    ///
    /// Returns immediately with accepted ([`Ok`]) or rejected; the result
    /// is delivered through `on_complete`. The request's metadata is held
    /// for callbacks until the completion fires.
    #[instrument(skip(self, request, on_complete), level = Level::DEBUG, fields(uuid = %request.uuid))]
    pub fn execute(
        &self,
        request: InvocationRequest<M>,
        on_complete: impl FnOnce(Result<ResponseObject>) + Send + 'static,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RomaError::Shutdown);
        }
        if request.version_string.is_empty() || request.handler_name.is_empty() {
            return Err(RomaError::InvalidArgument(
                "version_string and handler_name must not be empty".to_string(),
            ));
        }

        let spec = request.to_spec();
        let uuid = spec.request_uuid.clone();
        let entry = RequestEntry {
            metadata: request.metadata,
            log_context: request.log_context,
        };
        if !self.storage.insert(&uuid, entry) {
            return Err(RomaError::InvalidArgument(format!(
                "request uuid {uuid} is already in flight"
            )));
        }

        let storage = Arc::clone(&self.storage);
        let callback_uuid = uuid.clone();
        let wrapped = move |result: Result<ResponseObject>| {
            // The entry outlives the last callback for this request: remove
            // blocks on any scoped reader still running.
            storage.remove(&callback_uuid);
            on_complete(result);
        };

        match self.dispatcher.invoke(spec, wrapped) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Rejected before dispatch: the wrapped callback never ran.
                self.storage.remove(&uuid);
                Err(err)
            }
        }
    }

    /// Number of requests currently in flight or queued.
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.pending_requests()
    }

    /// Tear everything down: stop the workers, the consumer threads, and
    /// the native-function listeners. Queued requests fail with
    /// [`RomaError::Shutdown`]. Idempotent.
    #[instrument(skip_all, level = Level::INFO)]
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.dispatcher.stop();
        self.handler.stop();
        metrics::gauge!(METRIC_ACTIVE_WORKERS).set(0.0);
        Ok(())
    }
}

impl<M: Send + Sync + 'static> Drop for RomaService<M> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Spawn the pool: one callback socketpair and one worker per slot. The
/// worker-side end of each pair is retained by the listener pool so it
/// survives worker replacement.
fn spawn_pool<M: Send + Sync + 'static>(
    options: &WorkerOptions,
    count: usize,
    handler: &NativeFunctionHandler<M>,
) -> Result<Vec<WorkerSandbox>> {
    let mut workers = Vec::with_capacity(count);
    for _ in 0..count {
        let (rpc_local, rpc_remote) = UnixStream::pair()
            .map_err(|err| RomaError::Internal(format!("socketpair failed: {err}")))?;
        let remote_for_sentinel = rpc_remote
            .try_clone()
            .map_err(|err| RomaError::Internal(format!("fd clone failed: {err}")))?;
        handler
            .attach(Channel::new(rpc_local, Side::Parent), remote_for_sentinel)
            .map_err(|err| RomaError::Internal(format!("listener spawn failed: {err}")))?;

        let mut worker = WorkerSandbox::new(options.clone(), rpc_remote);
        worker.init()?;
        worker.run()?;
        workers.push(worker);
    }
    Ok(workers)
}
