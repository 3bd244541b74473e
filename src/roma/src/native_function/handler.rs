//! The parent-side listener pool for host callbacks.
//!
//! One listener thread per worker callback channel. Each loops on `recv`,
//! resolves the calling request's metadata through a scoped reader, runs
//! the registered handler, and sends the (possibly error-annotated) wrapper
//! back. Because each channel has exactly one single-threaded listener,
//! replies go back in the order the worker's calls arrived.
//!
//! Listeners survive worker replacement: the parent keeps the worker-side
//! end of each callback socketpair open and hands the same fd to every
//! respawned child, so the channel — and its listener — outlive any single
//! worker process.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use roma_common::{Channel, ChannelError, Payload, RpcWrapper, LOG_FUNCTION_NAME};
use tracing::instrument;

use super::table::{NativeFunctionTable, TableCallError};
use crate::logging::{ConsentedLogger, LogSeverity};
use crate::metadata_storage::{MetadataStorage, ReaderError};

/// Reported when a callback names no function, or names one the table does
/// not know.
pub const ERR_FUNCTION_NOT_FOUND: &str = "Could not find C++ function by name.";
/// Reported when no metadata lock exists for the callback's request uuid.
pub const ERR_METADATA_MUTEX_NOT_FOUND: &str =
    "Could not find mutex for metadata associated with C++ function.";
/// Reported when the metadata lock exists but the entry is already gone.
pub const ERR_METADATA_NOT_FOUND: &str = "Could not find metadata associated with C++ function.";
/// Reported when the registered handler ran and failed.
pub const ERR_HANDLER_EXECUTION_FAILED: &str = "Failed to execute the C++ function.";

struct Listener {
    thread: JoinHandle<()>,
    /// The worker-side end of the channel; used to write the shutdown
    /// sentinel that unblocks the listener's `recv`.
    remote: UnixStream,
}

/// Multiplexes callback RPCs from all workers onto the function table.
pub struct NativeFunctionHandler<M> {
    table: Arc<NativeFunctionTable<M>>,
    storage: Arc<MetadataStorage<M>>,
    logger: Arc<ConsentedLogger>,
    stop: Arc<AtomicBool>,
    listeners: Mutex<Vec<Listener>>,
}

impl<M: Send + Sync + 'static> NativeFunctionHandler<M> {
    /// Build the handler over the shared table, storage, and log sink.
    pub fn new(
        table: Arc<NativeFunctionTable<M>>,
        storage: Arc<MetadataStorage<M>>,
        logger: Arc<ConsentedLogger>,
    ) -> Self {
        Self {
            table,
            storage,
            logger,
            stop: Arc::new(AtomicBool::new(false)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a listener for one worker's callback channel.
    ///
    /// `remote` is the worker-side end of the same socketpair; the handler
    /// keeps it to unblock the listener at shutdown (and so the channel
    /// survives worker replacement).
    #[instrument(skip_all, level = "debug")]
    pub fn attach(&self, mut channel: Channel, remote: UnixStream) -> std::io::Result<()> {
        let table = Arc::clone(&self.table);
        let storage = Arc::clone(&self.storage);
        let logger = Arc::clone(&self.logger);
        let stop = Arc::clone(&self.stop);

        let thread = std::thread::Builder::new()
            .name("roma-native-fn".to_string())
            .spawn(move || {
                loop {
                    let wrapper = match channel.recv::<RpcWrapper>() {
                        Ok(wrapper) => wrapper,
                        Err(ChannelError::Disconnected) => break,
                        // The frame was consumed whole; the stream is still
                        // aligned, so a malformed record is survivable.
                        Err(ChannelError::Codec(err)) => {
                            tracing::warn!(%err, "dropping malformed callback frame");
                            continue;
                        }
                        Err(err) => {
                            tracing::warn!(%err, "callback channel receive failed");
                            break;
                        }
                    };
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }

                    let reply = dispatch(&table, &storage, &logger, wrapper);

                    if let Err(err) = channel.send(&reply) {
                        tracing::warn!(%err, "callback reply send failed");
                        continue;
                    }
                }
            })?;

        self.listeners.lock().push(Listener { thread, remote });
        Ok(())
    }

    /// Stop all listeners: set the stop flag, write one sentinel frame to
    /// the worker-side end of each channel to unblock its `recv`, join.
    #[instrument(skip_all, level = "info")]
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);

        let mut listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            match listener.remote.try_clone() {
                Ok(stream) => {
                    let mut sentinel = Channel::new(stream, roma_common::Side::Child);
                    if let Err(err) = sentinel.send(&RpcWrapper::default()) {
                        tracing::debug!(%err, "sentinel write failed, listener may be gone");
                    }
                }
                Err(err) => tracing::debug!(%err, "could not clone remote end for sentinel"),
            }
        }
        for listener in listeners.drain(..) {
            let _ = listener.thread.join();
        }
    }
}

/// Process one callback wrapper and produce the reply to echo back.
///
/// All failures are non-fatal to the worker: they surface as entries in the
/// wrapper's error list, which the guest-side stub turns into a thrown
/// exception.
fn dispatch<M>(
    table: &NativeFunctionTable<M>,
    storage: &MetadataStorage<M>,
    logger: &ConsentedLogger,
    mut wrapper: RpcWrapper,
) -> RpcWrapper {
    if wrapper.function_name.is_empty() {
        wrapper.io.errors.push(ERR_FUNCTION_NOT_FOUND.to_string());
        tracing::debug!("{ERR_FUNCTION_NOT_FOUND}");
        return wrapper;
    }

    if wrapper.function_name == LOG_FUNCTION_NAME {
        forward_log_record(storage, logger, &wrapper);
        // Best-effort: the guest never observes a logging failure.
        return wrapper;
    }

    match storage.reader(&wrapper.request_uuid) {
        Err(ReaderError::NotFound) => {
            wrapper.io.errors.push(ERR_METADATA_MUTEX_NOT_FOUND.to_string());
            tracing::debug!("{ERR_METADATA_MUTEX_NOT_FOUND}");
        }
        Err(ReaderError::Empty) => {
            wrapper.io.errors.push(ERR_METADATA_NOT_FOUND.to_string());
            tracing::debug!("{ERR_METADATA_NOT_FOUND}");
        }
        Ok(reader) => {
            match table.call(
                &wrapper.function_name,
                &mut wrapper.io,
                &reader.entry().metadata,
            ) {
                Ok(()) => {}
                Err(TableCallError::UnknownName) => {
                    wrapper.io.errors.push(ERR_FUNCTION_NOT_FOUND.to_string());
                    tracing::debug!(function = %wrapper.function_name, "{ERR_FUNCTION_NOT_FOUND}");
                }
                Err(TableCallError::HandlerFailure) => {
                    wrapper.io.errors.push(ERR_HANDLER_EXECUTION_FAILED.to_string());
                    tracing::debug!(function = %wrapper.function_name, "{ERR_HANDLER_EXECUTION_FAILED}");
                }
            }
        }
    }
    wrapper
}

/// Route a console-bridge record to the consented sink, tagged with the
/// request's context. Unresolvable or malformed records are dropped.
fn forward_log_record<M>(
    storage: &MetadataStorage<M>,
    logger: &ConsentedLogger,
    wrapper: &RpcWrapper,
) {
    let Some(Payload::StrList(parts)) = &wrapper.io.input else {
        tracing::trace!("dropping malformed console record");
        return;
    };
    let [severity, message] = parts.as_slice() else {
        tracing::trace!("dropping malformed console record");
        return;
    };
    let Ok(reader) = storage.reader(&wrapper.request_uuid) else {
        tracing::trace!(uuid = %wrapper.request_uuid, "dropping console record without metadata");
        return;
    };
    logger.emit(
        &wrapper.request_uuid,
        &reader.entry().log_context,
        LogSeverity::from_tag(severity),
        message,
    );
}
