//! The worker's request loop.
//!
//! Drives the engine off the main channel: the first frame must be `Init`,
//! after which the loop alternates strictly between receiving one request
//! and sending one reply. The callback channel is handed to the engine's
//! binding stubs and used only from inside a running execution, so the two
//! channels never interleave.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use roma_common::{Channel, ChannelError, ExecutionStats, Reply, Request, RpcWrapper, WireError,
    WireErrorKind};
use tracing::instrument;

use crate::engine::JsEngine;
use crate::watchdog::Watchdog;
use crate::HostCallInvoker;

/// Budget for compiling and pre-validating one code version. Loads carry no
/// host-assigned deadline, but a hostile top-level script must not wedge
/// the worker either.
const LOAD_BUDGET: Duration = Duration::from_secs(10);

/// Deadline applied when an execute frame carries none.
const DEFAULT_EXECUTE_BUDGET: Duration = Duration::from_secs(5);

/// [`HostCallInvoker`] backed by the worker's callback channel.
///
/// The guest thread is the only caller, and each call is a strict
/// send-then-recv pair, so a `RefCell` is all the synchronization needed.
pub struct ChannelInvoker {
    channel: RefCell<Channel>,
}

impl ChannelInvoker {
    /// Wrap the callback channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: RefCell::new(channel),
        }
    }
}

impl HostCallInvoker for ChannelInvoker {
    fn invoke(&self, wrapper: &mut RpcWrapper) -> anyhow::Result<()> {
        let mut channel = self.channel.borrow_mut();
        channel.send(wrapper).context("sending callback frame")?;
        *wrapper = channel.recv().context("receiving callback reply")?;
        Ok(())
    }
}

/// Serve requests until the parent shuts the worker down or disappears.
#[instrument(skip_all, level = "info")]
pub fn serve(mut comms: Channel, rpc: Channel) -> anyhow::Result<()> {
    let init = match comms.recv::<Request>()? {
        Request::Init(init) => init,
        other => bail!("expected an init frame first, got {other:?}"),
    };

    let watchdog = Watchdog::spawn().context("starting the watchdog thread")?;
    let invoker = Rc::new(ChannelInvoker::new(rpc));

    let mut engine = match JsEngine::new(init.into(), invoker, watchdog.interrupt_flag()) {
        Ok(engine) => {
            comms.send(&Reply::InitDone { error: None })?;
            engine
        }
        Err(error) => {
            comms.send(&Reply::InitDone { error: Some(error) })?;
            bail!("engine initialization failed");
        }
    };

    loop {
        let request = match comms.recv::<Request>() {
            Ok(request) => request,
            Err(ChannelError::Disconnected) => {
                tracing::info!("parent closed the channel, exiting");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match request {
            Request::Init(_) => bail!("received a second init frame"),
            Request::LoadCode(spec) => {
                watchdog.arm(LOAD_BUDGET);
                let result = engine.load(&spec);
                let expired = watchdog.disarm();
                let error = result.err().map(|err| deadline_override(err, expired));
                comms.send(&Reply::CodeLoaded {
                    version_string: spec.version_string,
                    error,
                })?;
            }
            Request::Execute(spec) => {
                let budget = if spec.deadline_ms == 0 {
                    DEFAULT_EXECUTE_BUDGET
                } else {
                    Duration::from_millis(spec.deadline_ms)
                };
                watchdog.arm(budget);
                let started = Instant::now();
                let result = engine.run(&spec);
                let duration = started.elapsed();
                let expired = watchdog.disarm();

                let reply = match result {
                    Ok(outcome) => Reply::Executed {
                        response: Some(outcome.response),
                        stats: ExecutionStats {
                            duration_ms: duration.as_millis() as u64,
                            peak_memory_bytes: outcome.peak_memory_bytes,
                        },
                        error: None,
                    },
                    Err(err) => Reply::Executed {
                        response: None,
                        stats: ExecutionStats {
                            duration_ms: duration.as_millis() as u64,
                            peak_memory_bytes: 0,
                        },
                        error: Some(deadline_override(err, expired)),
                    },
                };
                comms.send(&reply)?;
            }
            Request::Shutdown => {
                comms.send(&Reply::ShuttingDown)?;
                tracing::info!("shutdown acknowledged, exiting");
                return Ok(());
            }
        }
    }
}

/// The watchdog's verdict wins over whatever error the unwind produced,
/// except a fatal one: losing the isolate must reach the parent so the
/// worker gets replaced.
fn deadline_override(err: WireError, expired: bool) -> WireError {
    if expired && !matches!(err.kind, WireErrorKind::DeadlineExceeded | WireErrorKind::Fatal) {
        WireError::new(
            WireErrorKind::DeadlineExceeded,
            "execution terminated: wall-clock deadline exceeded",
        )
    } else {
        err
    }
}
