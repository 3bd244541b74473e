//! Parent-side façade over one sandboxed worker process.
//!
//! Owns the child process and its main channel, enforces the configured
//! resource limits at spawn time, and converts wire errors into the host
//! taxonomy. One invocation at a time: both `load` and `invoke` are
//! synchronous request/response round trips on the caller's thread.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use roma_common::{
    Channel, ChannelError, CodeSpec, ExecuteSpec, Reply, Request, SharedRegion, Side, WorkerInit,
};
use tracing::{instrument, Level};

use crate::error::{Result, RomaError};
use crate::objects::ResponseObject;

/// Fixed fd numbers the worker binary finds its inherited channels on.
const COMMS_FD: i32 = 3;
const RPC_FD: i32 = 4;
const SHARED_FD: i32 = 5;

/// Extra wall-clock slack the parent grants the child beyond the request
/// deadline before declaring it stalled.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Budget for one load round trip (compile plus pre-validation).
const LOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Budget for the init handshake after spawn.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` waits for a clean exit before sending SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline applied when a request carries none; mirrors the worker's own
/// default budget.
const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resource limits and binding configuration for one worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Path to the worker binary to spawn.
    pub worker_binary: PathBuf,
    /// Address-space cap for the worker process in MiB (0 = unlimited).
    pub max_virtual_memory_mb: u32,
    /// Engine heap size at which garbage collection starts, in MiB.
    pub engine_initial_heap_mb: u32,
    /// Hard engine heap cap in MiB (0 = uncapped).
    pub engine_maximum_heap_mb: u32,
    /// Cap on loadable module byte-code, in 64 KiB pages (0 = uncapped).
    pub engine_max_wasm_pages: u32,
    /// Size of the shared payload region in MiB (0 = disabled).
    pub shared_buffer_mb: u32,
    /// Route every payload through the shared region, failing oversized
    /// payloads instead of falling back to inline frames.
    pub shared_buffer_only: bool,
    /// Host binding names the guest may call.
    pub binding_names: Vec<String>,
}

/// One worker process plus its main channel.
///
/// The callback-channel end the child inherits (`rpc_remote`) is created
/// once per worker slot and survives replacement: every respawned child
/// gets the same fd, so the parent-side listener keeps serving across
/// crashes.
pub struct WorkerSandbox {
    options: WorkerOptions,
    rpc_remote: UnixStream,
    child: Option<Child>,
    comms: Option<Channel>,
}

impl WorkerSandbox {
    /// Create the façade. The process is not spawned until [`Self::init`].
    pub fn new(options: WorkerOptions, rpc_remote: UnixStream) -> Self {
        Self {
            options,
            rpc_remote,
            child: None,
            comms: None,
        }
    }

    /// Spawn the child process and establish the main channel.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub fn init(&mut self) -> Result<()> {
        // The callback channel is reused across respawns. A listener may
        // have written a reply after the previous child died mid-RPC; drain
        // it so the new child never reads a frame meant for its predecessor.
        drain_stale_frames(&self.rpc_remote);

        let (parent_sock, child_sock) = UnixStream::pair().map_err(spawn_err)?;

        let shared = if self.options.shared_buffer_mb > 0 {
            let len = self.options.shared_buffer_mb as usize * 1024 * 1024;
            Some(SharedRegion::create(len).map_err(|err| spawn_err(err.to_string()))?)
        } else {
            None
        };

        let mut command = Command::new(&self.options.worker_binary);
        command
            .arg("--comms-fd")
            .arg(COMMS_FD.to_string())
            .arg("--rpc-fd")
            .arg(RPC_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        if shared.is_some() {
            command
                .arg("--shared-fd")
                .arg(SHARED_FD.to_string())
                .arg("--shared-size-mb")
                .arg(self.options.shared_buffer_mb.to_string());
            if self.options.shared_buffer_only {
                command.arg("--buffer-only");
            }
        }

        let comms_fd = child_sock.as_raw_fd();
        let rpc_fd = self.rpc_remote.as_raw_fd();
        let shared_fd = shared.as_ref().map(|region| region.raw_fd());
        let rlimit_bytes = self.options.max_virtual_memory_mb as u64 * 1024 * 1024;

        // SAFETY: the closure only calls async-signal-safe libc functions
        // (fcntl/dup2/close/setrlimit/prctl), as required between fork and
        // exec.
        unsafe {
            command.pre_exec(move || {
                remap_fd(comms_fd, COMMS_FD)?;
                remap_fd(rpc_fd, RPC_FD)?;
                if let Some(fd) = shared_fd {
                    remap_fd(fd, SHARED_FD)?;
                }
                if rlimit_bytes > 0 {
                    let limit = libc::rlimit {
                        rlim_cur: rlimit_bytes,
                        rlim_max: rlimit_bytes,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(spawn_err)?;
        drop(child_sock);

        let mut channel = Channel::new(parent_sock, Side::Parent);
        if let Some(region) = shared {
            channel = channel.with_shared_region(region, self.options.shared_buffer_only);
        }

        self.child = Some(child);
        self.comms = Some(channel);
        Ok(())
    }

    /// Hand the child its startup configuration and wait for the ack.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub fn run(&mut self) -> Result<()> {
        let init = WorkerInit {
            binding_names: self.options.binding_names.clone(),
            initial_heap_mb: self.options.engine_initial_heap_mb,
            maximum_heap_mb: self.options.engine_maximum_heap_mb,
            max_wasm_pages: self.options.engine_max_wasm_pages,
        };
        match self.round_trip(&Request::Init(init), INIT_TIMEOUT)? {
            Reply::InitDone { error: None } => Ok(()),
            Reply::InitDone { error: Some(err) } => Err(err.into()),
            other => Err(protocol_err(&other)),
        }
    }

    /// Ship one code version and wait for the worker's ack.
    #[instrument(err(Debug), skip(self, spec), level = Level::DEBUG, fields(version = %spec.version_string))]
    pub fn load(&mut self, spec: &CodeSpec) -> Result<()> {
        match self.round_trip(&Request::LoadCode(spec.clone()), LOAD_TIMEOUT)? {
            Reply::CodeLoaded { error: None, .. } => Ok(()),
            Reply::CodeLoaded { error: Some(err), .. } => Err(err.into()),
            other => Err(protocol_err(&other)),
        }
    }

    /// Run one invocation to completion on this worker.
    #[instrument(err(Debug), skip(self, spec), level = Level::DEBUG, fields(uuid = %spec.request_uuid))]
    pub fn invoke(&mut self, spec: &ExecuteSpec) -> Result<ResponseObject> {
        let deadline = if spec.deadline_ms == 0 {
            DEFAULT_EXECUTE_TIMEOUT
        } else {
            Duration::from_millis(spec.deadline_ms)
        };

        let reply = self.round_trip(&Request::Execute(spec.clone()), deadline + DEADLINE_GRACE)?;
        match reply {
            Reply::Executed {
                response,
                stats,
                error: None,
            } => Ok(ResponseObject {
                id: spec.request_id.clone(),
                resp: response.unwrap_or_default(),
                metrics: stats.into(),
            }),
            Reply::Executed {
                error: Some(err), ..
            } => Err(err.into()),
            other => Err(protocol_err(&other)),
        }
    }

    /// Ask the child to exit; SIGKILL it if it does not within the grace
    /// period.
    #[instrument(skip_all, level = Level::INFO)]
    pub fn stop(&mut self) -> Result<()> {
        if let Some(comms) = &mut self.comms {
            let _ = comms.set_read_timeout(Some(STOP_TIMEOUT));
            let _ = comms.send(&Request::Shutdown);
            let _ = comms.recv::<Reply>();
        }
        self.comms = None;

        if let Some(mut child) = self.child.take() {
            let waited = wait_with_deadline(&mut child, STOP_TIMEOUT);
            if !waited {
                tracing::warn!("worker ignored shutdown, killing it");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        Ok(())
    }

    /// Kill the child immediately and reap it. Used on the crash path,
    /// where the channel is already known to be broken.
    pub fn terminate(&mut self) {
        self.comms = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Replace a dead child: kill whatever is left, spawn a fresh process
    /// on the same callback channel, and redo the init handshake.
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub fn respawn(&mut self) -> Result<()> {
        self.terminate();
        self.init()?;
        self.run()
    }

    /// OS pid of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn round_trip(&mut self, request: &Request, timeout: Duration) -> Result<Reply> {
        let comms = self
            .comms
            .as_mut()
            .ok_or_else(|| RomaError::WorkerCrash("worker is not running".to_string()))?;

        let result = (|| -> std::result::Result<Reply, ChannelError> {
            comms.set_read_timeout(Some(timeout))?;
            comms.send(request)?;
            comms.recv::<Reply>()
        })();

        match result {
            Ok(reply) => Ok(reply),
            Err(err @ (ChannelError::Disconnected | ChannelError::TimedOut)) => {
                // The channel is unusable; reap the child so the slot can
                // be respawned.
                self.terminate();
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for WorkerSandbox {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSandbox")
            .field("pid", &self.pid())
            .finish()
    }
}

/// Duplicate `source` onto the fixed fd `target` between fork and exec.
///
/// The duplicate produced by `dup2` has `FD_CLOEXEC` clear, so the originals
/// can keep it set and nothing leaks into unrelated children.
fn remap_fd(source: i32, target: i32) -> std::io::Result<()> {
    // Move the source clear of the target range first in case the raw fd
    // numbers collide with the fixed targets.
    let moved = unsafe { libc::fcntl(source, libc::F_DUPFD, SHARED_FD + 1) };
    if moved < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::dup2(moved, target) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { libc::close(moved) };
    Ok(())
}

/// Discard anything buffered toward the (dead) child on the callback
/// channel.
fn drain_stale_frames(stream: &UnixStream) {
    use std::io::Read;

    if stream.set_nonblocking(true).is_err() {
        return;
    }
    let mut sink = [0u8; 4096];
    loop {
        match (&*stream).read(&mut sink) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    let _ = stream.set_nonblocking(false);
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(_) => return true,
        }
    }
    false
}

fn spawn_err(err: impl std::fmt::Display) -> RomaError {
    RomaError::Internal(format!("failed to spawn worker: {err}"))
}

fn protocol_err(reply: &Reply) -> RomaError {
    RomaError::Internal(format!("unexpected reply from worker: {reply:?}"))
}

/// Locate the worker binary next to the current executable, or through the
/// `ROMA_WORKER_PATH` environment variable.
pub fn default_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("ROMA_WORKER_PATH") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()
        .map_err(|err| RomaError::Internal(format!("cannot locate current executable: {err}")))?;
    let mut dir = exe
        .parent()
        .ok_or_else(|| RomaError::Internal("current executable has no parent".to_string()))?;
    // Test binaries live one level down in target/<profile>/deps.
    if dir.ends_with("deps") {
        dir = dir
            .parent()
            .ok_or_else(|| RomaError::Internal("deps directory has no parent".to_string()))?;
    }
    let candidate = dir.join("roma-worker");
    if candidate.exists() {
        Ok(candidate)
    } else {
        Err(RomaError::InvalidArgument(format!(
            "worker binary not found at {}; build it, set ROMA_WORKER_PATH, or set \
             Config::worker_binary",
            candidate.display()
        )))
    }
}
