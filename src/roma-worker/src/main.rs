use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use roma_common::{Channel, CodeSpec, ExecuteSpec, Payload, RpcWrapper, SharedRegion, Side};
use roma_worker::service::serve;
use roma_worker::{EngineOptions, HostCallInvoker, JsEngine};
use tracing_subscriber::EnvFilter;

const EXAMPLES: &str = "\u{001b}[1;4mExamples:\u{001b}[0m
  Run a handler script once and print its result:
    $ cat ./hello.js
    function hello(name) {
        return 'Hello ' + name;
    }

    $ roma-worker ./hello.js --handler hello --inputs '[\"\\\"world\\\"\"]'
    Handler result: \"Hello world\"

  Spawned by the roma host library (fds are inherited socketpair ends):
    $ roma-worker --comms-fd 5 --rpc-fd 6
";

/// The sandboxed worker process of the roma execution runtime.
///
/// With `--comms-fd`/`--rpc-fd` the process serves load/execute requests
/// over the inherited channels until told to shut down. With a script path
/// it loads the script, runs one handler, and prints the result — the same
/// engine the production path uses, without a parent process.
#[derive(clap::Parser)]
#[command(version, about)]
#[clap(after_help = EXAMPLES)]
struct Cli {
    /// Inherited fd of the main request channel.
    #[arg(long, conflicts_with = "script")]
    comms_fd: Option<RawFd>,

    /// Inherited fd of the host-callback channel.
    #[arg(long, requires = "comms_fd")]
    rpc_fd: Option<RawFd>,

    /// Inherited fd of the shared payload region.
    #[arg(long, requires = "shared_size_mb")]
    shared_fd: Option<RawFd>,

    /// Size of the shared payload region in MiB.
    #[arg(long)]
    shared_size_mb: Option<u32>,

    /// Route every payload through the shared region.
    #[arg(long)]
    buffer_only: bool,

    /// Path to a script file (standalone mode).
    script: Option<PathBuf>,

    /// Handler to invoke in standalone mode.
    #[arg(long, default_value = "handler")]
    handler: String,

    /// JSON array of JSON-serialized handler arguments (standalone mode).
    #[arg(long, default_value = "[]")]
    inputs: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match (cli.comms_fd, cli.script.clone()) {
        (Some(comms_fd), None) => {
            let rpc_fd = cli
                .rpc_fd
                .context("--rpc-fd is required together with --comms-fd")?;
            let (comms, rpc) = inherit_channels(&cli, comms_fd, rpc_fd)?;
            serve(comms, rpc)
        }
        (None, Some(script)) => run_standalone(&cli, &script),
        _ => bail!("pass either --comms-fd/--rpc-fd or a script path"),
    }
}

/// Reconstruct the channels from fds inherited across exec.
fn inherit_channels(cli: &Cli, comms_fd: RawFd, rpc_fd: RawFd) -> Result<(Channel, Channel)> {
    // SAFETY: the parent passed these fd numbers on the command line and
    // keeps no handle to them on our side of the fork; each is claimed
    // exactly once here.
    let comms_stream = unsafe { UnixStream::from_raw_fd(comms_fd) };
    let rpc_stream = unsafe { UnixStream::from_raw_fd(rpc_fd) };

    let mut comms = Channel::new(comms_stream, Side::Child);
    if let (Some(shared_fd), Some(size_mb)) = (cli.shared_fd, cli.shared_size_mb) {
        // SAFETY: same inheritance contract as the stream fds above.
        let owned = unsafe { std::os::fd::OwnedFd::from_raw_fd(shared_fd) };
        let region = SharedRegion::from_fd(owned, size_mb as usize * 1024 * 1024)
            .context("mapping the shared payload region")?;
        comms = comms.with_shared_region(region, cli.buffer_only);
    }
    Ok((comms, Channel::new(rpc_stream, Side::Child)))
}

/// Console bridge for standalone mode: print instead of RPC.
struct StdoutInvoker;

impl HostCallInvoker for StdoutInvoker {
    fn invoke(&self, wrapper: &mut RpcWrapper) -> Result<()> {
        if let Some(Payload::StrList(parts)) = &wrapper.io.input {
            if let [severity, line] = parts.as_slice() {
                eprintln!("console.{severity}: {line}");
            }
        }
        Ok(())
    }
}

fn run_standalone(cli: &Cli, script: &PathBuf) -> Result<()> {
    let js = std::fs::read_to_string(script)
        .with_context(|| format!("reading handler script from {script:?}"))?;
    let inputs: Vec<String> =
        serde_json::from_str(&cli.inputs).context("--inputs must be a JSON array of strings")?;

    let mut engine = JsEngine::new(
        EngineOptions::default(),
        Rc::new(StdoutInvoker),
        Arc::new(AtomicBool::new(false)),
    )
    .map_err(|err| anyhow::anyhow!("{}", err.message))?;

    engine
        .load(&CodeSpec {
            id: "standalone".to_string(),
            version_string: "v1".to_string(),
            js,
            bytecode: None,
            precompile_handlers: vec![cli.handler.clone()],
        })
        .map_err(|err| anyhow::anyhow!("{}", err.message))?;

    let outcome = engine
        .run(&ExecuteSpec {
            request_id: "standalone".to_string(),
            request_uuid: "standalone".to_string(),
            version_string: "v1".to_string(),
            handler_name: cli.handler.clone(),
            inputs,
            deadline_ms: 0,
        })
        .map_err(|err| anyhow::anyhow!("{}", err.message))?;

    println!("Handler result: {}", outcome.response);
    Ok(())
}
