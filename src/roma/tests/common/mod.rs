//! Shared helpers for the integration suites.
#![allow(dead_code)] // each suite uses its own subset

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::OnceLock;
use std::time::Duration;

use roma::{CodeObject, Config, InvocationRequest, ResponseObject, RomaService};

/// Build (once) and locate the worker binary.
pub fn worker_binary() -> PathBuf {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| {
        escargot::CargoBuild::new()
            .manifest_path(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../roma-worker/Cargo.toml"
            ))
            .bin("roma-worker")
            .current_release()
            .current_target()
            .run()
            .unwrap()
            .path()
            .to_path_buf()
    })
    .clone()
}

/// A config pointing at the freshly built worker binary.
pub fn base_config<M>() -> Config<M> {
    Config {
        worker_binary: Some(worker_binary()),
        ..Config::default()
    }
}

/// Load a code object and wait for the ack.
pub fn load_blocking<M: Send + Sync + 'static>(
    service: &RomaService<M>,
    code: CodeObject,
) -> roma::Result<ResponseObject> {
    let (tx, rx) = mpsc::channel();
    service.load_code_obj(code, move |result| {
        tx.send(result).unwrap();
    })?;
    rx.recv_timeout(Duration::from_secs(30)).unwrap()
}

/// Execute an invocation and wait for the completion callback.
pub fn execute_blocking<M: Send + Sync + 'static>(
    service: &RomaService<M>,
    request: InvocationRequest<M>,
) -> roma::Result<ResponseObject> {
    let (tx, rx) = mpsc::channel();
    service.execute(request, move |result| {
        tx.send(result).unwrap();
    })?;
    rx.recv_timeout(Duration::from_secs(30)).unwrap()
}

/// Shorthand for a source-only code object.
pub fn code(version: &str, js: &str) -> CodeObject {
    CodeObject {
        id: format!("id-{version}"),
        version_string: version.to_string(),
        js: js.to_string(),
        ..Default::default()
    }
}

/// Shorthand for an invocation with default metadata and a fresh uuid.
pub fn request<M: Default>(version: &str, handler: &str, input: &[&str]) -> InvocationRequest<M> {
    InvocationRequest {
        id: "req".to_string(),
        version_string: version.to_string(),
        handler_name: handler.to_string(),
        input: input.iter().map(|arg| arg.to_string()).collect(),
        ..Default::default()
    }
}
