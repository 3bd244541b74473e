//! Dispatcher behavior driven through the lower-level pool types.

mod common;

use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::worker_binary;
use roma::native_function::{NativeFunctionHandler, NativeFunctionTable};
use roma::sandbox::{Dispatcher, WorkerOptions, WorkerSandbox};
use roma::{
    Channel, CodeSpec, ConsentedLogger, ExecuteSpec, MetadataStorage, RequestEntry, RomaError,
    Side, TracingLogSink,
};

type Metadata = std::collections::HashMap<String, String>;

/// One worker slot wired to a listener, the way the service does it.
struct Harness {
    dispatcher: Dispatcher,
    handler: Arc<NativeFunctionHandler<Metadata>>,
    storage: Arc<MetadataStorage<Metadata>>,
    worker_pids: Vec<u32>,
}

fn harness(binding_names: &[&str], workers: usize, max_pending: usize) -> Harness {
    let table = Arc::new(NativeFunctionTable::<Metadata>::default());
    let storage = Arc::new(MetadataStorage::new());
    let logger = Arc::new(ConsentedLogger::new(None, Arc::new(TracingLogSink)).unwrap());
    let handler = Arc::new(NativeFunctionHandler::new(
        Arc::clone(&table),
        Arc::clone(&storage),
        logger,
    ));

    let options = WorkerOptions {
        worker_binary: worker_binary(),
        binding_names: binding_names.iter().map(|name| name.to_string()).collect(),
        ..Default::default()
    };

    let mut pool = Vec::new();
    let mut worker_pids = Vec::new();
    for _ in 0..workers {
        let (rpc_local, rpc_remote) = UnixStream::pair().unwrap();
        handler
            .attach(
                Channel::new(rpc_local, Side::Parent),
                rpc_remote.try_clone().unwrap(),
            )
            .unwrap();
        let mut worker = WorkerSandbox::new(options.clone(), rpc_remote);
        worker.init().unwrap();
        worker.run().unwrap();
        worker_pids.push(worker.pid().unwrap());
        pool.push(worker);
    }

    Harness {
        dispatcher: Dispatcher::new(pool, max_pending),
        handler,
        storage,
        worker_pids,
    }
}

fn load_blocking(dispatcher: &Dispatcher, version: &str, js: &str) {
    let (tx, rx) = mpsc::channel();
    dispatcher
        .load(
            CodeSpec {
                id: format!("id-{version}"),
                version_string: version.to_string(),
                js: js.to_string(),
                ..Default::default()
            },
            move |result| tx.send(result).unwrap(),
        )
        .unwrap();
    rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
}

fn spec(uuid: &str, version: &str, handler: &str) -> ExecuteSpec {
    ExecuteSpec {
        request_id: uuid.to_string(),
        request_uuid: uuid.to_string(),
        version_string: version.to_string(),
        handler_name: handler.to_string(),
        inputs: Vec::new(),
        deadline_ms: 5000,
    }
}

#[test]
fn boundary_one_rejection_past_the_admission_cap() {
    let harness = harness(&[], 1, 2);
    load_blocking(
        &harness.dispatcher,
        "v1",
        "spin = () => { const start = Date.now(); while (Date.now() - start < 600) {} \
         return 'done'; };",
    );

    let (tx, rx) = mpsc::channel();
    let mut accepted = 0;
    let mut rejected = 0;
    for index in 0..3 {
        let tx = tx.clone();
        match harness
            .dispatcher
            .invoke(spec(&format!("uuid-{index}"), "v1", "spin"), move |result| {
                tx.send(result).unwrap()
            }) {
            Ok(()) => accepted += 1,
            Err(RomaError::QueueFull) => rejected += 1,
            Err(other) => panic!("unexpected rejection: {other:?}"),
        }
    }
    assert_eq!((accepted, rejected), (2, 1));

    for _ in 0..accepted {
        rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
    }
    assert_eq!(harness.dispatcher.pending_requests(), 0);

    harness.dispatcher.stop();
    harness.handler.stop();
}

#[test]
fn killed_worker_fails_in_flight_and_queued_requests_then_recovers() {
    let harness = harness(&[], 1, 8);
    load_blocking(
        &harness.dispatcher,
        "v1",
        "spin = () => { const start = Date.now(); while (Date.now() - start < 2000) {} \
         return 'done'; };\nok = () => 'ok';",
    );

    let (tx, rx) = mpsc::channel();
    for index in 0..2 {
        let tx = tx.clone();
        harness
            .dispatcher
            .invoke(spec(&format!("uuid-{index}"), "v1", "spin"), move |result| {
                tx.send(result).unwrap()
            })
            .unwrap();
    }

    // Let the first invocation reach the worker, then kill it.
    std::thread::sleep(Duration::from_millis(300));
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(harness.worker_pids[0] as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    for _ in 0..2 {
        let result = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert!(
            matches!(result, Err(RomaError::WorkerCrash(_))),
            "got {result:?}"
        );
    }
    assert_eq!(harness.dispatcher.pending_requests(), 0);

    // The replacement replayed the load and serves again.
    let (tx, rx) = mpsc::channel();
    harness
        .dispatcher
        .invoke(spec("uuid-after", "v1", "ok"), move |result| {
            tx.send(result).unwrap()
        })
        .unwrap();
    let response = rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
    assert_eq!(response.resp, r#""ok""#);

    harness.dispatcher.stop();
    harness.handler.stop();
}

#[test]
fn unregistered_binding_name_surfaces_the_lookup_error() {
    // The stub exists in the guest; no handler is registered for it.
    let harness = harness(&["missing"], 1, 4);
    assert!(harness.storage.insert("uuid-1", RequestEntry::default()));
    load_blocking(&harness.dispatcher, "v1", "h = () => missing();");

    let (tx, rx) = mpsc::channel();
    harness
        .dispatcher
        .invoke(spec("uuid-1", "v1", "h"), move |result| {
            tx.send(result).unwrap()
        })
        .unwrap();

    let err = rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap_err();
    match err {
        RomaError::GuestRuntimeError(message) => assert!(
            message.contains("Could not find C++ function by name"),
            "got: {message}"
        ),
        other => panic!("expected a guest runtime error, got {other:?}"),
    }
    harness.storage.remove("uuid-1");

    harness.dispatcher.stop();
    harness.handler.stop();
}

#[test]
fn loads_submitted_before_invocations_are_visible_to_them() {
    let harness = harness(&[], 2, 16);

    // Submit the load and an immediate invocation without waiting for the
    // load ack: per-worker FIFO makes the load land first.
    let (load_tx, load_rx) = mpsc::channel();
    harness
        .dispatcher
        .load(
            CodeSpec {
                id: "id-v1".to_string(),
                version_string: "v1".to_string(),
                js: "h = () => 'loaded';".to_string(),
                ..Default::default()
            },
            move |result| load_tx.send(result).unwrap(),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    harness
        .dispatcher
        .invoke(spec("uuid-1", "v1", "h"), move |result| {
            tx.send(result).unwrap()
        })
        .unwrap();

    load_rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
    let response = rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
    assert_eq!(response.resp, r#""loaded""#);

    harness.dispatcher.stop();
    harness.handler.stop();
}
