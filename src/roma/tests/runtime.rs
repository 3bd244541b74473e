//! End-to-end behavior of the embeddable runtime.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::{base_config, code, execute_blocking, load_blocking, request};
use roma::{
    Config, InvocationRequest, LogRecord, LogSink, Payload, RequestLogContext, RomaService,
    RomaError,
};

type Metadata = std::collections::HashMap<String, String>;

#[test]
fn load_and_execute_a_trivial_handler() {
    let service: RomaService = RomaService::new(base_config()).unwrap();

    load_blocking(&service, code("v1", "function hello() { return 'Hello world'; }")).unwrap();
    let response = execute_blocking(&service, request("v1", "hello", &[])).unwrap();

    assert_eq!(response.resp, r#""Hello world""#);
    assert!(response.metrics.duration < Duration::from_secs(5));
    service.stop().unwrap();
}

#[test]
fn handler_arguments_arrive_as_parsed_json() {
    let service: RomaService = RomaService::new(base_config()).unwrap();

    load_blocking(&service, code("v1", "greet = (a) => 'Hi ' + a[0];")).unwrap();
    let response =
        execute_blocking(&service, request("v1", "greet", &[r#"["Foobar"]"#])).unwrap();

    assert_eq!(response.resp, r#""Hi Foobar""#);
    service.stop().unwrap();
}

#[test]
fn registered_callback_is_reachable_from_the_guest() {
    let mut config: Config = base_config();
    config.register_function_binding("callback", |io, _metadata| {
        io.output = Some(Payload::Str("I am a callback".to_string()));
        Ok(())
    });
    let service = RomaService::new(config).unwrap();

    load_blocking(
        &service,
        code("v1", "hello = () => 'Hello world! ' + callback();"),
    )
    .unwrap();
    let response = execute_blocking(&service, request("v1", "hello", &[])).unwrap();

    assert_eq!(response.resp, r#""Hello world! I am a callback""#);
    service.stop().unwrap();
}

#[test]
fn callbacks_see_the_requests_metadata() {
    let mut config: Config<Metadata> = base_config();
    config.register_function_binding("tenant_of", |io, metadata: &Metadata| {
        let tenant = metadata.get("tenant").cloned().unwrap_or_default();
        io.output = Some(Payload::Str(tenant));
        Ok(())
    });
    let service = RomaService::new(config).unwrap();

    load_blocking(&service, code("v1", "who = () => tenant_of();")).unwrap();

    let mut request: InvocationRequest<Metadata> = request("v1", "who", &[]);
    request.metadata = Metadata::from([("tenant".to_string(), "acme".to_string())]);
    let response = execute_blocking(&service, request).unwrap();

    assert_eq!(response.resp, r#""acme""#);
    service.stop().unwrap();
}

#[test]
fn admission_is_bounded_by_max_pending_requests() {
    let mut config: Config = base_config();
    config.number_of_workers = 1;
    config.max_pending_requests = 2;
    let service = RomaService::new(config).unwrap();

    load_blocking(
        &service,
        code(
            "v1",
            "spin = () => { const start = Date.now(); while (Date.now() - start < 600) {} \
             return 'done'; };",
        ),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        service
            .execute(request("v1", "spin", &[]), move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();
    }

    // Third submission: in-flight + queued is already at the cap.
    let err = service
        .execute(request::<Metadata>("v1", "spin", &[]), |_| {})
        .unwrap_err();
    assert!(matches!(err, RomaError::QueueFull), "got {err:?}");

    // Both accepted invocations still complete.
    for _ in 0..2 {
        let result = rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
        assert_eq!(result.resp, r#""done""#);
    }
    assert_eq!(service.pending_requests(), 0);
    service.stop().unwrap();
}

#[test]
fn infinite_loop_hits_the_deadline_and_the_worker_survives() {
    let service: RomaService = RomaService::new(base_config()).unwrap();

    load_blocking(
        &service,
        code("v1", "loop = () => { while (true) {} };\nok = () => 'ok';"),
    )
    .unwrap();

    let mut spin = request("v1", "loop", &[]);
    spin.execution_timeout = Duration::from_millis(100);
    let err = execute_blocking(&service, spin).unwrap_err();
    assert!(matches!(err, RomaError::DeadlineExceeded(_)), "got {err:?}");

    // The same runtime serves the next request.
    let response = execute_blocking(&service, request("v1", "ok", &[])).unwrap();
    assert_eq!(response.resp, r#""ok""#);
    service.stop().unwrap();
}

#[test]
fn unknown_version_is_rejected_by_the_worker() {
    let service: RomaService = RomaService::new(base_config()).unwrap();

    load_blocking(&service, code("v1", "hello = () => 'hi';")).unwrap();
    let err = execute_blocking(&service, request("v2", "hello", &[])).unwrap_err();
    assert!(matches!(err, RomaError::UnknownVersion(_)), "got {err:?}");
    service.stop().unwrap();
}

#[test]
fn compile_errors_carry_the_engine_diagnostic() {
    let service: RomaService = RomaService::new(base_config()).unwrap();

    let err = load_blocking(&service, code("v1", "function hello( {")).unwrap_err();
    assert!(matches!(err, RomaError::GuestCompileError(_)), "got {err:?}");
    service.stop().unwrap();
}

#[test]
fn guest_exceptions_surface_with_their_message() {
    let service: RomaService = RomaService::new(base_config()).unwrap();

    load_blocking(
        &service,
        code("v1", "boom = () => { throw new Error('tenant bug'); };"),
    )
    .unwrap();
    let err = execute_blocking(&service, request("v1", "boom", &[])).unwrap_err();
    match err {
        RomaError::GuestRuntimeError(message) => {
            assert!(message.contains("tenant bug"), "got: {message}")
        }
        other => panic!("expected a guest runtime error, got {other:?}"),
    }
    service.stop().unwrap();
}

#[derive(Default)]
struct CollectingSink(std::sync::Mutex<Vec<LogRecord>>);

impl LogSink for CollectingSink {
    fn emit(&self, record: &LogRecord) {
        self.0.lock().unwrap().push(record.clone());
    }
}

#[test]
fn console_output_reaches_the_sink_only_with_consent() {
    let sink = Arc::new(CollectingSink::default());
    let mut config: Config = base_config();
    config.server_token = Some("secret-token".to_string());
    config.log_sink = Some(sink.clone());
    let service = RomaService::new(config).unwrap();

    load_blocking(
        &service,
        code("v1", "hello = () => { console.log('from the guest'); return 'ok'; };"),
    )
    .unwrap();

    // Without the client token nothing is recorded.
    execute_blocking(&service, request("v1", "hello", &[])).unwrap();
    assert!(sink.0.lock().unwrap().is_empty());

    // With a matching token the line arrives, tagged with the context.
    let mut consented: InvocationRequest = request("v1", "hello", &[]);
    consented.log_context = RequestLogContext {
        client_token: Some("secret-token".to_string()),
        context: std::collections::BTreeMap::from([(
            "origin".to_string(),
            "example.com".to_string(),
        )]),
    };
    execute_blocking(&service, consented).unwrap();

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message, "from the guest");
    assert!(records[0].context.contains("example.com"));
    service.stop().unwrap();
}

#[test]
fn calls_are_refused_after_stop() {
    let service: RomaService = RomaService::new(base_config()).unwrap();
    service.stop().unwrap();

    let err = service
        .execute(request::<Metadata>("v1", "hello", &[]), |_| {})
        .unwrap_err();
    assert!(matches!(err, RomaError::Shutdown), "got {err:?}");

    // Stop is idempotent.
    service.stop().unwrap();
}

#[test]
fn work_is_distributed_across_multiple_workers() {
    let mut config: Config = base_config();
    config.number_of_workers = 2;
    config.max_pending_requests = 16;
    let service = RomaService::new(config).unwrap();

    load_blocking(&service, code("v1", "hello = (a) => 'Hello ' + a;")).unwrap();

    let (tx, rx) = mpsc::channel();
    for index in 0..8 {
        let tx = tx.clone();
        let arg = format!("\"{index}\"");
        service
            .execute(request("v1", "hello", &[arg.as_str()]), move |result| {
                tx.send(result).unwrap()
            })
            .unwrap();
    }
    for _ in 0..8 {
        rx.recv_timeout(Duration::from_secs(30)).unwrap().unwrap();
    }
    assert_eq!(service.pending_requests(), 0);
    service.stop().unwrap();
}
