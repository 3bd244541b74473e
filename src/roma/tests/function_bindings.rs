//! Round-trip laws for the callback payload union.

mod common;

use common::{base_config, code, execute_blocking, load_blocking, request};
use roma::{Config, RomaService, RomaError};

/// A service with one binding that echoes its input payload.
fn echo_service() -> RomaService {
    let mut config: Config = base_config();
    config.register_function_binding("echo", |io, _metadata| {
        io.output = io.input.clone();
        Ok(())
    });
    RomaService::new(config).unwrap()
}

#[test]
fn string_payload_round_trips() {
    let service = echo_service();
    load_blocking(&service, code("v1", "h = () => echo('roundtrip');")).unwrap();
    let response = execute_blocking(&service, request("v1", "h", &[])).unwrap();
    assert_eq!(response.resp, r#""roundtrip""#);
    service.stop().unwrap();
}

#[test]
fn list_of_strings_payload_round_trips() {
    let service = echo_service();
    load_blocking(&service, code("v1", "h = () => echo(['a', 'b', 'c']);")).unwrap();
    let response = execute_blocking(&service, request("v1", "h", &[])).unwrap();
    assert_eq!(response.resp, r#"["a","b","c"]"#);
    service.stop().unwrap();
}

#[test]
fn map_of_strings_payload_round_trips() {
    let service = echo_service();
    load_blocking(&service, code("v1", "h = () => echo({k1: 'v1'});")).unwrap();
    let response = execute_blocking(&service, request("v1", "h", &[])).unwrap();
    let value: serde_json::Value = serde_json::from_str(&response.resp).unwrap();
    assert_eq!(value["k1"], "v1");
    service.stop().unwrap();
}

#[test]
fn byte_buffer_payload_round_trips() {
    let service = echo_service();
    load_blocking(
        &service,
        code(
            "v1",
            "h = () => Array.from(echo(new Uint8Array([1, 2, 255])));",
        ),
    )
    .unwrap();
    let response = execute_blocking(&service, request("v1", "h", &[])).unwrap();
    assert_eq!(response.resp, "[1,2,255]");
    service.stop().unwrap();
}

#[test]
fn zero_arguments_and_empty_reply_become_undefined() {
    let service = echo_service();
    load_blocking(&service, code("v1", "h = () => echo() === undefined;")).unwrap();
    let response = execute_blocking(&service, request("v1", "h", &[])).unwrap();
    assert_eq!(response.resp, "true");
    service.stop().unwrap();
}

#[test]
fn unsupported_argument_shape_throws_into_the_guest() {
    let service = echo_service();
    load_blocking(&service, code("v1", "h = () => echo(42);")).unwrap();
    let err = execute_blocking(&service, request("v1", "h", &[])).unwrap_err();
    match err {
        RomaError::GuestRuntimeError(message) => assert!(
            message.contains("Could not convert JS function input to native C++ type"),
            "got: {message}"
        ),
        other => panic!("expected a guest runtime error, got {other:?}"),
    }
    service.stop().unwrap();
}

#[test]
fn failing_handler_throws_the_execution_error() {
    let mut config: Config = base_config();
    config.register_function_binding("broken", |_io, _metadata| anyhow::bail!("nope"));
    let service = RomaService::new(config).unwrap();

    load_blocking(&service, code("v1", "h = () => broken('x');")).unwrap();
    let err = execute_blocking(&service, request("v1", "h", &[])).unwrap_err();
    match err {
        RomaError::GuestRuntimeError(message) => assert!(
            message.contains("Failed to execute the C++ function"),
            "got: {message}"
        ),
        other => panic!("expected a guest runtime error, got {other:?}"),
    }
    service.stop().unwrap();
}

#[test]
fn guest_can_catch_callback_errors() {
    let mut config: Config = base_config();
    config.register_function_binding("broken", |_io, _metadata| anyhow::bail!("nope"));
    let service = RomaService::new(config).unwrap();

    load_blocking(
        &service,
        code(
            "v1",
            "h = () => { try { broken('x'); return 'not reached'; } catch (e) { return 'caught'; } };",
        ),
    )
    .unwrap();
    let response = execute_blocking(&service, request("v1", "h", &[])).unwrap();
    assert_eq!(response.resp, r#""caught""#);
    service.stop().unwrap();
}
