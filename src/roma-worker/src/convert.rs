//! Conversion between guest values and the wire payload union.
//!
//! Binding stubs accept exactly the shapes the wire supports: zero
//! arguments, one string, one list of strings, one map of string to string,
//! or one `Uint8Array`. Anything else is rejected before a frame is
//! produced. The output direction is symmetric; an absent output becomes
//! `undefined`.

use std::collections::BTreeMap;

use roma_common::Payload;
use rquickjs::{Array, Ctx, Object, TypedArray, Value};

/// Message thrown into the guest when an argument shape is unsupported.
pub const ERR_UNSUPPORTED_INPUT: &str = "Could not convert JS function input to native C++ type.";

/// Convert the arguments of a binding call into a wire payload.
///
/// Returns `Err(())` for unsupported shapes; the caller throws
/// [`ERR_UNSUPPORTED_INPUT`] into the guest.
pub fn args_to_payload(args: &[Value<'_>]) -> Result<Option<Payload>, ()> {
    match args {
        [] => Ok(None),
        [value] => value_to_payload(value).map(Some),
        _ => Err(()),
    }
}

fn value_to_payload(value: &Value<'_>) -> Result<Payload, ()> {
    if let Some(text) = value.as_string() {
        return Ok(Payload::Str(text.to_string().map_err(|_| ())?));
    }

    let Some(object) = value.as_object() else {
        return Err(());
    };

    // Typed arrays and arrays are objects too; check them before treating
    // the value as a plain map.
    if let Some(bytes) = object.as_typed_array::<u8>() {
        return Ok(Payload::Bytes(bytes.as_bytes().ok_or(())?.to_vec()));
    }

    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            let item = item.map_err(|_| ())?;
            let text = item.as_string().ok_or(())?;
            items.push(text.to_string().map_err(|_| ())?);
        }
        return Ok(Payload::StrList(items));
    }

    let mut map = BTreeMap::new();
    for prop in object.props::<String, Value>() {
        let (key, item) = prop.map_err(|_| ())?;
        let text = item.as_string().ok_or(())?;
        map.insert(key, text.to_string().map_err(|_| ())?);
    }
    Ok(Payload::StrMap(map))
}

/// Convert a handler reply payload back into a guest value.
pub fn payload_to_value<'js>(
    ctx: &Ctx<'js>,
    payload: Option<&Payload>,
) -> rquickjs::Result<Value<'js>> {
    let Some(payload) = payload else {
        return Ok(Value::new_undefined(ctx.clone()));
    };

    match payload {
        Payload::Str(text) => {
            Ok(rquickjs::String::from_str(ctx.clone(), text)?.into_value())
        }
        Payload::StrList(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, item.as_str())?;
            }
            Ok(array.into_value())
        }
        Payload::StrMap(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), item.as_str())?;
            }
            Ok(object.into_value())
        }
        Payload::Bytes(bytes) => {
            Ok(TypedArray::<u8>::new(ctx.clone(), bytes.as_slice())?.into_value())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_ctx(f: impl for<'js> FnOnce(Ctx<'js>)) {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(f);
    }

    #[test]
    fn string_argument_converts() {
        with_ctx(|ctx| {
            let value: Value = ctx.eval(r#""hello""#).unwrap();
            let payload = args_to_payload(&[value]).unwrap();
            assert_eq!(payload, Some(Payload::Str("hello".into())));
        });
    }

    #[test]
    fn list_of_strings_converts() {
        with_ctx(|ctx| {
            let value: Value = ctx.eval(r#"["a", "b"]"#).unwrap();
            let payload = args_to_payload(&[value]).unwrap();
            assert_eq!(
                payload,
                Some(Payload::StrList(vec!["a".into(), "b".into()]))
            );
        });
    }

    #[test]
    fn map_of_strings_converts() {
        with_ctx(|ctx| {
            let value: Value = ctx.eval(r#"({k1: "v1", k2: "v2"})"#).unwrap();
            let payload = args_to_payload(&[value]).unwrap();
            let Some(Payload::StrMap(map)) = payload else {
                panic!("expected a map payload");
            };
            assert_eq!(map.get("k1").map(String::as_str), Some("v1"));
            assert_eq!(map.get("k2").map(String::as_str), Some("v2"));
        });
    }

    #[test]
    fn uint8_array_converts_to_bytes() {
        with_ctx(|ctx| {
            let value: Value = ctx.eval(r#"new Uint8Array([1, 2, 255])"#).unwrap();
            let payload = args_to_payload(&[value]).unwrap();
            assert_eq!(payload, Some(Payload::Bytes(vec![1, 2, 255])));
        });
    }

    #[test]
    fn no_arguments_is_an_empty_payload() {
        assert_eq!(args_to_payload(&[]).unwrap(), None);
    }

    #[test]
    fn numbers_and_mixed_lists_are_rejected() {
        with_ctx(|ctx| {
            let number: Value = ctx.eval("42").unwrap();
            assert!(args_to_payload(&[number]).is_err());

            let mixed: Value = ctx.eval(r#"["a", 1]"#).unwrap();
            assert!(args_to_payload(&[mixed]).is_err());
        });
    }

    #[test]
    fn more_than_one_argument_is_rejected() {
        with_ctx(|ctx| {
            let a: Value = ctx.eval(r#""a""#).unwrap();
            let b: Value = ctx.eval(r#""b""#).unwrap();
            assert!(args_to_payload(&[a, b]).is_err());
        });
    }

    #[test]
    fn payloads_round_trip_back_to_guest_values() {
        with_ctx(|ctx| {
            let payload = Payload::StrList(vec!["x".into(), "y".into()]);
            let value = payload_to_value(&ctx, Some(&payload)).unwrap();
            let round_tripped = value_to_payload(&value).unwrap();
            assert_eq!(round_tripped, payload);

            let bytes = Payload::Bytes(vec![7, 8, 9]);
            let value = payload_to_value(&ctx, Some(&bytes)).unwrap();
            assert_eq!(value_to_payload(&value).unwrap(), bytes);

            assert!(payload_to_value(&ctx, None).unwrap().is_undefined());
        });
    }
}
