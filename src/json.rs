//! Canonical JSON codec shared by payloads, metadata, projection state and
//! stream positions.
//!
//! serde_json already produces the wire shape the store relies on: slashes
//! and unicode are written verbatim, arrays stay arrays and integer-valued
//! floats keep their fractional part (`0.0` does not collapse to `0`).

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;

pub fn encode<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(Error::from)
}

pub fn decode(raw: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(Error::from)
}

/// Decodes a JSON object column, rejecting scalar or array content.
pub fn decode_object(raw: &str) -> Result<Map<String, Value>, Error> {
    match decode(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::UnexpectedValue(format!(
            "expected a JSON object, got: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn slashes_and_unicode_are_not_escaped() {
        assert_eq!(encode(&json!("a/b")).unwrap(), r#""a/b""#);
        assert_eq!(encode(&json!("späße")).unwrap(), r#""späße""#);
    }

    #[test]
    fn integer_valued_floats_keep_their_fraction() {
        assert_eq!(encode(&json!(0.0)).unwrap(), "0.0");
        assert_eq!(encode(&json!({"v": 2.0})).unwrap(), r#"{"v":2.0}"#);
    }

    #[test]
    fn arrays_stay_arrays() {
        assert_eq!(
            encode(&json!({"name": ["John", "Jane"]})).unwrap(),
            r#"{"name":["John","Jane"]}"#
        );
    }

    #[test]
    fn object_decoding_rejects_scalars() {
        assert!(decode_object(r#"{"key":"value"}"#).is_ok());
        assert!(matches!(
            decode_object("42"),
            Err(Error::UnexpectedValue(_))
        ));
    }
}
