//! Byte-level encode/decode contract.
//!
//! Two codecs ship with the core: JSON (self-describing, used for
//! cross-version persistence) and BSON (compact binary, recommended on the
//! wire). Both are deterministic for a fixed input value. Decoding an empty
//! byte slice is always a validation failure, never a panic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use catga_common::{CatgaError, CatgaResult};

/// Deterministic value <-> bytes conversion.
pub trait Codec: Send + Sync + 'static {
    /// MIME-style identifier recorded alongside persisted payloads.
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> CatgaResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CatgaResult<T>;
}

fn reject_empty(bytes: &[u8]) -> CatgaResult<()> {
    if bytes.is_empty() {
        return Err(CatgaError::validation(
            "empty_payload",
            "cannot decode an empty payload",
        ));
    }
    Ok(())
}

/// Self-describing JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> CatgaResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CatgaError::internal_from("json_encode", e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CatgaResult<T> {
        reject_empty(bytes)?;
        serde_json::from_slice(bytes)
            .map_err(|e| CatgaError::validation("json_decode", e.to_string()))
    }
}

/// Compact binary codec over BSON.
///
/// BSON requires a document at the root, so values are wrapped in a
/// single-field document; scalars and sequences round-trip like any struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonCodec;

#[derive(Serialize)]
struct WrapRef<'a, T> {
    v: &'a T,
}

#[derive(Deserialize)]
struct Wrap<T> {
    v: T,
}

impl Codec for BsonCodec {
    fn content_type(&self) -> &'static str {
        "application/bson"
    }

    fn encode<T: Serialize>(&self, value: &T) -> CatgaResult<Vec<u8>> {
        bson::to_vec(&WrapRef { v: value }).map_err(|e| CatgaError::internal_from("bson_encode", e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CatgaResult<T> {
        reject_empty(bytes)?;
        bson::from_slice::<Wrap<T>>(bytes)
            .map(|w| w.v)
            .map_err(|e| CatgaError::validation("bson_decode", e.to_string()))
    }
}

/// Runtime codec selection without trait objects.
#[derive(Debug, Clone, Copy)]
pub enum AnyCodec {
    Json(JsonCodec),
    Bson(BsonCodec),
}

impl AnyCodec {
    pub fn json() -> Self {
        AnyCodec::Json(JsonCodec)
    }

    pub fn bson() -> Self {
        AnyCodec::Bson(BsonCodec)
    }
}

impl Default for AnyCodec {
    fn default() -> Self {
        AnyCodec::json()
    }
}

impl Codec for AnyCodec {
    fn content_type(&self) -> &'static str {
        match self {
            AnyCodec::Json(c) => c.content_type(),
            AnyCodec::Bson(c) => c.content_type(),
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> CatgaResult<Vec<u8>> {
        match self {
            AnyCodec::Json(c) => c.encode(value),
            AnyCodec::Bson(c) => c.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CatgaResult<T> {
        match self {
            AnyCodec::Json(c) => c.decode(bytes),
            AnyCodec::Bson(c) => c.decode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catga_common::ErrorKind;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: i64,
        lines: Vec<String>,
        note: Option<String>,
    }

    fn sample() -> Order {
        Order {
            id: 42,
            lines: vec!["a".into(), "b".into()],
            note: None,
        }
    }

    #[test]
    fn json_round_trips_structs_and_scalars() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode::<Order>(&bytes).unwrap(), sample());

        let bytes = codec.encode(&"hello").unwrap();
        assert_eq!(codec.decode::<String>(&bytes).unwrap(), "hello");
    }

    #[test]
    fn bson_round_trips_structs_and_scalars() {
        let codec = BsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode::<Order>(&bytes).unwrap(), sample());

        let bytes = codec.encode(&7i64).unwrap();
        assert_eq!(codec.decode::<i64>(&bytes).unwrap(), 7);
    }

    #[test]
    fn encoding_is_deterministic() {
        for codec in [AnyCodec::json(), AnyCodec::bson()] {
            let first = codec.encode(&sample()).unwrap();
            let second = codec.encode(&sample()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn empty_input_is_a_validation_failure() {
        for codec in [AnyCodec::json(), AnyCodec::bson()] {
            let err = codec.decode::<Order>(&[]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[test]
    fn garbage_input_is_a_validation_failure() {
        let err = JsonCodec.decode::<Order>(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
