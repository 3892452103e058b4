use crate::error::Result;
use crate::msgpack;
use crate::value::Value;

/// A MessagePack encoder/decoder for dynamic values.
pub trait ValueCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// The built-in pure codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactCodec;

impl ValueCodec for CompactCodec {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        msgpack::encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        msgpack::decode(bytes)
    }
}

#[cfg(feature = "rmp")]
pub use self::rmp::RmpCodec;

#[cfg(feature = "rmp")]
mod rmp {
    use std::io::Cursor;

    use serde::Deserialize;

    use super::ValueCodec;
    use crate::error::{ProtocolError, Result};
    use crate::msgpack::MAX_DEPTH;
    use crate::value::Value;

    /// Codec backed by `rmp-serde`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RmpCodec;

    impl ValueCodec for RmpCodec {
        fn name(&self) -> &'static str {
            "rmp-serde"
        }

        fn encode(&self, value: &Value) -> Result<Vec<u8>> {
            rmp_serde::to_vec(value).map_err(|err| ProtocolError::Codec(err.to_string()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<Value> {
            let mut cursor = Cursor::new(bytes);
            let value = {
                let mut de = rmp_serde::Deserializer::new(&mut cursor);
                Value::deserialize(&mut de).map_err(|err| ProtocolError::Codec(err.to_string()))?
            };

            let consumed = cursor.position() as usize;
            if consumed != bytes.len() {
                return Err(ProtocolError::Codec(format!(
                    "{} trailing bytes after value",
                    bytes.len() - consumed
                )));
            }
            if value.depth() > MAX_DEPTH {
                return Err(ProtocolError::Codec(format!(
                    "nesting deeper than {MAX_DEPTH} levels"
                )));
            }
            Ok(value)
        }
    }
}

/// Codec used by the message layer: `rmp-serde` when the `rmp` feature is
/// enabled, the pure codec otherwise.
pub fn default_codec() -> &'static dyn ValueCodec {
    #[cfg(feature = "rmp")]
    {
        &RmpCodec
    }
    #[cfg(not(feature = "rmp"))]
    {
        &CompactCodec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::Map(vec![
            (Value::str("type"), Value::str("frame_meta")),
            (
                Value::str("payload"),
                Value::Map(vec![
                    (Value::str("frameId"), Value::Int(300)),
                    (Value::str("neg"), Value::Int(-70_000)),
                    (Value::str("big"), Value::UInt(u64::MAX)),
                    (Value::str("ratio"), Value::Float(0.5)),
                    (Value::str("blob"), Value::Bin(vec![1, 2, 3])),
                    (Value::str("none"), Value::Nil),
                    (
                        Value::str("caps"),
                        Value::Array(vec![Value::str("shm_ring"), Value::Bool(false)]),
                    ),
                ]),
            ),
        ])
    }

    #[test]
    fn compact_codec_roundtrip() {
        let codec = CompactCodec;
        let value = sample();
        assert_eq!(codec.decode(&codec.encode(&value).unwrap()).unwrap(), value);
    }

    #[cfg(feature = "rmp")]
    #[test]
    fn rmp_and_compact_interoperate() {
        let value = sample();
        let rmp_wire = RmpCodec.encode(&value).unwrap();
        let compact_wire = CompactCodec.encode(&value).unwrap();

        assert_eq!(CompactCodec.decode(&rmp_wire).unwrap(), value);
        assert_eq!(RmpCodec.decode(&compact_wire).unwrap(), value);
    }

    #[cfg(feature = "rmp")]
    #[test]
    fn rmp_rejects_trailing_bytes() {
        let mut wire = RmpCodec.encode(&Value::Int(1)).unwrap();
        wire.push(0xc0);
        assert!(RmpCodec.decode(&wire).is_err());
    }

    #[test]
    fn default_codec_is_usable() {
        let codec = default_codec();
        let value = sample();
        assert_eq!(codec.decode(&codec.encode(&value).unwrap()).unwrap(), value);
    }
}
