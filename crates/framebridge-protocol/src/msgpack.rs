//! Dependency-free MessagePack subset.
//!
//! Covers nil, bool, int/uint 8–64, float32/64 (float64 on encode), str,
//! bin, array, and map. Output is byte-compatible with standard encoders
//! using the most compact representation.

use crate::error::{ProtocolError, Result};
use crate::value::Value;

/// Deepest array/map nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_into(value, &mut out)?;
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Nil => out.push(0xc0),
        Value::Bool(false) => out.push(0xc2),
        Value::Bool(true) => out.push(0xc3),
        Value::Int(v) => encode_int(*v, out),
        Value::UInt(v) => encode_uint(*v, out),
        Value::Float(f) => {
            out.push(0xcb);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Str(s) => {
            let len = s.len();
            if len <= 31 {
                out.push(0xa0 | len as u8);
            } else if len <= 0xff {
                out.push(0xd9);
                out.push(len as u8);
            } else if len <= 0xffff {
                out.push(0xda);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(0xdb);
                out.extend_from_slice(&checked_u32(len, "string")?.to_be_bytes());
            }
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bin(b) => {
            let len = b.len();
            if len <= 0xff {
                out.push(0xc4);
                out.push(len as u8);
            } else if len <= 0xffff {
                out.push(0xc5);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(0xc6);
                out.extend_from_slice(&checked_u32(len, "binary")?.to_be_bytes());
            }
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            write_container_len(items.len(), 0x90, 0xdc, 0xdd, out)?;
            for item in items {
                encode_into(item, out)?;
            }
        }
        Value::Map(entries) => {
            write_container_len(entries.len(), 0x80, 0xde, 0xdf, out)?;
            for (k, v) in entries {
                encode_into(k, out)?;
                encode_into(v, out)?;
            }
        }
    }
    Ok(())
}

fn encode_int(v: i64, out: &mut Vec<u8>) {
    if v >= 0 {
        encode_uint(v as u64, out);
    } else if v >= -32 {
        out.push(v as i8 as u8);
    } else if v >= i64::from(i8::MIN) {
        out.push(0xd0);
        out.push(v as i8 as u8);
    } else if v >= i64::from(i16::MIN) {
        out.push(0xd1);
        out.extend_from_slice(&(v as i16).to_be_bytes());
    } else if v >= i64::from(i32::MIN) {
        out.push(0xd2);
        out.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        out.push(0xd3);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

fn encode_uint(v: u64, out: &mut Vec<u8>) {
    if v <= 0x7f {
        out.push(v as u8);
    } else if v <= 0xff {
        out.push(0xcc);
        out.push(v as u8);
    } else if v <= 0xffff {
        out.push(0xcd);
        out.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= 0xffff_ffff {
        out.push(0xce);
        out.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        out.push(0xcf);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

fn write_container_len(len: usize, fix: u8, m16: u8, m32: u8, out: &mut Vec<u8>) -> Result<()> {
    if len <= 15 {
        out.push(fix | len as u8);
    } else if len <= 0xffff {
        out.push(m16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(m32);
        out.extend_from_slice(&checked_u32(len, "container")?.to_be_bytes());
    }
    Ok(())
}

fn checked_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::Codec(format!("{what} too long: {len}")))
}

/// Decode exactly one value; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { data: bytes, pos: 0 };
    let value = reader.value(0)?;
    if reader.pos != bytes.len() {
        return Err(ProtocolError::Codec(format!(
            "{} trailing bytes after value",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ProtocolError::Codec("truncated msgpack data".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn str(&mut self, len: usize) -> Result<Value> {
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw)
            .map_err(|err| ProtocolError::Codec(format!("invalid utf-8 string: {err}")))?;
        Ok(Value::Str(s.to_string()))
    }

    fn items(&mut self, len: usize, depth: usize) -> Result<Value> {
        // Each element needs at least one byte; refuse impossible lengths up front.
        if len > self.data.len() - self.pos {
            return Err(ProtocolError::Codec("truncated msgpack data".to_string()));
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.value(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn entries(&mut self, len: usize, depth: usize) -> Result<Value> {
        if len.saturating_mul(2) > self.data.len() - self.pos {
            return Err(ProtocolError::Codec("truncated msgpack data".to_string()));
        }
        let mut entries = Vec::with_capacity(len);
        for _ in 0..len {
            let key = self.value(depth + 1)?;
            let value = self.value(depth + 1)?;
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        let marker = self.u8()?;
        let is_container = matches!(marker, 0x80..=0x9f | 0xdc..=0xdf);
        if is_container && depth >= MAX_DEPTH {
            return Err(ProtocolError::Codec(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            )));
        }

        match marker {
            0x00..=0x7f => Ok(Value::Int(i64::from(marker))),
            0x80..=0x8f => self.entries(usize::from(marker & 0x0f), depth),
            0x90..=0x9f => self.items(usize::from(marker & 0x0f), depth),
            0xa0..=0xbf => self.str(usize::from(marker & 0x1f)),
            0xc0 => Ok(Value::Nil),
            0xc2 => Ok(Value::Bool(false)),
            0xc3 => Ok(Value::Bool(true)),
            0xc4 => {
                let len = usize::from(self.u8()?);
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xc5 => {
                let len = usize::from(self.u16()?);
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xc6 => {
                let len = self.u32()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xca => Ok(Value::Float(f64::from(f32::from_be_bytes(self.array()?)))),
            0xcb => Ok(Value::Float(f64::from_be_bytes(self.array()?))),
            0xcc => Ok(Value::Int(i64::from(self.u8()?))),
            0xcd => Ok(Value::Int(i64::from(self.u16()?))),
            0xce => Ok(Value::Int(i64::from(self.u32()?))),
            0xcf => Ok(Value::from_u64(self.u64()?)),
            0xd0 => Ok(Value::Int(i64::from(i8::from_be_bytes(self.array()?)))),
            0xd1 => Ok(Value::Int(i64::from(i16::from_be_bytes(self.array()?)))),
            0xd2 => Ok(Value::Int(i64::from(i32::from_be_bytes(self.array()?)))),
            0xd3 => Ok(Value::Int(i64::from_be_bytes(self.array()?))),
            0xd9 => {
                let len = usize::from(self.u8()?);
                self.str(len)
            }
            0xda => {
                let len = usize::from(self.u16()?);
                self.str(len)
            }
            0xdb => {
                let len = self.u32()? as usize;
                self.str(len)
            }
            0xdc => {
                let len = usize::from(self.u16()?);
                self.items(len, depth)
            }
            0xdd => {
                let len = self.u32()? as usize;
                self.items(len, depth)
            }
            0xde => {
                let len = usize::from(self.u16()?);
                self.entries(len, depth)
            }
            0xdf => {
                let len = self.u32()? as usize;
                self.entries(len, depth)
            }
            0xe0..=0xff => Ok(Value::Int(i64::from(marker as i8))),
            other => Err(ProtocolError::Codec(format!(
                "unsupported msgpack marker 0x{other:02x}"
            ))),
        }
    }
}
