//! Parameter encoding.
//!
//! Each parameter slot travels in the format its declared oid calls
//! for: integers, uuid and bytea in binary, character types as UTF-8
//! text, arrays as their text literal form.
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::params::{ParamSlot, ParamValue};
use crate::postgres::{Oid, PgFormat, pg_type};

/// A wire-ready parameter value.
#[derive(Debug)]
pub struct Encoded {
    oid: Oid,
    format: PgFormat,
    /// `None` is SQL NULL, sent as the `-1` length marker.
    bytes: Option<Bytes>,
}

impl Encoded {
    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// Contribution to the Bind message body size.
    pub(crate) fn size_hint(&self) -> u32 {
        // 4 byte length prefix, then the value when not null
        4 + self.bytes.as_ref().map(|b| b.len() as u32).unwrap_or(0)
    }
}

/// A parameter slot that cannot be encoded.
///
/// Recoverable, raised before any network traffic.
#[derive(Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// The declared oid is outside the supported vocabulary.
    UnsupportedType { oid: Oid },
    /// The slot value does not fit its declared oid.
    ValueMismatch { oid: Oid },
}

impl std::error::Error for EncodeError { }

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EncodeError::UnsupportedType { oid } => {
                write!(f, "Don't know how to map param with OID {oid}")
            }
            EncodeError::ValueMismatch { oid } => {
                write!(f, "Parameter value does not match declared OID {oid}")
            }
        }
    }
}

/// Encode one parameter slot against its declared oid.
pub(crate) fn encode_slot(slot: &ParamSlot) -> Result<Encoded, EncodeError> {
    let oid = slot.oid;
    let encoded = match (&slot.value, oid) {
        // null bypasses type logic, no value bytes travel
        (ParamValue::Null, _) => Encoded { oid, format: PgFormat::Text, bytes: None },

        // pre-encoded passthrough with caller supplied oid
        (ParamValue::Binary(data), _) => Encoded {
            oid,
            format: PgFormat::Binary,
            bytes: Some(Bytes::copy_from_slice(data)),
        },

        (ParamValue::Int(v), pg_type::INT4) => Encoded {
            oid,
            format: PgFormat::Binary,
            bytes: Some(Bytes::copy_from_slice(&v.to_be_bytes())),
        },

        (ParamValue::Long(v), pg_type::INT8) => Encoded {
            oid,
            format: PgFormat::Binary,
            bytes: Some(Bytes::copy_from_slice(&v.to_be_bytes())),
        },

        (ParamValue::Bytes(raw), pg_type::UUID) => {
            if raw.len() != 16 {
                return Err(EncodeError::ValueMismatch { oid });
            }
            Encoded {
                oid,
                format: PgFormat::Binary,
                bytes: Some(Bytes::copy_from_slice(raw)),
            }
        }

        (ParamValue::Bytes(raw), pg_type::BYTEA) => Encoded {
            oid,
            format: PgFormat::Binary,
            bytes: Some(Bytes::copy_from_slice(raw)),
        },

        (
            ParamValue::Str(text),
            pg_type::TEXT | pg_type::JSON | pg_type::VARCHAR | pg_type::JSONB,
        ) => Encoded {
            oid,
            format: PgFormat::Text,
            bytes: Some(Bytes::copy_from_slice(text.as_bytes())),
        },

        (ParamValue::IntArray(items), pg_type::INT4_ARRAY) => Encoded {
            oid,
            format: PgFormat::Text,
            bytes: Some(int_array_literal(items)),
        },

        (
            ParamValue::StrArray(items),
            pg_type::TEXT_ARRAY | pg_type::VARCHAR_ARRAY | pg_type::JSONB_ARRAY,
        ) => Encoded {
            oid,
            format: PgFormat::Text,
            bytes: Some(str_array_literal(items)),
        },

        (
            _,
            pg_type::INT4
            | pg_type::INT8
            | pg_type::UUID
            | pg_type::BYTEA
            | pg_type::TEXT
            | pg_type::JSON
            | pg_type::VARCHAR
            | pg_type::JSONB
            | pg_type::INT4_ARRAY
            | pg_type::TEXT_ARRAY
            | pg_type::VARCHAR_ARRAY
            | pg_type::JSONB_ARRAY,
        ) => return Err(EncodeError::ValueMismatch { oid }),

        _ => return Err(EncodeError::UnsupportedType { oid }),
    };
    Ok(encoded)
}

/// `{1,2,3}` text literal.
fn int_array_literal(items: &[i32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + items.len() * 4);
    buf.put_u8(b'{');
    let mut itoa = itoa::Buffer::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b',');
        }
        buf.put(itoa.format(*item).as_bytes());
    }
    buf.put_u8(b'}');
    buf.freeze()
}

/// `{"a","b"}` text literal.
///
/// Elements are always quoted so delimiters, braces, whitespace, empty
/// strings and literal `NULL` never need special casing; `"` and `\`
/// inside an element are backslash-escaped.
fn str_array_literal(items: &[String]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + items.iter().map(|i| i.len() + 3).sum::<usize>());
    buf.put_u8(b'{');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b',');
        }
        buf.put_u8(b'"');
        for byte in item.as_bytes() {
            if matches!(byte, b'"' | b'\\') {
                buf.put_u8(b'\\');
            }
            buf.put_u8(*byte);
        }
        buf.put_u8(b'"');
    }
    buf.put_u8(b'}');
    buf.freeze()
}
