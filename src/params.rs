//! Positional query parameters.
use crate::postgres::{Oid, pg_type};

/// A parameter slot value.
///
/// The declared [`Oid`] of the slot decides how the value travels on
/// the wire, see [`encode`][crate::encode].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// SQL NULL, encoded as the protocol's `-1` length marker.
    Null,
    Int(i32),
    Long(i64),
    IntArray(Vec<i32>),
    Str(String),
    StrArray(Vec<String>),
    Bytes(Vec<u8>),
    /// Pre-encoded binary-format value, passed through untouched.
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParamSlot {
    pub oid: Oid,
    pub value: ParamValue,
}

/// Fixed-length positional parameter list.
///
/// Created sized to a query's declared parameter count, see
/// [`Query::parameters`][crate::Query::parameters]. Slots start as
/// untyped NULL.
///
/// All setters panic when `index` is out of bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    slots: Vec<ParamSlot>,
}

impl Parameters {
    /// Create a parameter list of `len` untyped NULL slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![ParamSlot { oid: 0, value: ParamValue::Null }; len],
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if there is no slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set_int(&mut self, index: usize, value: i32) -> &mut Self {
        self.set(index, pg_type::INT4, ParamValue::Int(value))
    }

    pub fn set_long(&mut self, index: usize, value: i64) -> &mut Self {
        self.set(index, pg_type::INT8, ParamValue::Long(value))
    }

    pub fn set_text(&mut self, index: usize, value: impl Into<String>) -> &mut Self {
        self.set(index, pg_type::TEXT, ParamValue::Str(value.into()))
    }

    pub fn set_json(&mut self, index: usize, value: impl Into<String>) -> &mut Self {
        self.set(index, pg_type::JSON, ParamValue::Str(value.into()))
    }

    pub fn set_uuid(&mut self, index: usize, value: [u8; 16]) -> &mut Self {
        self.set(index, pg_type::UUID, ParamValue::Bytes(value.to_vec()))
    }

    pub fn set_bytea(&mut self, index: usize, value: impl Into<Vec<u8>>) -> &mut Self {
        self.set(index, pg_type::BYTEA, ParamValue::Bytes(value.into()))
    }

    pub fn set_int_array(&mut self, index: usize, value: Vec<i32>) -> &mut Self {
        self.set(index, pg_type::INT4_ARRAY, ParamValue::IntArray(value))
    }

    pub fn set_text_array(&mut self, index: usize, value: Vec<String>) -> &mut Self {
        self.set(index, pg_type::TEXT_ARRAY, ParamValue::StrArray(value))
    }

    /// Typed NULL.
    pub fn set_null(&mut self, index: usize, oid: Oid) -> &mut Self {
        self.set(index, oid, ParamValue::Null)
    }

    /// Pre-encoded binary-format value with a caller supplied oid.
    pub fn set_binary(&mut self, index: usize, oid: Oid, data: Vec<u8>) -> &mut Self {
        self.set(index, oid, ParamValue::Binary(data))
    }

    /// Set a slot with an explicit oid.
    ///
    /// The value must match the declared oid at execute time,
    /// see [`encode`][crate::encode] for the supported pairs.
    pub fn set_oid_value(&mut self, index: usize, oid: Oid, value: ParamValue) -> &mut Self {
        self.set(index, oid, value)
    }

    fn set(&mut self, index: usize, oid: Oid, value: ParamValue) -> &mut Self {
        self.slots[index] = ParamSlot { oid, value };
        self
    }

    pub(crate) fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slots_default_to_untyped_null() {
        let params = Parameters::new(2);
        assert_eq!(params.len(), 2);
        assert_eq!(params.slots()[0], ParamSlot { oid: 0, value: ParamValue::Null });
    }

    #[test]
    fn setters_declare_oid() {
        let mut params = Parameters::new(3);
        params
            .set_int(0, 7)
            .set_text(1, "x")
            .set_null(2, pg_type::INT8);
        assert_eq!(params.slots()[0].oid, pg_type::INT4);
        assert_eq!(params.slots()[1].oid, pg_type::TEXT);
        assert_eq!(params.slots()[2], ParamSlot { oid: pg_type::INT8, value: ParamValue::Null });
    }
}
