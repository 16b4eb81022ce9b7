//! Row and column decoding.
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::ext::BytesExt;
use crate::postgres::{backend, Oid, PgFormat, ProtocolError};

/// One column of a row description.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub oid: Oid,
    pub format: PgFormat,
}

impl Column {
    /// Decode all fields of a `RowDescription` body.
    pub(crate) fn parse_all(msg: backend::RowDescription) -> Result<Arc<[Column]>, ProtocolError> {
        let mut body = msg.body;
        let mut columns = Vec::with_capacity(msg.field_len as usize);
        for _ in 0..msg.field_len {
            let name = body.get_nul_string()?;
            let _table_oid = body.get_u32();
            let _attr_num = body.get_i16();
            let oid = body.get_u32();
            let _typlen = body.get_i16();
            let _typmod = body.get_i32();
            let format = PgFormat::from_code(body.get_u16());
            columns.push(Column { name, oid, format });
        }
        Ok(columns.into())
    }
}

/// One data row.
///
/// Values are kept in their wire form, `None` is SQL NULL. The column
/// list is shared across all rows of a statement.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn parse(columns: Arc<[Column]>, msg: backend::DataRow) -> Row {
        let mut body = msg.body;
        let mut values = Vec::with_capacity(msg.column_len as usize);
        for _ in 0..msg.column_len {
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }
        Row { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw wire bytes of a column, `None` for SQL NULL.
    ///
    /// # Panics
    ///
    /// Panics when `index` is not below [`len`][Row::len].
    pub fn bytes(&self, index: usize) -> Option<&[u8]> {
        self.values[index].as_deref()
    }

    /// Binary format `int4`.
    pub fn get_i32(&self, index: usize) -> Option<i32> {
        let raw: [u8; 4] = self.bytes(index)?.try_into().ok()?;
        Some(i32::from_be_bytes(raw))
    }

    /// Binary format `int8`.
    pub fn get_i64(&self, index: usize) -> Option<i64> {
        let raw: [u8; 8] = self.bytes(index)?.try_into().ok()?;
        Some(i64::from_be_bytes(raw))
    }

    /// Text format value.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        std::str::from_utf8(self.bytes(index)?).ok()
    }
}
