//! Object ids of the supported parameter types.

/// Postgres type object id.
pub type Oid = u32;

pub const BYTEA: Oid = 17;
pub const INT8: Oid = 20;
pub const INT4: Oid = 23;
pub const TEXT: Oid = 25;
pub const JSON: Oid = 114;
pub const INT4_ARRAY: Oid = 1007;
pub const TEXT_ARRAY: Oid = 1009;
pub const VARCHAR_ARRAY: Oid = 1015;
pub const VARCHAR: Oid = 1043;
pub const UUID: Oid = 2950;
pub const JSONB: Oid = 3802;
pub const JSONB_ARRAY: Oid = 3807;
