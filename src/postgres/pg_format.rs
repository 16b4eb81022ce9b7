/// Postgres data transmission format.
///
/// Integers travel as [`Binary`][PgFormat::Binary] network byte order,
/// array literals and character types as [`Text`][PgFormat::Text].
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    /// Text has format code zero.
    ///
    /// The transmitted representation has no trailing null character,
    /// and embedded nulls are not allowed.
    Text,
    /// Binary has format code one.
    ///
    /// Binary representations for integers use network byte order
    /// (most significant byte first).
    Binary,
}

impl PgFormat {
    /// Return format code for current format.
    pub fn format_code(&self) -> u16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }

    pub(crate) fn from_code(code: u16) -> PgFormat {
        match code {
            1 => PgFormat::Binary,
            _ => PgFormat::Text,
        }
    }
}
