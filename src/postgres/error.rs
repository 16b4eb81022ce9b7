//! Protocol error and structured server error fields.
use std::fmt;

use bytes::{Buf, Bytes};

use super::BackendMessage;
use crate::ext::BytesExt;

/// An error when translating buffer from postgres
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownTxStatus {
        status: u8,
    },
    Utf8(std::str::Utf8Error),
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownTxStatus { status } => {
                write!(f, "Unknown transaction status `{}`", status.escape_ascii())
            },
            ProtocolError::Utf8(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::Utf8(err)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_tx_status(status: u8) -> ProtocolError {
        Self::UnknownTxStatus { status }
    }
}

/// Structured fields of an `ErrorResponse` (or `NoticeResponse`).
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE code, five characters.
    pub sqlstate: String,
    /// The primary human-readable error message.
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Error cursor position as an index into the original query string.
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    /// Context in which the error occurred, e.g. a call stack traceback.
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub datatype: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl ServerError {
    /// Parse the identified-field list of an error or notice body.
    ///
    /// Unrecognized field types are silently ignored, as the protocol
    /// requires.
    pub fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut err = ServerError::default();
        while body.has_remaining() {
            let code = body.get_u8();
            if code == 0 {
                break;
            }
            let value = body.get_nul_string()?;
            match code {
                b'S' => err.severity = value,
                // nonlocalized severity, prefer over 'S' when present
                b'V' => err.severity = value,
                b'C' => err.sqlstate = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = Some(value),
                b'p' => err.internal_position = Some(value),
                b'q' => err.internal_query = Some(value),
                b'W' => err.where_ = Some(value),
                b's' => err.schema = Some(value),
                b't' => err.table = Some(value),
                b'c' => err.column = Some(value),
                b'd' => err.datatype = Some(value),
                b'n' => err.constraint = Some(value),
                b'F' => err.file = Some(value),
                b'L' => err.line = Some(value),
                b'R' => err.routine = Some(value),
                _ => {}
            }
        }
        Ok(err)
    }
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut token = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            let r = write!(f, "{sep}{key}={value}");
            sep = " ";
            r
        };
        let opts = [
            ("detail", &self.detail),
            ("where", &self.where_),
            ("schema", &self.schema),
            ("table", &self.table),
            ("column", &self.column),
            ("datatype", &self.datatype),
            ("constraint", &self.constraint),
            ("internalQuery", &self.internal_query),
            ("internalPosition", &self.internal_position),
            ("position", &self.position),
            ("file", &self.file),
            ("line", &self.line),
            ("hint", &self.hint),
            ("routine", &self.routine),
        ];
        for (key, value) in opts {
            if let Some(value) = value {
                token(f, key, value)?;
            }
        }
        if !self.severity.is_empty() {
            token(f, "severity", &self.severity)?;
        }
        if !self.sqlstate.is_empty() {
            token(f, "sqlstate", &self.sqlstate)?;
        }
        if !self.message.is_empty() {
            token(f, "message", &self.message)?;
        }
        Ok(())
    }
}
