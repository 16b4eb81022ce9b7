//! Typed result events.
//!
//! Everything a statement produces flows to the consumer as a
//! [`ResultEvent`] tagged with the originating statement id.
use std::fmt;

use crate::postgres::{NotificationResponse, ServerError};
use crate::row::Row;

/// One unit of statement output.
#[derive(Debug)]
pub enum ResultEvent {
    /// Data rows, at most one fetch batch worth.
    RowBatch(RowBatch),
    /// A statement ran to completion.
    CommandStatus(CommandStatus),
    /// A statement failed. The session transaction is now aborted,
    /// but the session itself stays usable.
    Error(ErrorResult),
    /// An asynchronous notification delivered in-band.
    Notify(NotifyMessage),
}

/// Rows produced by one statement.
#[derive(Debug)]
pub struct RowBatch {
    pub statement_id: usize,
    pub rows: Vec<Row>,
}

/// Completion acknowledgment of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub statement_id: usize,
    /// The command name, `SELECT`, `INSERT`, `COPY`, ...
    pub tag: String,
    pub rows_affected: u64,
}

impl CommandStatus {
    /// Decode a `CommandComplete` tag.
    ///
    /// For an INSERT the tag is `INSERT oid rows` where oid is always 0
    /// nowadays, for the other row commands it is `NAME rows`.
    pub(crate) fn from_tag(statement_id: usize, tag: &[u8]) -> Self {
        let tag = String::from_utf8_lossy(tag);
        let mut whs = tag.split_whitespace();
        let (name, rows) = match (whs.next(), whs.next()) {
            (Some("INSERT"), _) => ("INSERT", whs.next()),
            (Some(name @ ("SELECT" | "UPDATE" | "DELETE" | "MERGE" | "FETCH" | "MOVE" | "COPY")), rows) => {
                (name, rows)
            }
            _ => {
                return Self {
                    statement_id,
                    tag: tag.into_owned(),
                    rows_affected: 0,
                };
            }
        };
        Self {
            statement_id,
            tag: name.to_owned(),
            rows_affected: rows.and_then(|r| r.parse().ok()).unwrap_or(0),
        }
    }

    /// Completion of an empty query string.
    pub(crate) fn empty(statement_id: usize) -> Self {
        Self { statement_id, tag: String::new(), rows_affected: 0 }
    }
}

/// An asynchronous notification, raised by `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    /// Process id of the notifying backend.
    pub pid: u32,
    pub channel: String,
    pub payload: String,
}

impl From<NotificationResponse> for NotifyMessage {
    fn from(msg: NotificationResponse) -> Self {
        Self { pid: msg.process_id, channel: msg.channel, payload: msg.payload }
    }
}

/// A failed statement.
///
/// Carries the full structured server error when the failure came from
/// the backend. `statement_id` is `None` when the failure is not scoped
/// to a single statement.
#[derive(Debug)]
pub struct ErrorResult {
    pub statement_id: Option<usize>,
    pub server: Option<ServerError>,
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ErrorResult {
    pub(crate) fn server(statement_id: Option<usize>, server: ServerError) -> Self {
        Self {
            statement_id,
            message: server.message.clone(),
            server: Some(server),
            cause: None,
        }
    }

    pub(crate) fn mismatch(expected: usize, got: usize) -> Self {
        Self {
            statement_id: None,
            server: None,
            message: format!("Parameter count mismatch, query declares {expected} but {got} provided"),
            cause: None,
        }
    }

    pub(crate) fn tx_aborted() -> Self {
        Self {
            statement_id: None,
            server: None,
            message: "Current transaction is aborted, commands ignored until end of transaction block".into(),
            cause: None,
        }
    }

    pub(crate) fn caused(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            statement_id: None,
            server: None,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// SQLSTATE code when the failure came from the backend.
    pub fn sqlstate(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.sqlstate.as_str())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::error::Error for ErrorResult {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match (&self.server, &self.cause) {
            (Some(server), _) => Some(server),
            (None, Some(cause)) => Some(cause.as_ref()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ErrorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => server.fmt(f),
            None => f.write_str(&self.message),
        }
    }
}
