//! The [`Session`]: an exclusively leased connection.
use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;

use crate::{
    Error, ErrorKind, Result,
    cache::StatementCache,
    fetch::ExecuteStream,
    params::Parameters,
    postgres::{BackendMessage, ProtocolError, ServerError, frontend},
    query::{Query, SimpleQuery},
    result::{CommandStatus, ErrorResult, NotifyMessage, ResultEvent},
    transport::{PgTransport, PgTransportExt},
};

/// Backend transaction status, from every `ReadyForQuery` acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block. Statements are rejected until
    /// the block ends.
    FailedTransaction,
}

impl TxStatus {
    pub(crate) fn from_byte(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(TxStatus::Idle),
            b'T' => Ok(TxStatus::InTransaction),
            b'E' => Ok(TxStatus::FailedTransaction),
            other => Err(ProtocolError::unknown_tx_status(other)),
        }
    }
}

/// Execution behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecFlags(u8);

impl ExecFlags {
    pub const NONE: ExecFlags = ExecFlags(0);
    /// Do not open an implicit transaction block for this execution.
    pub const SUPPRESS_BEGIN: ExecFlags = ExecFlags(1);
    /// Use the unnamed prepared statement and skip the compiled cache.
    pub const ONE_SHOT: ExecFlags = ExecFlags(1 << 1);
    /// Discard data rows, deliver command statuses only.
    pub const NO_RESULTS: ExecFlags = ExecFlags(1 << 2);
    /// Fetch through a forward cursor. Implied by a positive fetch size.
    pub const FORWARD_CURSOR: ExecFlags = ExecFlags(1 << 3);

    pub fn contains(self, other: ExecFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExecFlags {
    type Output = ExecFlags;

    fn bitor(self, rhs: ExecFlags) -> ExecFlags {
        ExecFlags(self.0 | rhs.0)
    }
}

const COPY_CHUNK: usize = 64 * 1024;

/// One postgres connection running one logical execution at a time.
///
/// Built on an already-established transport; authentication and pool
/// policy live elsewhere. The session runs with autocommit off: the
/// first statement on an idle session opens a transaction block unless
/// [`SUPPRESS_BEGIN`][ExecFlags::SUPPRESS_BEGIN] asks otherwise.
pub struct Session<IO> {
    pub(crate) io: IO,
    pub(crate) cache: StatementCache,
    pub(crate) tx: TxStatus,
    pub(crate) broken: bool,
    pub(crate) notify_buf: VecDeque<NotifyMessage>,
    /// An abandoned execution left a `ReadyForQuery` in flight; the
    /// next receive treats the first one as a state update only.
    pub(crate) stale_ready: bool,
}

impl<IO: fmt::Debug> fmt::Debug for Session<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("io", &self.io)
            .field("tx", &self.tx)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<IO: PgTransport> Session<IO> {
    /// Wrap an established, authenticated transport.
    pub fn new(io: IO) -> Self {
        Self {
            io,
            cache: StatementCache::new(),
            tx: TxStatus::Idle,
            broken: false,
            notify_buf: VecDeque::new(),
            stale_ready: false,
        }
    }

    pub fn tx_status(&self) -> TxStatus {
        self.tx
    }

    /// A broken session hit a connection-fatal failure and must be
    /// discarded by its pool, never released for reuse.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Execute a query, streaming its result events.
    ///
    /// `fetch_size == 0` runs everything in a single round trip.
    /// A positive `fetch_size` drives a forward cursor per statement,
    /// gated by consumer demand; see [`ExecuteStream::demand`].
    pub fn execute<'s>(
        &'s mut self,
        query: &'s Query,
        params: &Parameters,
        fetch_size: u32,
        flags: ExecFlags,
    ) -> ExecuteStream<'s, IO> {
        ExecuteStream::new(self, query, params, fetch_size, flags)
    }

    /// Execute and collect every event, statement errors included.
    pub async fn execute_all(
        &mut self,
        query: &Query,
        params: &Parameters,
        flags: ExecFlags,
    ) -> Result<Vec<ResultEvent>> {
        let mut stream = self.execute(query, params, 0, flags);
        let mut events = Vec::new();
        while let Some(event) = stream.try_next().await? {
            events.push(event);
        }
        Ok(events)
    }

    /// Run a parameterless statement to completion, outside any
    /// transaction block.
    ///
    /// A statement failure is raised as [`Err`], unlike the streaming
    /// core which delivers it as an event.
    pub async fn run(&mut self, sql: &str) -> Result<CommandStatus> {
        let query = Query::simple(sql, 0);
        let params = query.parameters();
        let mut stream =
            ExecuteStream::new(self, &query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let mut status = None;
        let mut first_err = None;
        while let Some(event) = stream.try_next().await? {
            match event {
                ResultEvent::CommandStatus(s) => status = Some(s),
                ResultEvent::Error(e) if first_err.is_none() => first_err = Some(e),
                _ => {}
            }
        }
        drop(stream);
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(status.unwrap_or_else(|| CommandStatus::empty(0))),
        }
    }

    /// Apply run-time settings, `SET key TO value` each, in one round
    /// trip without opening a transaction block.
    ///
    /// Keys and values are interpolated verbatim; they must come from
    /// trusted configuration, not user input.
    pub async fn set_all(&mut self, settings: &[(&str, &str)]) -> Result<()> {
        let statements = settings
            .iter()
            .map(|(key, value)| SimpleQuery::new(format!("SET {key} TO {value}"), 0))
            .collect();
        let query = Query::combined(statements);
        let params = query.parameters();
        for event in self.execute_all(&query, &params, ExecFlags::SUPPRESS_BEGIN).await? {
            if let ResultEvent::Error(err) = event {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Subscribe to notification channels and stream what arrives.
    ///
    /// All `LISTEN` statements go out in one round trip without
    /// opening a transaction block. The stream runs until cancelled
    /// through [`NotifyStream::cancel_handle`][1]; the session stays
    /// usable afterwards.
    ///
    /// [1]: crate::listen::NotifyStream::cancel_handle
    #[cfg(feature = "tokio")]
    pub async fn listen(&mut self, channels: &[&str]) -> Result<crate::listen::NotifyStream<'_, IO>> {
        let statements = channels
            .iter()
            .map(|chan| SimpleQuery::new(format!("LISTEN {}", crate::listen::quote_ident(chan)), 0))
            .collect();
        let query = Query::combined(statements);
        let params = query.parameters();
        for event in self.execute_all(&query, &params, ExecFlags::SUPPRESS_BEGIN).await? {
            match event {
                ResultEvent::Error(err) => return Err(err.into()),
                // notifications can already race in during subscription
                ResultEvent::Notify(notify) => self.notify_buf.push_back(notify),
                _ => {}
            }
        }
        log::debug!("listening on {} channel(s)", channels.len());
        Ok(crate::listen::NotifyStream::new(self))
    }

    /// Commit the open transaction block. No-op when idle.
    pub async fn commit(&mut self) -> Result<()> {
        self.end_tx("COMMIT").await
    }

    /// Roll back the open transaction block, clearing a failed state.
    /// No-op when idle.
    pub async fn rollback(&mut self) -> Result<()> {
        self.end_tx("ROLLBACK").await
    }

    async fn end_tx(&mut self, sql: &'static str) -> Result<()> {
        if self.tx == TxStatus::Idle && !self.stale_ready {
            return Ok(());
        }
        log::debug!("{sql}");
        self.io.send(frontend::Query { sql });
        self.flush_io().await?;
        match self.drain_to_ready().await? {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Bulk load through `COPY ... FROM STDIN`.
    ///
    /// The source is streamed in 64 KiB chunks. A refused command or a
    /// failing source surfaces as a [`ResultEvent::Error`] and leaves
    /// the session usable; transport failures are connection fatal.
    #[cfg(feature = "tokio")]
    pub async fn copy_in<R>(&mut self, command: &str, mut source: R) -> Result<ResultEvent>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        if self.tx == TxStatus::FailedTransaction {
            return Ok(ResultEvent::Error(ErrorResult::tx_aborted()));
        }

        self.io.send(frontend::Query { sql: command });
        self.flush_io().await?;

        // the server either opens the copy stream or refuses the command
        loop {
            match self.recv_msg().await? {
                BackendMessage::CopyInResponse(_) => break,
                BackendMessage::ErrorResponse(err) => {
                    let refused = ErrorResult::server(None, ServerError::parse(err.body)?);
                    self.drain_to_ready().await?;
                    return Ok(ResultEvent::Error(refused));
                }
                msg => self.background(msg)?,
            }
        }

        let mut chunk = bytes::BytesMut::with_capacity(COPY_CHUNK);
        let mut copied = 0u64;
        loop {
            chunk.clear();
            match source.read_buf(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    copied += n as u64;
                    self.io.send(frontend::CopyData { data: &chunk });
                    self.flush_io().await?;
                }
                Err(err) => {
                    log::warn!("copy source failed after {copied} bytes: {err}");
                    self.io.send(frontend::CopyFail { message: "copy source failed" });
                    self.flush_io().await?;
                    self.drain_to_ready().await?;
                    return Ok(ResultEvent::Error(ErrorResult::caused(
                        "copy source failed",
                        err,
                    )));
                }
            }
        }

        self.io.send(frontend::CopyDone);
        self.flush_io().await?;
        log::debug!("copy finished, {copied} bytes sent");

        let mut status = None;
        let mut failure = None;
        loop {
            match self.recv_msg().await? {
                BackendMessage::CommandComplete(cc) => {
                    status = Some(CommandStatus::from_tag(0, &cc.tag));
                }
                BackendMessage::ErrorResponse(err) => {
                    failure = Some(ErrorResult::server(None, ServerError::parse(err.body)?));
                }
                BackendMessage::ReadyForQuery(ack) => {
                    self.tx = TxStatus::from_byte(ack.tx_status)?;
                    break;
                }
                msg => self.background(msg)?,
            }
        }
        match (failure, status) {
            (Some(err), _) => Ok(ResultEvent::Error(err)),
            (None, Some(status)) => Ok(ResultEvent::CommandStatus(status)),
            (None, None) => {
                self.broken = true;
                Err(ProtocolError::unexpected_phase(b'Z', "copy completion").into())
            }
        }
    }

    /// Swallow everything until `ReadyForQuery`, keeping the first
    /// statement error and buffering notifications.
    pub(crate) async fn drain_to_ready(&mut self) -> Result<Option<ErrorResult>> {
        let mut first_err = None;
        loop {
            match self.recv_msg().await? {
                BackendMessage::ReadyForQuery(ack) => {
                    self.tx = TxStatus::from_byte(ack.tx_status)?;
                    if self.stale_ready {
                        self.stale_ready = false;
                        continue;
                    }
                    return Ok(first_err);
                }
                BackendMessage::ErrorResponse(err) => {
                    if first_err.is_none() {
                        first_err = Some(ErrorResult::server(None, ServerError::parse(err.body)?));
                    }
                }
                msg => self.background(msg)?,
            }
        }
    }

    /// Handle traffic that can interleave with any response cycle.
    fn background(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::NotificationResponse(notify) => {
                self.notify_buf.push_back(notify.into());
            }
            BackendMessage::ParameterStatus(ps) => {
                log::debug!("parameter status {}={}", ps.name, ps.value);
            }
            BackendMessage::NoticeResponse(notice) => match ServerError::parse(notice.body) {
                Ok(fields) => log::warn!("{fields}"),
                Err(_) => log::warn!("unreadable notice from server"),
            },
            // response messages of statements we are not collecting
            _ => {}
        }
        Ok(())
    }

    async fn flush_io(&mut self) -> Result<()> {
        match self.io.flush().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.broken = true;
                Err(Error::with_context(ErrorKind::Io(err), "flushing the query pipeline"))
            }
        }
    }

    pub(crate) async fn recv_msg(&mut self) -> Result<BackendMessage> {
        match self.io.recv().await {
            Ok(msg) => Ok(msg),
            Err(err) => {
                self.broken = true;
                Err(err)
            }
        }
    }
}

impl<IO> Session<IO> {
    /// Next buffered notification, if any arrived in-band.
    pub(crate) fn pop_notification(&mut self) -> Option<NotifyMessage> {
        self.notify_buf.pop_front()
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::postgres::{FrontendProtocol, backend};
    use crate::transport::mock::MockTransport;

    fn ready(tx_status: u8) -> BackendMessage {
        BackendMessage::ReadyForQuery(backend::ReadyForQuery { tx_status })
    }

    fn complete(tag: &'static [u8]) -> BackendMessage {
        BackendMessage::CommandComplete(backend::CommandComplete {
            tag: Bytes::from_static(tag),
        })
    }

    fn error_response(sqlstate: &str) -> BackendMessage {
        let mut body = Vec::new();
        for (code, value) in [(b'S', "ERROR"), (b'C', sqlstate), (b'M', "nope")] {
            body.push(code);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        BackendMessage::ErrorResponse(backend::ErrorResponse { body: body.into() })
    }

    fn copy_in_response() -> BackendMessage {
        BackendMessage::CopyInResponse(backend::CopyInResponse {
            format: 0,
            column_len: 1,
            column_formats: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn commit_when_idle_is_a_noop() {
        let mut session = Session::new(MockTransport::new());
        session.commit().await.unwrap();
        session.commit().await.unwrap();
        assert!(session.io.sent_msgtypes().is_empty());
        assert_eq!(session.tx_status(), TxStatus::Idle);
    }

    #[tokio::test]
    async fn rollback_clears_a_failed_transaction() {
        let mut session = Session::new(MockTransport::scripted([
            complete(b"ROLLBACK"),
            ready(b'I'),
        ]));
        session.tx = TxStatus::FailedTransaction;
        session.rollback().await.unwrap();
        assert_eq!(session.tx_status(), TxStatus::Idle);
        assert_eq!(session.io.sent_count(frontend::Query::MSGTYPE), 1);
    }

    #[tokio::test]
    async fn run_stays_outside_a_transaction_block() {
        let mut session = Session::new(MockTransport::scripted([
            BackendMessage::ParseComplete(backend::ParseComplete),
            BackendMessage::BindComplete(backend::BindComplete),
            BackendMessage::NoData(backend::NoData),
            complete(b"CREATE TABLE"),
            ready(b'I'),
        ]));
        let status = session.run("CREATE TABLE t (id int4)").await.unwrap();
        assert_eq!(status.tag, "CREATE TABLE");
        // no simple-query BEGIN went out, the session stays idle
        assert_eq!(session.io.sent_count(frontend::Query::MSGTYPE), 0);
        assert_eq!(session.tx_status(), TxStatus::Idle);
    }

    #[tokio::test]
    async fn run_raises_the_first_statement_error() {
        let mut session = Session::new(MockTransport::scripted([
            error_response("42P01"),
            ready(b'I'),
        ]));
        let err = session.run("SELECT * FROM missing").await.unwrap_err();
        assert!(err.to_string().contains("42P01"), "{err}");
        assert_eq!(session.tx_status(), TxStatus::Idle);
        assert!(!session.is_broken());
    }

    #[tokio::test]
    async fn set_all_runs_without_a_transaction_block() {
        let mut session = Session::new(MockTransport::scripted([
            BackendMessage::ParseComplete(backend::ParseComplete),
            BackendMessage::BindComplete(backend::BindComplete),
            BackendMessage::NoData(backend::NoData),
            complete(b"SET"),
            BackendMessage::ParseComplete(backend::ParseComplete),
            BackendMessage::BindComplete(backend::BindComplete),
            BackendMessage::NoData(backend::NoData),
            complete(b"SET"),
            ready(b'I'),
        ]));
        session
            .set_all(&[("statement_timeout", "'5s'"), ("search_path", "app")])
            .await
            .unwrap();
        assert_eq!(session.tx_status(), TxStatus::Idle);
        // no simple-query BEGIN went out
        assert_eq!(session.io.sent_count(frontend::Query::MSGTYPE), 0);
    }

    #[tokio::test]
    async fn copy_in_streams_source_and_reports_row_count() {
        let mut session = Session::new(MockTransport::scripted([
            copy_in_response(),
            complete(b"COPY 3"),
            ready(b'I'),
        ]));
        let event = session
            .copy_in("COPY t FROM STDIN", &b"a\nb\nc\n"[..])
            .await
            .unwrap();
        match event {
            ResultEvent::CommandStatus(status) => {
                assert_eq!(status.tag, "COPY");
                assert_eq!(status.rows_affected, 3);
            }
            other => panic!("expected CommandStatus, got {other:?}"),
        }
        assert!(session.io.sent_count(frontend::CopyData::MSGTYPE) >= 1);
        assert_eq!(session.io.sent_count(frontend::CopyDone::MSGTYPE), 1);
        assert!(!session.is_broken());
    }

    #[tokio::test]
    async fn refused_copy_command_is_a_statement_error() {
        let mut session = Session::new(MockTransport::scripted([
            error_response("42601"),
            ready(b'I'),
        ]));
        let event = session
            .copy_in("COPY nowhere FROM STDIN", &b"x"[..])
            .await
            .unwrap();
        match event {
            ResultEvent::Error(err) => assert_eq!(err.sqlstate(), Some("42601")),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(session.io.sent_count(frontend::CopyData::MSGTYPE), 0);
        assert!(!session.is_broken());
    }

    #[tokio::test]
    async fn failing_copy_source_sends_copy_fail() {
        use std::pin::Pin;
        use std::task::{Context, Poll};

        struct BrokenReader;

        impl tokio::io::AsyncRead for BrokenReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _: &mut Context<'_>,
                _: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
            }
        }

        let mut session = Session::new(MockTransport::scripted([
            copy_in_response(),
            ready(b'I'),
        ]));
        let event = session
            .copy_in("COPY t FROM STDIN", BrokenReader)
            .await
            .unwrap();
        match event {
            ResultEvent::Error(err) => assert_eq!(err.message(), "copy source failed"),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(session.io.sent_count(frontend::CopyFail::MSGTYPE), 1);
        assert_eq!(session.io.sent_count(frontend::CopyDone::MSGTYPE), 0);
        assert!(!session.is_broken());
    }
}
