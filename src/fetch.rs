//! The execution and fetch-loop state machine.
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures_core::Stream;

use crate::{
    Error, Result,
    cache::CachedQuery,
    common::{span, verbose},
    demand::{Demand, DemandState},
    encode::{Encoded, encode_slot},
    ext::UsizeExt,
    params::Parameters,
    postgres::{BackendMessage, PgFormat, ProtocolError, ServerError, backend, frontend},
    query::Query,
    result::{CommandStatus, ErrorResult, ResultEvent, RowBatch},
    row::{Column, Row},
    session::{ExecFlags, Session, TxStatus},
    statement::{PortalName, StatementName},
    transport::PgTransport,
};

/// Event stream of one query execution.
///
/// Produced by [`Session::execute`]. Yields [`ResultEvent`]s in server
/// production order; an `Err` item is connection fatal and terminates
/// the stream.
///
/// With a positive fetch size the execution runs a cursor: rows are
/// requested in batches of at most `fetch_size`, gated by the credit
/// of the [`Demand`] handle from [`demand`][ExecuteStream::demand].
#[must_use = "streams do nothing unless polled"]
pub struct ExecuteStream<'s, IO: PgTransport> {
    session: &'s mut Session<IO>,
    query: &'s Query,
    encoded: Vec<Encoded>,
    fetch_size: u32,
    flags: ExecFlags,
    demand: Demand,

    statements: Vec<StatementName>,
    needs_parse: bool,
    persist: bool,
    cache_key: u64,

    phase: Phase,
    expect: Expect,
    /// Closes of displaced cached statements in flight, acknowledged
    /// ahead of this execution's own responses.
    pending_closes: usize,
    stmt: usize,
    begin: bool,
    started: bool,
    sent_sync: bool,
    failed: bool,
    cursor: Option<PortalName>,
    columns: Option<Arc<[Column]>>,
    row_buf: Vec<Row>,
    pending: VecDeque<ResultEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    /// Pipeline the next statement of a cursor execution, or sync.
    SendStatement,
    Flush,
    Receive,
    WaitDemand,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    BeginComplete,
    BeginReady,
    ParseComplete,
    BindComplete,
    Description,
    Rows,
    CloseComplete,
    SyncReady,
}

impl Expect {
    fn name(self) -> &'static str {
        match self {
            Expect::BeginComplete => "begin",
            Expect::BeginReady => "begin ready",
            Expect::ParseComplete => "parse",
            Expect::BindComplete => "bind",
            Expect::Description => "describe",
            Expect::Rows => "execute",
            Expect::CloseComplete => "close portal",
            Expect::SyncReady => "sync",
        }
    }
}

impl<'s, IO: PgTransport> ExecuteStream<'s, IO> {
    pub(crate) fn new(
        session: &'s mut Session<IO>,
        query: &'s Query,
        params: &Parameters,
        fetch_size: u32,
        flags: ExecFlags,
    ) -> Self {
        let persist = !flags.contains(ExecFlags::ONE_SHOT);
        let demand = match fetch_size {
            0 => Demand::unbounded(),
            _ => Demand::new(),
        };
        let mut me = Self {
            cache_key: session.cache.key(query),
            session,
            query,
            encoded: Vec::with_capacity(params.len()),
            fetch_size,
            flags,
            demand,
            statements: Vec::new(),
            needs_parse: true,
            persist,
            phase: Phase::Start,
            expect: Expect::SyncReady,
            pending_closes: 0,
            stmt: 0,
            begin: false,
            started: false,
            sent_sync: false,
            failed: false,
            cursor: None,
            columns: None,
            row_buf: Vec::new(),
            pending: VecDeque::new(),
        };

        let declared = query.parameter_count();
        if params.len() != declared {
            return me.refuse(ErrorResult::mismatch(declared, params.len()));
        }
        if me.session.tx == TxStatus::FailedTransaction {
            return me.refuse(ErrorResult::tx_aborted());
        }
        for slot in params.slots() {
            match encode_slot(slot) {
                Ok(encoded) => me.encoded.push(encoded),
                Err(err) => {
                    let msg = err.to_string();
                    return me.refuse(ErrorResult::caused(msg, err));
                }
            }
        }

        let count = query.subqueries().len();
        if persist {
            if let Some(hit) = me.session.cache.get(me.cache_key) {
                me.statements = hit.statements.clone();
                me.needs_parse = false;
            } else {
                me.statements = (0..count).map(|_| StatementName::next()).collect();
            }
        } else {
            me.statements = (0..count).map(|_| StatementName::unnamed()).collect();
        }

        me.begin = me.session.tx == TxStatus::Idle && !flags.contains(ExecFlags::SUPPRESS_BEGIN);
        me
    }

    /// Caller error before any traffic. The session stays usable.
    fn refuse(mut self, err: ErrorResult) -> Self {
        self.pending.push_back(ResultEvent::Error(err));
        self.phase = Phase::Done;
        self
    }

    /// Consumer handle granting row credit and cancellation.
    pub fn demand(&self) -> Demand {
        self.demand.clone()
    }

    /// Receive the next event.
    pub async fn try_next(&mut self) -> Result<Option<ResultEvent>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx))
            .await
            .transpose()
    }

    fn start(&mut self) {
        verbose!(
            "executing {} statement(s), fetch_size={}",
            self.query.subqueries().len(),
            self.fetch_size,
        );
        self.started = true;
        for stale in self.session.cache.take_displaced() {
            self.session.io.send(frontend::Close {
                variant: b'S',
                name: stale.as_str(),
            });
            self.pending_closes += 1;
        }
        if self.begin {
            self.session.io.send(frontend::Query { sql: "BEGIN" });
            self.expect = Expect::BeginComplete;
        } else {
            self.expect = self.statement_expect();
        }

        if self.query.subqueries().is_empty() {
            // nothing to pipeline, sync right away
            self.session.io.send(frontend::Sync);
            self.sent_sync = true;
        } else if self.fetch_size == 0 {
            for id in 0..self.query.subqueries().len() {
                self.pipeline_statement(id);
            }
            self.session.io.send(frontend::Sync);
            self.sent_sync = true;
        } else {
            self.pipeline_statement(0);
            self.session.io.send(frontend::Flush);
        }
        self.phase = Phase::Flush;
    }

    /// First response expected for a statement pipeline.
    fn statement_expect(&self) -> Expect {
        if self.query.subqueries().is_empty() {
            Expect::SyncReady
        } else if self.needs_parse {
            Expect::ParseComplete
        } else {
            Expect::BindComplete
        }
    }

    /// Send Parse (on cache miss), Bind and Describe for statement `id`,
    /// plus Execute when running without a cursor.
    fn pipeline_statement(&mut self, id: usize) {
        let statement = &self.statements[id];
        let sub = self.query.statement(id);
        let range = self.query.param_range(id);
        let params = &self.encoded[range];

        if self.needs_parse {
            self.session.io.send(frontend::Parse {
                prepare_name: statement.as_str(),
                sql: sub.sql().trim(),
                oids_len: params.len().to_u16(),
                oids: params.iter().map(Encoded::oid),
            });
        }

        let portal = match self.fetch_size {
            0 => PortalName::unnamed(),
            _ => PortalName::next(),
        };

        self.session.io.send(frontend::Bind {
            portal_name: portal.as_str(),
            stmt_name: statement.as_str(),
            param_formats_len: params.len().to_u16(),
            param_formats: params.iter().map(|p| p.format()),
            params_len: params.len().to_u16(),
            params_size_hint: params.iter().map(Encoded::size_hint).sum(),
            params: params.iter().map(|p| p.bytes()),
            result_formats_len: 1,
            result_formats: [PgFormat::Binary],
        });
        self.session.io.send(frontend::Describe {
            kind: b'P',
            name: portal.as_str(),
        });

        if self.fetch_size == 0 {
            self.session.io.send(frontend::Execute {
                portal_name: portal.as_str(),
                max_row: 0,
            });
        } else {
            self.cursor = Some(portal);
        }
    }

    /// Pipeline the next cursor statement, or sync when all are done.
    fn send_statement(&mut self) {
        if self.stmt == self.query.subqueries().len() {
            self.session.io.send(frontend::Sync);
            self.sent_sync = true;
            self.expect = Expect::SyncReady;
        } else {
            self.pipeline_statement(self.stmt);
            self.session.io.send(frontend::Flush);
            self.expect = self.statement_expect();
        }
        self.phase = Phase::Flush;
    }

    /// Request one more row batch from the open cursor.
    fn request_rows(&mut self) {
        let credit = self.demand.outstanding().min(u64::from(self.fetch_size));
        let portal = self.cursor.as_ref().map(|p| p.as_str()).unwrap_or_default();
        self.session.io.send(frontend::Execute {
            portal_name: portal,
            max_row: credit as u32,
        });
        self.session.io.send(frontend::Flush);
        self.expect = Expect::Rows;
        self.phase = Phase::Flush;
    }

    /// Close the cursor and sync without fetching the remaining rows.
    fn cancel(&mut self) {
        log::debug!("fetch cancelled, closing cursor");
        if let Some(portal) = self.cursor.take() {
            self.session.io.send(frontend::Close {
                variant: b'P',
                name: portal.as_str(),
            });
        }
        self.session.io.send(frontend::Sync);
        self.sent_sync = true;
        self.session.io.ready_request();
        self.expect = Expect::SyncReady;
        self.phase = Phase::Flush;
    }

    /// Statement failed. The server skips everything until Sync.
    fn on_error(&mut self, err: backend::ErrorResponse) -> Result<()> {
        let server = ServerError::parse(err.body)?;
        let scope = match self.expect {
            Expect::BeginComplete | Expect::BeginReady | Expect::SyncReady => None,
            _ => Some(self.stmt),
        };
        self.failed = true;
        // the server already destroyed the portal
        self.cursor = None;
        self.row_buf.clear();
        self.columns = None;
        self.pending.push_back(ResultEvent::Error(ErrorResult::server(scope, server)));
        if !self.sent_sync {
            self.session.io.send(frontend::Sync);
            self.sent_sync = true;
        }
        self.session.io.ready_request();
        self.expect = Expect::SyncReady;
        self.phase = Phase::Flush;
        Ok(())
    }

    fn emit_rows(&mut self) {
        if self.row_buf.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.row_buf);
        self.demand.consume(rows.len() as u64);
        self.pending.push_back(ResultEvent::RowBatch(RowBatch {
            statement_id: self.stmt,
            rows,
        }));
    }

    /// One statement ran to completion.
    fn on_statement_complete(&mut self, status: CommandStatus) {
        self.emit_rows();
        self.pending.push_back(ResultEvent::CommandStatus(status));
        self.columns = None;

        if self.fetch_size == 0 {
            self.stmt += 1;
            self.expect = match self.stmt == self.query.subqueries().len() {
                true => Expect::SyncReady,
                false => self.statement_expect(),
            };
        } else if let Some(portal) = self.cursor.take() {
            self.session.io.send(frontend::Close {
                variant: b'P',
                name: portal.as_str(),
            });
            self.session.io.send(frontend::Flush);
            self.expect = Expect::CloseComplete;
            self.phase = Phase::Flush;
        } else {
            self.stmt += 1;
            self.phase = Phase::SendStatement;
        }
    }

    /// The final ReadyForQuery. Transaction state lands before the
    /// stream terminates.
    fn on_sync_ready(&mut self, ack: backend::ReadyForQuery) -> Result<()> {
        self.session.tx = TxStatus::from_byte(ack.tx_status)?;
        if self.persist {
            if self.failed {
                // prepared statements of this query may have never existed
                self.session.cache.remove(self.cache_key);
            } else if self.needs_parse {
                self.session.cache.insert(self.cache_key, CachedQuery {
                    statements: self.statements.clone(),
                });
            }
        }
        self.phase = Phase::Done;
        Ok(())
    }

    fn on_message(&mut self, msg: BackendMessage) -> Result<()> {
        use BackendMessage::*;

        match (msg, self.expect) {
            // interleaved traffic, independent of the current phase
            (ParameterStatus(ps), _) => {
                log::debug!("parameter status {}={}", ps.name, ps.value);
            }
            (NotificationResponse(notify), _) => {
                self.pending.push_back(ResultEvent::Notify(notify.into()));
            }
            (NoticeResponse(notice), _) => match ServerError::parse(notice.body) {
                Ok(fields) => log::warn!("{fields}"),
                Err(_) => log::warn!("unreadable notice from server"),
            },
            (ReadyForQuery(ack), _) if self.session.stale_ready => {
                self.session.stale_ready = false;
                self.session.tx = TxStatus::from_byte(ack.tx_status)?;
            }
            // acknowledgments of the displaced-statement closes arrive
            // before this execution's own responses
            (CloseComplete(_), _) if self.pending_closes > 0 => self.pending_closes -= 1,
            (ErrorResponse(err), _) => return self.on_error(err),

            (CommandComplete(_), Expect::BeginComplete) => self.expect = Expect::BeginReady,
            (ReadyForQuery(ack), Expect::BeginReady) => {
                self.session.tx = TxStatus::from_byte(ack.tx_status)?;
                self.expect = self.statement_expect();
            }

            (ParseComplete(_), Expect::ParseComplete) => self.expect = Expect::BindComplete,
            (BindComplete(_), Expect::BindComplete) => self.expect = Expect::Description,

            (RowDescription(rd), Expect::Description) => {
                self.columns = Some(Column::parse_all(rd)?);
                match self.fetch_size {
                    0 => self.expect = Expect::Rows,
                    _ => self.phase = Phase::WaitDemand,
                }
            }
            (NoData(_), Expect::Description) => {
                self.columns = None;
                // nothing row-shaped will come back, run it right away
                match self.fetch_size {
                    0 => self.expect = Expect::Rows,
                    _ => self.request_rows_unlimited(),
                }
            }

            (DataRow(dr), Expect::Rows) => {
                if !self.flags.contains(ExecFlags::NO_RESULTS) {
                    let Some(columns) = &self.columns else {
                        return Err(ProtocolError::unexpected_phase(
                            backend::DataRow::MSGTYPE,
                            "row without description",
                        )
                        .into());
                    };
                    self.row_buf.push(Row::parse(columns.clone(), dr));
                }
            }
            (PortalSuspended(_), Expect::Rows) => {
                self.emit_rows();
                self.phase = Phase::WaitDemand;
            }
            (CommandComplete(cc), Expect::Rows) => {
                let status = CommandStatus::from_tag(self.stmt, &cc.tag);
                self.on_statement_complete(status);
            }
            (EmptyQueryResponse(_), Expect::Rows) => {
                let status = CommandStatus::empty(self.stmt);
                self.on_statement_complete(status);
            }

            (CloseComplete(_), Expect::CloseComplete) => {
                self.stmt += 1;
                self.phase = Phase::SendStatement;
            }

            (ReadyForQuery(ack), Expect::SyncReady) => return self.on_sync_ready(ack),

            (msg, expect) => {
                return Err(ProtocolError::unexpected_phase(msg.msgtype(), expect.name()).into());
            }
        }
        Ok(())
    }

    /// Execute a statement that produces no rows; demand does not gate it.
    fn request_rows_unlimited(&mut self) {
        let portal = self.cursor.as_ref().map(|p| p.as_str()).unwrap_or_default();
        self.session.io.send(frontend::Execute {
            portal_name: portal,
            max_row: 0,
        });
        self.session.io.send(frontend::Flush);
        self.expect = Expect::Rows;
        self.phase = Phase::Flush;
    }

    fn fail(&mut self, err: Error) -> Poll<Option<Result<ResultEvent>>> {
        self.session.broken = true;
        self.phase = Phase::Done;
        Poll::Ready(Some(Err(err)))
    }
}

impl<IO: PgTransport> fmt::Debug for ExecuteStream<'_, IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteStream")
            .field("phase", &self.phase)
            .field("expect", &self.expect)
            .field("stmt", &self.stmt)
            .finish_non_exhaustive()
    }
}

impl<IO: PgTransport> Stream for ExecuteStream<'_, IO> {
    type Item = Result<ResultEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        span!("execute");
        let me = self.get_mut();

        loop {
            if let Some(event) = me.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            match me.phase {
                Phase::Start => me.start(),
                Phase::SendStatement => me.send_statement(),
                Phase::Flush => {
                    if let Err(err) = ready!(me.session.io.poll_flush(cx)) {
                        return me.fail(err.into());
                    }
                    me.phase = Phase::Receive;
                }
                Phase::Receive => {
                    let msg = match ready!(me.session.io.poll_recv(cx)) {
                        Ok(msg) => msg,
                        Err(err) => return me.fail(err),
                    };
                    // on_message may redirect to Flush or WaitDemand
                    if let Err(err) = me.on_message(msg) {
                        return me.fail(err);
                    }
                }
                Phase::WaitDemand => match ready!(me.demand.poll_ready(cx)) {
                    DemandState::Ready => me.request_rows(),
                    DemandState::Cancelled => me.cancel(),
                },
                Phase::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<IO: PgTransport> Drop for ExecuteStream<'_, IO> {
    fn drop(&mut self) {
        if self.phase == Phase::Done || !self.started {
            return;
        }
        // Wind the wire protocol down so the session survives the
        // abandoned execution. The cursor close and sync stay buffered
        // until the next operation flushes.
        if let Some(portal) = self.cursor.take() {
            self.session.io.send(frontend::Close {
                variant: b'P',
                name: portal.as_str(),
            });
        }
        if !self.sent_sync {
            self.session.io.send(frontend::Sync);
        }
        self.session.io.ready_request();
        self.session.stale_ready = true;
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroUsize;
    use std::task::Waker;
    use std::time::Duration;

    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;
    use crate::cache::StatementCache;
    use crate::params::ParamValue;
    use crate::postgres::{FrontendProtocol, pg_type};
    use crate::query::SimpleQuery;
    use crate::transport::mock::MockTransport;

    fn parse_complete() -> BackendMessage {
        BackendMessage::ParseComplete(backend::ParseComplete)
    }

    fn close_complete() -> BackendMessage {
        BackendMessage::CloseComplete(backend::CloseComplete)
    }

    fn bind_complete() -> BackendMessage {
        BackendMessage::BindComplete(backend::BindComplete)
    }

    fn no_data() -> BackendMessage {
        BackendMessage::NoData(backend::NoData)
    }

    fn portal_suspended() -> BackendMessage {
        BackendMessage::PortalSuspended(backend::PortalSuspended)
    }

    fn ready(tx_status: u8) -> BackendMessage {
        BackendMessage::ReadyForQuery(backend::ReadyForQuery { tx_status })
    }

    fn complete(tag: &'static [u8]) -> BackendMessage {
        BackendMessage::CommandComplete(backend::CommandComplete {
            tag: Bytes::from_static(tag),
        })
    }

    fn int4_description() -> BackendMessage {
        let mut buf = BytesMut::new();
        buf.put(&b"v\0"[..]);
        buf.put_u32(0); // table oid
        buf.put_i16(1); // attr num
        buf.put_u32(pg_type::INT4);
        buf.put_i16(4); // typlen
        buf.put_i32(-1); // typmod
        buf.put_u16(1); // binary
        BackendMessage::RowDescription(backend::RowDescription { field_len: 1, body: buf.freeze() })
    }

    fn int4_row(value: i32) -> BackendMessage {
        let mut buf = BytesMut::new();
        buf.put_i32(4);
        buf.put_i32(value);
        BackendMessage::DataRow(backend::DataRow { column_len: 1, body: buf.freeze() })
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

    fn poll(stream: &mut ExecuteStream<'_, MockTransport>) -> Poll<Option<Result<ResultEvent>>> {
        let mut cx = Context::from_waker(Waker::noop());
        Pin::new(stream).poll_next(&mut cx)
    }

    /// Drain the stream, panicking if it stalls or fails.
    fn collect(stream: &mut ExecuteStream<'_, MockTransport>) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        loop {
            match poll(stream) {
                Poll::Ready(Some(Ok(event))) => events.push(event),
                Poll::Ready(Some(Err(err))) => panic!("stream failed: {err}"),
                Poll::Ready(None) => return events,
                Poll::Pending => panic!("stream stalled after {} event(s)", events.len()),
            }
        }
    }

    #[test]
    fn parameter_mismatch_is_rejected_without_io() {
        let mut session = Session::new(MockTransport::new());
        let query = Query::simple("SELECT $1", 1);
        let params = Parameters::new(0);

        let mut stream = session.execute(&query, &params, 0, ExecFlags::NONE);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ResultEvent::Error(err) => assert!(err.message().contains("mismatch"), "{err}"),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(session.io.sent_msgtypes().is_empty());
        assert_eq!(session.io.flush_count, 0);
    }

    #[test]
    fn unsupported_parameter_type_is_rejected_without_io() {
        let mut session = Session::new(MockTransport::new());
        let query = Query::simple("SELECT $1", 1);
        let mut params = Parameters::new(1);
        params.set_oid_value(0, 600, ParamValue::Str("point?".into()));

        let mut stream = session.execute(&query, &params, 0, ExecFlags::NONE);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ResultEvent::Error(err) => {
                assert_eq!(err.message(), "Don't know how to map param with OID 600");
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(session.io.sent_msgtypes().is_empty());
    }

    #[test]
    fn select_one_yields_one_row_batch_then_status() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(1),
            complete(b"SELECT 1"),
            ready(b'I'),
        ]));
        let query = Query::simple("SELECT 1", 0);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 2);
        match &events[0] {
            ResultEvent::RowBatch(batch) => {
                assert_eq!(batch.statement_id, 0);
                assert_eq!(batch.rows.len(), 1);
                assert_eq!(batch.rows[0].get_i32(0), Some(1));
            }
            other => panic!("expected RowBatch, got {other:?}"),
        }
        match &events[1] {
            ResultEvent::CommandStatus(status) => {
                assert_eq!(status.statement_id, 0);
                assert_eq!(status.tag, "SELECT");
                assert_eq!(status.rows_affected, 1);
            }
            other => panic!("expected CommandStatus, got {other:?}"),
        }
        assert_eq!(session.tx_status(), TxStatus::Idle);
    }

    #[test]
    fn implicit_begin_opens_a_transaction_block() {
        let mut session = Session::new(MockTransport::scripted([
            complete(b"BEGIN"),
            ready(b'T'),
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(5),
            complete(b"SELECT 1"),
            ready(b'T'),
        ]));
        let query = Query::simple("SELECT 5", 0);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 0, ExecFlags::NONE);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 2);
        assert_eq!(session.io.sent_count(frontend::Query::MSGTYPE), 1);
        assert_eq!(session.tx_status(), TxStatus::InTransaction);
    }

    #[test]
    fn combined_statements_tag_events_in_source_order() {
        let mut script = Vec::new();
        for value in [10, 20, 30] {
            script.extend([
                parse_complete(),
                bind_complete(),
                int4_description(),
                int4_row(value),
                complete(b"SELECT 1"),
            ]);
        }
        script.push(ready(b'I'));
        let mut session = Session::new(MockTransport::scripted(script));

        let query = Query::combined(vec![
            SimpleQuery::new("SELECT 10", 0),
            SimpleQuery::new("SELECT 20", 0),
            SimpleQuery::new("SELECT 30", 0),
        ]);
        let params = query.parameters();
        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        let ids: Vec<usize> = events
            .iter()
            .map(|event| match event {
                ResultEvent::RowBatch(batch) => batch.statement_id,
                ResultEvent::CommandStatus(status) => status.statement_id,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(ids, [0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn combined_set_statements_leave_the_session_idle() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            no_data(),
            complete(b"SET"),
            parse_complete(),
            bind_complete(),
            no_data(),
            complete(b"SET"),
            ready(b'I'),
        ]));
        let query = Query::combined(vec![
            SimpleQuery::new("SET x TO 1", 0),
            SimpleQuery::new("SET y TO 2", 0),
        ]);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 2);
        for (id, event) in events.iter().enumerate() {
            match event {
                ResultEvent::CommandStatus(status) => {
                    assert_eq!(status.statement_id, id);
                    assert_eq!(status.tag, "SET");
                }
                other => panic!("expected CommandStatus, got {other:?}"),
            }
        }
        assert_eq!(session.tx_status(), TxStatus::Idle);
    }

    #[test]
    fn statement_error_flows_as_data_and_aborts_the_transaction() {
        let mut session = Session::new(MockTransport::scripted([
            error_response("42601"),
            ready(b'E'),
        ]));
        let query = Query::simple("SELEC 1", 0);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ResultEvent::Error(err) => {
                assert_eq!(err.statement_id, Some(0));
                assert_eq!(err.sqlstate(), Some("42601"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(session.tx_status(), TxStatus::FailedTransaction);
        assert!(!session.is_broken());

        // further statements are refused locally until rollback
        let sent = session.io.sent_msgtypes().len();
        let mut stream = session.execute(&query, &params, 0, ExecFlags::NONE);
        let events = collect(&mut stream);
        drop(stream);
        match &events[0] {
            ResultEvent::Error(err) => assert!(err.message().contains("aborted"), "{err}"),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(session.io.sent_msgtypes().len(), sent);
    }

    #[test]
    fn fetch_loop_requests_rows_only_against_granted_demand() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            int4_description(),
        ]));
        let query = Query::simple("SELECT * FROM big", 0);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 2, ExecFlags::SUPPRESS_BEGIN);
        let demand = stream.demand();

        // no credit granted yet: suspended, no Execute on the wire
        assert!(poll(&mut stream).is_pending());
        assert_eq!(stream.session.io.sent_count(frontend::Execute::MSGTYPE), 0);

        demand.grant(2);
        stream.session.io.push(int4_row(1));
        stream.session.io.push(int4_row(2));
        stream.session.io.push(portal_suspended());
        match poll(&mut stream) {
            Poll::Ready(Some(Ok(ResultEvent::RowBatch(batch)))) => assert_eq!(batch.rows.len(), 2),
            other => panic!("expected RowBatch, got {other:?}"),
        }
        assert_eq!(stream.session.io.sent_count(frontend::Execute::MSGTYPE), 1);

        // credit consumed: suspended again rather than over-fetching
        assert!(poll(&mut stream).is_pending());
        assert_eq!(stream.session.io.sent_count(frontend::Execute::MSGTYPE), 1);

        demand.cancel();
        stream.session.io.push(ready(b'I'));
        match poll(&mut stream) {
            Poll::Ready(None) => {}
            other => panic!("expected clean end, got {other:?}"),
        }
        drop(stream);

        // cursor closed exactly once, on cancellation
        assert_eq!(session.io.sent_count(frontend::Close::MSGTYPE), 1);
        assert_eq!(session.tx_status(), TxStatus::Idle);
        assert!(!session.is_broken());
    }

    #[test]
    fn cached_statements_are_not_reparsed() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(1),
            complete(b"SELECT 1"),
            ready(b'I'),
        ]));
        let query = Query::simple("SELECT 1", 0);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        collect(&mut stream);
        drop(stream);

        // second run binds the cached statement directly
        session.io.push(bind_complete());
        session.io.push(int4_description());
        session.io.push(int4_row(1));
        session.io.push(complete(b"SELECT 1"));
        session.io.push(ready(b'I'));
        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 2);
        assert_eq!(session.io.sent_count(b'P'), 1); // a single Parse across both runs
    }

    #[test]
    fn one_shot_skips_the_cache() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(1),
            complete(b"SELECT 1"),
            ready(b'I'),
        ]));
        let query = Query::simple("SELECT 1", 0);
        let params = query.parameters();

        let flags = ExecFlags::SUPPRESS_BEGIN | ExecFlags::ONE_SHOT;
        let mut stream = session.execute(&query, &params, 0, flags);
        collect(&mut stream);
        drop(stream);

        let key = session.cache.key(&query);
        assert!(session.cache.get(key).is_none());
    }

    #[test]
    fn empty_combined_query_completes_cleanly() {
        let mut session = Session::new(MockTransport::scripted([ready(b'I')]));
        let query = Query::combined(vec![]);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        assert!(events.is_empty());
        assert_eq!(session.io.sent_count(frontend::Sync::MSGTYPE), 1);
        assert_eq!(session.tx_status(), TxStatus::Idle);
        assert!(!session.is_broken());

        // the cursor path handles the degenerate query the same way
        session.io.push(ready(b'I'));
        let mut stream = session.execute(&query, &params, 10, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);
        assert!(events.is_empty());
        assert!(!session.is_broken());
    }

    #[test]
    fn displaced_statements_are_closed_on_the_next_execution() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(1),
            complete(b"SELECT 1"),
            ready(b'I'),
        ]));
        session.cache = StatementCache::with(
            NonZeroUsize::new(1).unwrap(),
            Duration::from_secs(60),
        );

        let first = Query::simple("SELECT 1", 0);
        let params = first.parameters();
        let mut stream = session.execute(&first, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        collect(&mut stream);
        drop(stream);

        // a second distinct query displaces the first cache entry
        for msg in [
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(2),
            complete(b"SELECT 1"),
            ready(b'I'),
        ] {
            session.io.push(msg);
        }
        let second = Query::simple("SELECT 2", 0);
        let params = second.parameters();
        let mut stream = session.execute(&second, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        collect(&mut stream);
        drop(stream);
        assert_eq!(session.io.sent_count(frontend::Close::MSGTYPE), 0);

        // the next execution closes the first query's server-side statement
        for msg in [
            close_complete(),
            parse_complete(),
            bind_complete(),
            int4_description(),
            int4_row(3),
            complete(b"SELECT 1"),
            ready(b'I'),
        ] {
            session.io.push(msg);
        }
        let third = Query::simple("SELECT 3", 0);
        let params = third.parameters();
        let mut stream = session.execute(&third, &params, 0, ExecFlags::SUPPRESS_BEGIN);
        let events = collect(&mut stream);
        drop(stream);

        assert_eq!(events.len(), 2);
        assert_eq!(session.io.sent_count(frontend::Close::MSGTYPE), 1);
        assert!(!session.is_broken());
    }

    #[tokio::test]
    async fn abandoned_cursor_is_closed_and_the_session_recovers() {
        let mut session = Session::new(MockTransport::scripted([
            parse_complete(),
            bind_complete(),
            int4_description(),
        ]));
        let query = Query::simple("SELECT * FROM big", 0);
        let params = query.parameters();

        let mut stream = session.execute(&query, &params, 2, ExecFlags::SUPPRESS_BEGIN);
        assert!(poll(&mut stream).is_pending());
        drop(stream);

        // the drop buffered Close + Sync and flagged the pending ready
        assert_eq!(session.io.sent_count(frontend::Close::MSGTYPE), 1);
        assert_eq!(session.io.sent_count(frontend::Sync::MSGTYPE), 1);

        session.io.push(ready(b'I')); // of the abandoned execution
        session.io.push(complete(b"COMMIT"));
        session.io.push(ready(b'I'));
        session.commit().await.unwrap();
        assert_eq!(session.tx_status(), TxStatus::Idle);
        assert!(!session.is_broken());
    }
}
