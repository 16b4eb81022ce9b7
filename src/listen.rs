//! Asynchronous notification listener.
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker, ready};
use std::time::Duration;

use futures_core::Stream;
use tokio::time::{Instant, Sleep, sleep};

use crate::{
    Result,
    common::{span, verbose},
    postgres::{BackendMessage, ProtocolError, ServerError},
    result::{ErrorResult, NotifyMessage},
    session::{Session, TxStatus},
    transport::PgTransport,
};

/// Upper bound on cancellation latency while no traffic arrives.
const POLL_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct CancelState {
    cancelled: bool,
    waker: Option<Waker>,
}

fn lock(state: &Mutex<CancelState>) -> MutexGuard<'_, CancelState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Ends a [`NotifyStream`] from anywhere.
///
/// Obtained from [`NotifyStream::cancel_handle`]. Cloned handles
/// cancel the same stream.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<Mutex<CancelState>>,
}

impl CancelHandle {
    /// End the stream.
    ///
    /// Wakes a suspended listener immediately instead of waiting for
    /// the next re-check tick. The session stays usable for further
    /// commands afterwards.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.cancelled = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

/// Stream of asynchronous notifications on subscribed channels.
///
/// Produced by [`Session::listen`]. Runs until cancelled through its
/// [`CancelHandle`] or until a connection-fatal failure; cancellation
/// ends the stream cleanly with `None`.
#[must_use = "streams do nothing unless polled"]
pub struct NotifyStream<'s, IO: PgTransport> {
    session: &'s mut Session<IO>,
    state: Arc<Mutex<CancelState>>,
    tick: Pin<Box<Sleep>>,
}

impl<IO: PgTransport> fmt::Debug for NotifyStream<'_, IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyStream").finish_non_exhaustive()
    }
}

impl<'s, IO: PgTransport> NotifyStream<'s, IO> {
    pub(crate) fn new(session: &'s mut Session<IO>) -> Self {
        Self {
            session,
            state: Arc::default(),
            tick: Box::pin(sleep(POLL_TICK)),
        }
    }

    /// Handle to end this stream.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { state: self.state.clone() }
    }

    /// Receive the next notification.
    pub async fn try_next(&mut self) -> Result<Option<NotifyMessage>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx))
            .await
            .transpose()
    }

    fn fail(&mut self, err: crate::Error) -> Poll<Option<Result<NotifyMessage>>> {
        self.session.broken = true;
        Poll::Ready(Some(Err(err)))
    }
}

impl<IO: PgTransport> Stream for NotifyStream<'_, IO> {
    type Item = Result<NotifyMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        span!("listen");
        let me = self.get_mut();

        loop {
            {
                let mut state = lock(&me.state);
                if state.cancelled {
                    verbose!("notification stream cancelled");
                    return Poll::Ready(None);
                }
                match &mut state.waker {
                    Some(waker) => waker.clone_from(cx.waker()),
                    None => state.waker = Some(cx.waker().clone()),
                }
            }

            if let Some(notify) = me.session.pop_notification() {
                return Poll::Ready(Some(Ok(notify)));
            }

            match me.session.io.poll_recv(cx) {
                Poll::Ready(Ok(BackendMessage::NotificationResponse(notify))) => {
                    verbose!("notification on {}", notify.channel);
                    return Poll::Ready(Some(Ok(notify.into())));
                }
                Poll::Ready(Ok(BackendMessage::ReadyForQuery(ack))) => {
                    me.session.stale_ready = false;
                    match TxStatus::from_byte(ack.tx_status) {
                        Ok(tx) => me.session.tx = tx,
                        Err(err) => return me.fail(err.into()),
                    }
                }
                Poll::Ready(Ok(BackendMessage::ParameterStatus(ps))) => {
                    log::debug!("parameter status {}={}", ps.name, ps.value);
                }
                Poll::Ready(Ok(BackendMessage::NoticeResponse(notice))) => {
                    match ServerError::parse(notice.body) {
                        Ok(fields) => log::warn!("{fields}"),
                        Err(_) => log::warn!("unreadable notice from server"),
                    }
                }
                Poll::Ready(Ok(BackendMessage::ErrorResponse(err))) => {
                    // an error outside a query cycle means the backend
                    // is going away, treat it as connection fatal
                    let err = match ServerError::parse(err.body) {
                        Ok(server) => ErrorResult::server(None, server).into(),
                        Err(err) => err.into(),
                    };
                    return me.fail(err);
                }
                Poll::Ready(Ok(msg)) => {
                    return me.fail(
                        ProtocolError::unexpected_phase(msg.msgtype(), "listen").into(),
                    );
                }
                Poll::Ready(Err(err)) => return me.fail(err),
                Poll::Pending => {
                    // re-check cancellation at a bounded interval even
                    // if the socket stays silent
                    ready!(me.tick.as_mut().poll(cx));
                    me.tick.as_mut().reset(Instant::now() + POLL_TICK);
                }
            }
        }
    }
}

/// Double-quote a channel identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::postgres::backend;
    use crate::transport::mock::MockTransport;

    fn subscription_script() -> Vec<BackendMessage> {
        vec![
            BackendMessage::ParseComplete(backend::ParseComplete),
            BackendMessage::BindComplete(backend::BindComplete),
            BackendMessage::NoData(backend::NoData),
            BackendMessage::CommandComplete(backend::CommandComplete {
                tag: Bytes::from_static(b"LISTEN"),
            }),
            BackendMessage::ReadyForQuery(backend::ReadyForQuery { tx_status: b'I' }),
        ]
    }

    fn notification(channel: &str, payload: &str) -> BackendMessage {
        BackendMessage::NotificationResponse(backend::NotificationResponse {
            process_id: 4242,
            channel: channel.into(),
            payload: payload.into(),
        })
    }

    #[test]
    fn idents_are_quoted_and_escaped() {
        assert_eq!(quote_ident("jobs"), "\"jobs\"");
        assert_eq!(quote_ident("odd\"chan"), "\"odd\"\"chan\"");
    }

    #[tokio::test]
    async fn yields_notifications_until_cancelled() {
        let mut script = subscription_script();
        script.push(notification("jobs", "42"));
        let mut session = Session::new(MockTransport::scripted(script));

        let mut stream = session.listen(&["jobs"]).await.unwrap();
        let cancel = stream.cancel_handle();

        let msg = stream.try_next().await.unwrap().unwrap();
        assert_eq!(msg.channel, "jobs");
        assert_eq!(msg.payload, "42");
        assert_eq!(msg.pid, 4242);

        cancel.cancel();
        assert!(stream.try_next().await.unwrap().is_none());
        drop(stream);

        // subscription went out quoted, and the session is still fine
        let written = String::from_utf8_lossy(session.io.written()).into_owned();
        assert!(written.contains("LISTEN \"jobs\""), "{written}");
        assert!(!session.is_broken());
    }

    #[tokio::test]
    async fn failed_subscription_is_an_error() {
        let mut body = Vec::new();
        for (code, value) in [(b'S', "ERROR"), (b'C', "42601"), (b'M', "syntax error")] {
            body.push(code);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        let mut session = Session::new(MockTransport::scripted([
            BackendMessage::ErrorResponse(backend::ErrorResponse { body: body.into() }),
            BackendMessage::ReadyForQuery(backend::ReadyForQuery { tx_status: b'I' }),
        ]));

        let err = session.listen(&["jobs"]).await.unwrap_err();
        assert!(err.to_string().contains("syntax error"), "{err}");
        assert!(!session.is_broken());
    }

    #[tokio::test]
    async fn transport_failure_terminates_the_stream() {
        let mut session = Session::new(MockTransport::scripted(subscription_script()));
        let mut stream = session.listen(&["jobs"]).await.unwrap();
        // a row outside any query cycle is a protocol desync
        stream.session.io.push(BackendMessage::DataRow(backend::DataRow {
            column_len: 0,
            body: Bytes::new(),
        }));
        assert!(stream.try_next().await.is_err());
        drop(stream);
        assert!(session.is_broken());
    }
}
