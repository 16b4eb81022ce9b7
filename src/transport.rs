//! The [`PgTransport`] trait.
use std::{
    io,
    task::{Context, Poll},
};

use crate::{
    Result,
    postgres::{BackendMessage, FrontendProtocol},
};

/// A buffered stream which can send and receive postgres message.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// `ErrorResponse` is a regular message here; whether it is
    /// statement data or a failure is decided by the receiver.
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>>;

    /// Request implementor to ignore all backend messages until `ReadyForQuery` is received.
    ///
    /// The `ReadyForQuery` itself is still delivered.
    fn ready_request(&mut self);

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv(&mut self) -> impl Future<Output = Result<BackendMessage>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use bytes::BytesMut;

    use super::*;
    use crate::postgres::frontend;

    /// Scripted transport.
    ///
    /// Frontend messages are recorded, backend messages replayed from
    /// a script. An empty script returns `Pending`, which stalls any
    /// test that talks to the network when it should not.
    #[derive(Debug, Default)]
    pub struct MockTransport {
        script: VecDeque<BackendMessage>,
        sent: Vec<u8>,
        write_buf: BytesMut,
        pub flush_count: usize,
        pub ready_requests: usize,
        discarding: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn scripted(script: impl IntoIterator<Item = BackendMessage>) -> Self {
            Self {
                script: script.into_iter().collect(),
                ..Self::default()
            }
        }

        pub fn push(&mut self, msg: BackendMessage) {
            self.script.push_back(msg);
        }

        /// Message type bytes of everything sent, in order.
        pub fn sent_msgtypes(&self) -> &[u8] {
            &self.sent
        }

        pub fn sent_count(&self, msgtype: u8) -> usize {
            self.sent.iter().filter(|m| **m == msgtype).count()
        }

        /// Raw bytes of every frontend message written so far.
        pub fn written(&self) -> &[u8] {
            &self.write_buf
        }
    }

    impl PgTransport for MockTransport {
        fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
            self.flush_count += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_recv(&mut self, _: &mut Context) -> Poll<Result<BackendMessage>> {
            loop {
                let Some(msg) = self.script.pop_front() else {
                    return Poll::Pending;
                };
                if self.discarding {
                    if let BackendMessage::ReadyForQuery(_) = &msg {
                        self.discarding = false;
                        return Poll::Ready(Ok(msg));
                    }
                    continue;
                }
                return Poll::Ready(Ok(msg));
            }
        }

        fn ready_request(&mut self) {
            self.ready_requests += 1;
            self.discarding = true;
        }

        fn send<F: FrontendProtocol>(&mut self, message: F) {
            self.sent.push(F::MSGTYPE);
            frontend::write(message, &mut self.write_buf);
        }
    }
}
