//! Buffered socket transport.
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::Socket;
use crate::postgres::{BackendMessage, BackendProtocol, FrontendProtocol, ServerError, frontend};
use crate::transport::PgTransport;
use crate::{Error, Result};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered connection to postgres.
///
/// Messages pile up in the write buffer until a flush; receiving
/// flushes first, so a pipelined batch always reaches the server
/// before its responses are awaited.
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
    discarding: bool,
}

impl PgStream {
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        Ok(Self::new(Socket::connect_tcp(host, port).await?))
    }

    #[cfg(unix)]
    pub async fn connect_socket(path: &str) -> Result<Self> {
        Ok(Self::new(Socket::connect_socket(path).await?))
    }

    fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            discarding: false,
        }
    }

    /// Decode one message if a complete frame is buffered.
    fn try_frame(&mut self) -> Result<Option<BackendMessage>> {
        let Some(mut header) = self.read_buf.get(..5) else {
            self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            return Ok(None);
        };

        let msgtype = header.get_u8();
        let len = header.get_i32() as usize;

        if self.read_buf.len() - 1/*msgtype*/ < len {
            self.read_buf.reserve(1 + len);
            return Ok(None);
        }

        self.read_buf.advance(5);
        let body = self.read_buf.split_to(len - 4).freeze();

        Ok(Some(BackendMessage::decode(msgtype, body)?))
    }

    fn poll_read_socket(&mut self, cx: &mut Context) -> Poll<io::Result<usize>> {
        let n = {
            let dst = self.read_buf.chunk_mut();
            let dst = unsafe { dst.as_uninit_slice_mut() };
            let mut buf = ReadBuf::uninit(dst);
            let ptr = buf.filled().as_ptr();
            ready!(Pin::new(&mut self.socket).poll_read(cx, &mut buf)?);

            // Ensure the pointer does not change from under us
            assert_eq!(ptr, buf.filled().as_ptr());
            buf.filled().len()
        };

        // Safety: This is guaranteed to be the number of initialized (and read)
        // bytes due to the invariants provided by `ReadBuf::filled`.
        unsafe {
            self.read_buf.advance_mut(n);
        }

        Poll::Ready(Ok(n))
    }
}

impl PgTransport for PgStream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while self.write_buf.has_remaining() {
            let n = ready!(Pin::new(&mut self.socket).poll_write(cx, self.write_buf.chunk()))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.socket).poll_flush(cx)
    }

    fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        if self.write_buf.has_remaining() {
            ready!(self.poll_flush(cx)).map_err(Error::from)?;
        }

        loop {
            if let Some(msg) = self.try_frame()? {
                match msg {
                    BackendMessage::NoticeResponse(notice) => {
                        match ServerError::parse(notice.body) {
                            Ok(fields) => log::warn!("{fields}"),
                            Err(_) => log::warn!("unreadable notice from server"),
                        }
                        continue;
                    }
                    BackendMessage::ReadyForQuery(_) if self.discarding => {
                        self.discarding = false;
                        return Poll::Ready(Ok(msg));
                    }
                    msg if self.discarding => {
                        log::trace!("discarding {}", BackendMessage::message_name(msg.msgtype()));
                        continue;
                    }
                    msg => return Poll::Ready(Ok(msg)),
                }
            }

            let n = ready!(self.poll_read_socket(cx)).map_err(Error::from)?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
        }
    }

    fn ready_request(&mut self) {
        self.discarding = true;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }
}
