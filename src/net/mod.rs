//! Runtime backed sockets.
mod socket;

pub use socket::Socket;
