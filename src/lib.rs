//! Streaming postgres connection execution engine.
//!
//! Callers submit one or more parameterized statements to an
//! exclusively leased [`Session`] and drain typed [`ResultEvent`]s:
//! row batches, command completions, structured statement errors and
//! asynchronous notifications. With a positive fetch size the rows
//! come through a server side cursor gated by consumer [`Demand`], so
//! the engine never pulls more data than the consumer asked for.
//!
//! Authentication, TLS and pool policy live elsewhere; a session wraps
//! an already established transport.
//!
//! # Examples
//!
//! ```no_run
//! use pgriver::{ExecFlags, PgStream, Query, Session};
//!
//! # async fn app() -> pgriver::Result<()> {
//! let io = PgStream::connect_tcp("localhost", 5432).await?;
//! let mut session = Session::new(io);
//!
//! let query = Query::simple("SELECT id, note FROM todo WHERE id = $1", 1);
//! let mut params = query.parameters();
//! params.set_int(0, 7);
//!
//! let mut stream = session.execute(&query, &params, 0, ExecFlags::NONE);
//! while let Some(event) = stream.try_next().await? {
//!     println!("{event:?}");
//! }
//! drop(stream);
//!
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Streaming fetch with backpressure:
//!
//! ```no_run
//! use pgriver::{ExecFlags, PgStream, Query, Session};
//!
//! # async fn app() -> pgriver::Result<()> {
//! # let mut session = Session::new(PgStream::connect_tcp("localhost", 5432).await?);
//! let query = Query::simple("SELECT * FROM big_table", 0);
//! let params = query.parameters();
//!
//! let mut stream = session.execute(&query, &params, 500, ExecFlags::NONE);
//! let demand = stream.demand();
//!
//! demand.grant(1000);
//! while let Some(event) = stream.try_next().await? {
//!     // consume, granting more credit as capacity frees up
//! }
//! # Ok(())
//! # }
//! ```

mod common;
mod ext;

// Protocol
pub mod postgres;

// Query model
pub mod query;
pub mod params;
pub mod encode;

// Component
mod statement;
mod cache;
pub mod row;
pub mod result;
pub mod demand;

// Operation
pub mod transport;
pub mod fetch;
pub mod session;
#[cfg(feature = "tokio")]
pub mod listen;
pub mod pool;

// Connection
#[cfg(feature = "tokio")]
mod net;
#[cfg(feature = "tokio")]
pub mod stream;

mod error;

pub use demand::Demand;
pub use error::{Error, ErrorKind, Result};
pub use fetch::ExecuteStream;
#[cfg(feature = "tokio")]
pub use listen::{CancelHandle, NotifyStream};
pub use params::{ParamValue, Parameters};
pub use pool::SessionPool;
pub use query::{Query, SimpleQuery};
pub use result::{CommandStatus, ErrorResult, NotifyMessage, ResultEvent, RowBatch};
pub use row::{Column, Row};
pub use session::{ExecFlags, Session, TxStatus};
#[cfg(feature = "tokio")]
pub use stream::PgStream;
pub use transport::{PgTransport, PgTransportExt};
