//! The [`SessionPool`] collaborator contract.
use crate::{Result, session::Session, transport::PgTransport};

/// Source of exclusively leased [`Session`]s.
///
/// A session runs one logical execution at a time and is not
/// reentrant; an implementor enforces that by leasing each session to
/// exactly one caller until it is given back. Pool sizing and
/// acquisition policy are entirely the implementor's business, the
/// engine only requires the leasing discipline.
pub trait SessionPool {
    /// Transport of the pooled sessions.
    type Transport: PgTransport;

    /// Lease a session for exclusive use.
    fn lease(&mut self) -> impl Future<Output = Result<Session<Self::Transport>>>;

    /// Return a healthy session for reuse.
    fn release(&mut self, session: Session<Self::Transport>);

    /// Drop a session for good.
    ///
    /// Required when [`is_broken`][Session::is_broken] reports a
    /// connection-fatal failure; a broken session must never be
    /// released back for reuse.
    fn discard(&mut self, session: Session<Self::Transport>);

    /// Route a finished session by health.
    fn give_back(&mut self, session: Session<Self::Transport>) {
        match session.is_broken() {
            true => self.discard(session),
            false => self.release(session),
        }
    }
}
