//! Session capability table
//!
//! What each session kind may do is a fixed table keyed by [`SessionKind`].
//! Every session entry point checks it before touching shared state.

use protocol::{CoordinatorError, SessionKind, SessionRef};
use std::fmt;
use tracing::warn;

/// Operation a session can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListDevices,
    GrantAccess,
    RevokeAccess,
    Open,
    SelectConfiguration,
    ClaimInterface,
    ReleaseInterface,
    Close,
    Transfer,
    Subscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ListDevices => "list devices",
            Operation::GrantAccess => "grant access",
            Operation::RevokeAccess => "revoke access",
            Operation::Open => "open",
            Operation::SelectConfiguration => "select configuration",
            Operation::ClaimInterface => "claim interface",
            Operation::ReleaseInterface => "release interface",
            Operation::Close => "close",
            Operation::Transfer => "transfer",
            Operation::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

/// Operations every session kind may use
const COMMON: &[Operation] = &[
    Operation::ListDevices,
    Operation::Open,
    Operation::SelectConfiguration,
    Operation::ClaimInterface,
    Operation::ReleaseInterface,
    Operation::Close,
    Operation::Transfer,
    Operation::Subscribe,
];

/// Operations reserved for privileged (page) sessions
const PRIVILEGED: &[Operation] = &[Operation::GrantAccess, Operation::RevokeAccess];

/// Whether `kind` may perform `operation`
pub fn allows(kind: SessionKind, operation: Operation) -> bool {
    if COMMON.contains(&operation) {
        return true;
    }
    match kind {
        SessionKind::Window => PRIVILEGED.contains(&operation),
        SessionKind::DedicatedWorker | SessionKind::SharedWorkerPort => false,
    }
}

/// Check a session against the table
pub fn check(session: SessionRef, operation: Operation) -> Result<(), CoordinatorError> {
    if allows(session.kind, operation) {
        return Ok(());
    }

    warn!(
        "Session {} ({}) attempted {} without the capability",
        session.id.0, session.kind, operation
    );
    Err(CoordinatorError::unauthorized(format!(
        "{} sessions may not {}",
        session.kind, operation
    )))
}
