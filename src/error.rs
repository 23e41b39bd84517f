use thiserror::Error;

/// Authentication failures. Always connection-fatal: the client is expected
/// to redirect to login, never to retry silently.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    /// The auth service could not be reached. Treated as unauthorized at the
    /// connection level, but logged separately so outages are visible.
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Failure to start a PTY-backed shell process. Tab-scoped: the tab enters a
/// failed state and the rest of the session is unaffected.
#[derive(Debug, Error)]
#[error("failed to spawn shell: {0}")]
pub struct SpawnError(pub String);

/// Input was sent to a process that has already exited. Dropped with a
/// diagnostic; surfaced to the client as a tab status change.
#[derive(Debug, Error)]
#[error("process has exited")]
pub struct DeadProcessError;

/// Tab-scoped errors. None of these take down the connection.
#[derive(Debug, Error)]
pub enum TabError {
    #[error("tab '{0}' not found")]
    NotFound(String),

    #[error("tab '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid tab id '{0}': must be non-empty alphanumeric, at most {max} chars", max = crate::session::MAX_TAB_ID_LEN)]
    InvalidTabId(String),

    #[error("session already has the maximum of {0} tabs")]
    TooManyTabs(usize),

    #[error("tab '{0}' process has exited")]
    DeadProcess(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("invalid geometry {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },
}
