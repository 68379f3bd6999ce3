use thiserror::Error;

/// Terminal status reported to a peer when its stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Canceled,
    Unauthenticated,
    NotFound,
    FailedPrecondition,
    Internal,
}

impl StatusCode {
    /// WebSocket close code carrying this status (RFC 6455 application range).
    pub fn close_code(self) -> u16 {
        match self {
            StatusCode::Ok | StatusCode::Canceled => 1000,
            StatusCode::Unauthenticated => 4001,
            StatusCode::NotFound => 4004,
            StatusCode::FailedPrecondition => 4009,
            StatusCode::Internal => 4500,
        }
    }

    /// Inverse of [`StatusCode::close_code`]; unknown codes map to `Internal`.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1000 | 1001 => StatusCode::Ok,
            4001 => StatusCode::Unauthenticated,
            4004 => StatusCode::NotFound,
            4009 => StatusCode::FailedPrecondition,
            _ => StatusCode::Internal,
        }
    }
}

/// Errors produced by the gateway and its protocol layer.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Peer-initiated graceful teardown.
    #[error("canceled")]
    Canceled,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Status code a peer sees for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            GateError::Unauthenticated(_) => StatusCode::Unauthenticated,
            GateError::NotFound(_) => StatusCode::NotFound,
            GateError::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            GateError::Canceled => StatusCode::Canceled,
            GateError::Internal(_)
            | GateError::Codec(_)
            | GateError::Transport(_)
            | GateError::Config(_)
            | GateError::Io(_) => StatusCode::Internal,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for GateError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        GateError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for GateError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        GateError::Codec(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;
