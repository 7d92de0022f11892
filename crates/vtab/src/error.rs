/// The error codes observable at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Error,
    Internal,
    Misuse,
    Constraint,
    NotFound,
    Unsupported,
    Range,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("constraint {constraint} failed: {message}")]
    Constraint { constraint: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("misuse: {0}")]
    Misuse(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("out of range: {0}")]
    Range(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Constraint { .. } => ErrorCode::Constraint,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Misuse(_) => ErrorCode::Misuse,
            Error::Unsupported(_) => ErrorCode::Unsupported,
            Error::Range(_) => ErrorCode::Range,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn constraint(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Constraint {
            constraint: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
