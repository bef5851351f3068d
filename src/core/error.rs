use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    Config,
    Protocol,
    NotFound,
    InvalidState,
    Cancelled,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn parse(context: impl Into<String>) -> Self {
        Error { kind: ErrorKind::Parse, context: context.into() }
    }

    pub fn config(context: impl Into<String>) -> Self {
        Error { kind: ErrorKind::Config, context: context.into() }
    }

    pub fn protocol(context: impl Into<String>) -> Self {
        Error { kind: ErrorKind::Protocol, context: context.into() }
    }

    pub fn cancelled() -> Self {
        Error { kind: ErrorKind::Cancelled, context: "cancelled".to_string() }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Protocol,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
