// Errors surfaced by connection operations
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnError>;

#[derive(Debug, Error)]
pub enum ConnError {
    /// Operation attempted after `close()`.
    #[error("connection is closed")]
    Closed,

    /// `accept` called on a handle that is not in the listening role.
    #[error("connection is not a listening endpoint")]
    NotListening,

    /// The underlying socket call failed.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("write accepted zero bytes")]
    WriteZero,

    #[error("stream ended after {received} of {expected} bytes")]
    UnexpectedEof { received: usize, expected: usize },
}

impl ConnError {
    pub(crate) fn io(op: &'static str, source: impl Into<io::Error>) -> Self {
        ConnError::Io {
            op,
            source: source.into(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::Closed)
    }

    /// OS error kind for transport failures, if any.
    pub fn kind(&self) -> Option<io::ErrorKind> {
        match self {
            ConnError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
