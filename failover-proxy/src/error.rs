use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// A manager protocol command was rejected.
///
/// The display form is the exact message carried in the `Mess` header of
/// the error response.
pub enum McmpError {
    #[error("SYNTAX: JVMRoute can't be empty")]
    EmptyRoute,

    #[error("SYNTAX: Alias without Context")]
    AliasWithoutContext,

    #[error("SYNTAX: Context without Alias")]
    ContextWithoutAlias,

    #[error("SYNTAX: Invalid field \"{0}\" in message")]
    InvalidField(String),

    #[error("SYNTAX: Mandatory field(s) missing in message")]
    MissingField,

    #[error("SYNTAX: Can't decode message body")]
    MalformedBody,

    #[error("SYNTAX: Unknown command {0:?}")]
    UnknownCommand(String),

    #[error("MEM: Can't read node with \"{0}\" JVMRoute")]
    UnknownNode(String),

    #[error("{message}")]
    /// An error reported by a remote manager.
    Remote { kind: String, message: String },
}

impl McmpError {
    /// The value of the `Type` header for this error.
    pub fn kind(&self) -> &str {
        match self {
            McmpError::UnknownNode(_) => "MEM",
            McmpError::Remote { kind, .. } => kind,
            _ => "SYNTAX",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind proxy to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("The manager rejected the command: {0}")]
    Manager(#[from] McmpError),

    #[error("The proxy answered with an unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("The proxy did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Malformed cluster information: {0}")]
    MalformedInfo(String),

    #[error("No proxy has been discovered yet")]
    NoProxy,

    #[error("HTTP Error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}
