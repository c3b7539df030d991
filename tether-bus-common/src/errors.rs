use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("Failed to connect to the bus: {0}")]
    Connection(String),
    #[error("Failed to register connection handlers: {0}")]
    Registration(String),
    #[error("Failed to append message argument: {0}")]
    Serialization(String),
    #[error("Can't convert {found} into {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
    #[error("No more arguments in the message")]
    EndOfArguments,
    #[error("Connection is closed")]
    Closed,
    #[error("No reply received")]
    NoReply,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Callback failed: {0}")]
    Callback(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// D-Bus error name used when the error is sent back as a method reply
    pub fn dbus_name(&self) -> &str {
        match self {
            Error::Remote { name, .. } => name,
            Error::NoReply => crate::ERROR_NO_REPLY,
            Error::InvalidArgument(_) | Error::TypeMismatch { .. } | Error::EndOfArguments => {
                crate::ERROR_INVALID_ARGS
            }
            _ => crate::ERROR_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
