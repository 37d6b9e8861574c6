//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for shardcast.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardcastError(pub String);

impl ShardcastError {
    /// Builds an error from anything stringifiable.
    pub fn msg(m: impl ToString) -> Self {
        ShardcastError(m.to_string())
    }
}

impl fmt::Display for ShardcastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for ShardcastError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ShardcastError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ShardcastError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ShardcastError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::num::ParseIntError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::time::error::Elapsed);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ShardcastError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = ShardcastError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
