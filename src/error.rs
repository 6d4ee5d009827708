// This file is part of qnet-arbiter.

//! Error kinds shared across the arbiter, and helpers for wrapping foreign errors.

use std::error::Error;
use std::fmt;

/// Top-level error kind, following the taxonomy the arbiter's error handling policy is built
/// around: each kind maps to a specific disposition (skip-and-reply, reply-and-disconnect,
/// disconnect-silently, or abort).
#[derive(Debug)]
pub enum ArbiterError {
    BadArgument(String),
    ResourceExhausted(String),
    ProtocolViolation(String),
    OversizeMessage(usize),
    Io(std::io::Error),
    Tls(rustls::TLSError),
    DpdTimeout,
    AdmissionDenied,
    InternalInvariant(String),
}

impl fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArbiterError::BadArgument(msg) => write!(f, "bad argument: {}", msg),
            ArbiterError::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            ArbiterError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            ArbiterError::OversizeMessage(len) => write!(f, "oversize message: {} bytes", len),
            ArbiterError::Io(err) => write!(f, "io error: {}", err),
            ArbiterError::Tls(err) => write!(f, "tls error: {}", err),
            ArbiterError::DpdTimeout => write!(f, "dead-peer-detection timeout"),
            ArbiterError::AdmissionDenied => write!(f, "admission denied"),
            ArbiterError::InternalInvariant(msg) => write!(f, "internal invariant violated: {}", msg),
        }
    }
}

impl Error for ArbiterError {}

impl From<std::io::Error> for ArbiterError {
    fn from(err: std::io::Error) -> ArbiterError {
        ArbiterError::Io(err)
    }
}

impl From<rustls::TLSError> for ArbiterError {
    fn from(err: rustls::TLSError) -> ArbiterError {
        ArbiterError::Tls(err)
    }
}

impl From<nix::Error> for ArbiterError {
    fn from(err: nix::Error) -> ArbiterError {
        ArbiterError::InternalInvariant(format!("signal setup failed: {}", err))
    }
}

/// `WrapError` allows the implementor to wrap its own error type in another error type.
pub trait WrapError<T: Error> {
    type Item;

    fn wrap_err(self) -> Result<Self::Item, T>;
}

/// Wrap any `'static` error into `config::ConfigError::Foreign`, the same way cfnts's
/// `error.rs` does it for file-reading errors encountered while parsing a config.
impl<S, T> WrapError<config::ConfigError> for Result<S, T>
where
    T: 'static + Error + Send + Sync,
{
    type Item = S;

    fn wrap_err(self) -> Result<S, config::ConfigError> {
        self.map_err(|error| config::ConfigError::Foreign(Box::new(error)))
    }
}

/// Wrap any `'static` error into `std::io::Error`.
impl<S, T> WrapError<std::io::Error> for Result<S, T>
where
    T: 'static + Error + Send + Sync,
{
    type Item = S;

    fn wrap_err(self) -> Result<S, std::io::Error> {
        self.map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))
    }
}
