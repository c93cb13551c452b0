use std::time::Duration;

/// Errors reported by the protocol codec and the request/response engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request of the same kind is still waiting for its response.
    #[error("a request of this kind is already pending")]
    Busy,
    /// The device did not answer within the configured timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The response checksum does not match the one calculated over its payload.
    #[error("checksum mismatch - calculated={calculated} received={received}")]
    ChecksumMismatch {
        calculated: String,
        received: String,
    },
    /// The response is too short to carry the fixed frame header.
    #[error("invalid frame: {0:?}")]
    InvalidFrame(String),
    /// The checksum is valid but a payload field could not be parsed.
    #[error("malformed payload at field '{0}'")]
    MalformedPayload(&'static str),
    /// Device addresses are limited to 0..=15.
    #[error("invalid device address {0}")]
    InvalidAddress(u8),
    /// The transport has not been opened yet or was closed.
    #[error("transport is not open")]
    NotOpen,
    /// An I/O error from the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate while opening the port.
    #[cfg(feature = "tokio-serial-async")]
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
}
