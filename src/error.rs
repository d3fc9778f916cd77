//! Typed error surface for the public facade.
//!
//! Internal plumbing (ORT session setup, tensor wrangling) is free to use
//! [`anyhow::Error`] the way the rest of the crate's corpus does; every public
//! entry point converts into [`Status`] before returning, the same point
//! where the original C++ engine converted exceptions into `idet::Status`.

use thiserror::Error;

/// Outcome kind, mirroring `idet::Status::Code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    Unsupported,
    DecodeError,
    Internal,
    OutOfMemory,
}

/// A typed, human-readable error. Every fallible public operation returns
/// `Result<T, Status>` rather than letting an exception or panic cross the
/// library boundary.
#[derive(Debug, Error, Clone)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self { code: Code::InvalidArgument, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { code: Code::NotFound, message: message.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self { code: Code::Unsupported, message: message.into() }
    }

    pub fn decode_error(message: impl Into<String>) -> Self {
        Self { code: Code::DecodeError, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { code: Code::Internal, message: message.into() }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self { code: Code::OutOfMemory, message: message.into() }
    }

    pub fn code(&self) -> Code {
        self.code
    }
}

/// Convert an opaque internal error (usually an `ort`/IO failure wrapped in
/// `anyhow`) into an `Internal` status at a public boundary.
impl From<anyhow::Error> for Status {
    fn from(e: anyhow::Error) -> Self {
        Status::internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_includes_message() {
        let s = Status::invalid("bad dims");
        assert_eq!(s.code(), Code::InvalidArgument);
        assert!(s.to_string().contains("bad dims"));
    }

    #[test]
    fn anyhow_converts_to_internal() {
        let e: anyhow::Error = anyhow::anyhow!("ort blew up");
        let s: Status = e.into();
        assert_eq!(s.code(), Code::Internal);
        assert!(s.message.contains("ort blew up"));
    }
}
