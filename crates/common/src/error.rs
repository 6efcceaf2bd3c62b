#![allow(clippy::uninlined_format_args)]

//! Error related data structures to be shared and used.
//!
//! This module contains the [`Error`] enum, which is used to represent
//! the errors that can surface at the core API boundary. Internal
//! components never propagate these: they apply a defined fallback and
//! only the top-level API (ROM loading, save state load) returns them.

use std::fmt::{self, Display, Formatter};
use std::io;

/// Top level enum for error handling within the core.
///
/// Most of the time, you will want to use the `CustomError` variant
/// to provide a more detailed error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// ROM size outside the supported range, or header checksum
    /// mismatch. Diagnostic only, execution may proceed regardless.
    RomInvalid,
    /// Save state magic number did not match `EMER`.
    SaveStateMagicMismatch,
    /// Save state version is not supported by this build.
    SaveStateVersionMismatch,
    /// Save state game code does not match the currently loaded ROM.
    SaveStateRomMismatch,
    InvalidData,
    InvalidParameter(String),
    CustomError(String),
}

impl Error {
    pub fn description(&self) -> String {
        match self {
            Error::RomInvalid => String::from("Invalid ROM (size or header checksum)"),
            Error::SaveStateMagicMismatch => String::from("Save state magic mismatch"),
            Error::SaveStateVersionMismatch => String::from("Save state version mismatch"),
            Error::SaveStateRomMismatch => {
                String::from("Save state does not match the loaded ROM")
            }
            Error::InvalidData => String::from("Invalid data format"),
            Error::InvalidParameter(message) => format!("Invalid parameter: {}", message),
            Error::CustomError(message) => String::from(message),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::CustomError(format!("I/O error: {}", value))
    }
}
