//! Error types for the BLE session core.
//!
//! Native-stack failures surface to the caller of the triggering session
//! operation. Asynchronous failures never come back as errors; they show up
//! on the next tick as a transition to `Idle`.

use thiserror::Error;

use crate::state::SessionState;

/// Main error type for the session core.
#[derive(Error, Debug)]
pub enum SessionError {
   #[error("Native BLE stack unavailable: {0}")]
   NativeStackUnavailable(String),

   #[error("Cannot {operation} while {state}")]
   InvalidStateTransition {
      operation: &'static str,
      state: SessionState,
   },

   #[error("Duplicate operation ignored: {0}")]
   DuplicateOperation(&'static str),

   #[error("Late {0} event dropped")]
   LateEvent(&'static str),

   #[error("Payload of {len} bytes exceeds maximum write size of {max}")]
   PayloadTooLarge { len: usize, max: usize },

   #[error("Native callbacks are not registered")]
   CallbacksNotRegistered,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),
}

/// Convenience type alias for Results with `SessionError`.
pub type Result<T> = std::result::Result<T, SessionError>;
