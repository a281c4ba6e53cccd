//! Boundary to the native BLE radio stack.
//!
//! The stack is driven from the control thread through [`NativeStack`] and
//! reports back asynchronously, from a thread of its own choosing, through
//! the four callback registration points.

use core::fmt;
use std::sync::Arc;

use strum::Display;
use uuid::Uuid;

use crate::{error::Result, event::ConnectionStatus};

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod sim;

pub type ScanResultCallback = Arc<dyn Fn(&str, i16, &str) + Send + Sync>;
pub type CharacteristicDiscoveredCallback = Arc<dyn Fn(Uuid, Uuid) + Send + Sync>;
pub type ValueUpdateCallback = Arc<dyn Fn(Uuid, &[u8]) + Send + Sync>;
pub type ConnectionStatusCallback = Arc<dyn Fn(&str, ConnectionStatus) + Send + Sync>;

/// Failure reported by the native stack after initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorCode {
   HardwareUnsupported,
   /// Adapter disabled. Depending on platform this shows up at init or at scan start.
   HardwareTurnedOff,
   PermissionsNotGranted,
   Unknown,
}

/// Readiness of the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackStatus {
   Uninitialised,
   Initialised,
   Scanning,
   Connecting,
   Connected,
   Error(ErrorCode),
}

impl fmt::Display for StackStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Uninitialised => f.write_str("uninitialised"),
         Self::Initialised => f.write_str("initialised"),
         Self::Scanning => f.write_str("scanning"),
         Self::Connecting => f.write_str("connecting"),
         Self::Connected => f.write_str("connected"),
         Self::Error(code) => write!(f, "error ({code})"),
      }
   }
}

impl StackStatus {
   /// Whether the stack accepts scan and connect requests.
   pub const fn is_ready(self) -> bool {
      matches!(
         self,
         Self::Initialised | Self::Scanning | Self::Connecting | Self::Connected
      )
   }
}

/// Operations the native stack exposes to the control thread.
///
/// Every call returns promptly; results arrive later through the
/// registered callbacks.
pub trait NativeStack {
   fn init(&mut self) -> Result<()>;
   fn deinit(&mut self);
   fn status(&self) -> StackStatus;

   /// Starts scanning. An empty `services` slice means no filter.
   fn scan_start(&mut self, services: &[Uuid]) -> Result<()>;
   fn scan_stop(&mut self) -> Result<()>;
   /// Whether a scan started by `scan_start` is still running. Turns false
   /// when the scan is stopped or ends on its own.
   fn is_scanning(&self) -> bool;

   fn connect(&mut self, identifier: &str) -> Result<()>;
   fn disconnect(&mut self) -> Result<()>;

   fn discover_characteristics(&mut self) -> Result<()>;
   fn subscribe(&mut self, characteristic: Uuid) -> Result<()>;
   fn read(&mut self, characteristic: Uuid) -> Result<()>;
   /// Writes with response.
   fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<()>;

   /// Largest payload accepted by a single write, when the stack knows it.
   fn max_write_size(&self, _with_response: bool) -> Option<usize> {
      None
   }

   fn register_scan_result_cb(&mut self, cb: Option<ScanResultCallback>);
   fn register_characteristic_discovered_cb(&mut self, cb: Option<CharacteristicDiscoveredCallback>);
   fn register_value_update_cb(&mut self, cb: Option<ValueUpdateCallback>);
   fn register_connection_status_cb(&mut self, cb: Option<ConnectionStatusCallback>);
}

/// Callback slots as held by a stack implementation.
///
/// Dispatch clones the callback out before invoking it so no lock is held
/// while user code runs.
#[derive(Default, Clone)]
pub struct CallbackSlots {
   pub scan_result: Option<ScanResultCallback>,
   pub characteristic_discovered: Option<CharacteristicDiscoveredCallback>,
   pub value_update: Option<ValueUpdateCallback>,
   pub connection_status: Option<ConnectionStatusCallback>,
}

impl CallbackSlots {
   /// Number of installed entry points.
   pub fn installed(&self) -> usize {
      usize::from(self.scan_result.is_some())
         + usize::from(self.characteristic_discovered.is_some())
         + usize::from(self.value_update.is_some())
         + usize::from(self.connection_status.is_some())
   }
}
