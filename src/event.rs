//! Values carried from the native BLE stack to the control thread.
//!
//! Everything here is immutable once built and owns its data, so events can
//! be constructed on the native callback thread and consumed on the control
//! thread without borrowing anything from the native layer.

use core::fmt;

use serde_json::json;
use smol_str::SmolStr;
use strum::IntoStaticStr;
use uuid::Uuid;

/// A single advertisement sighting.
///
/// Repeated sightings of the same peripheral produce independent values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
   name: SmolStr,
   rssi: i16,
   identifier: SmolStr,
}

impl ScanResult {
   pub fn new(name: impl Into<SmolStr>, rssi: i16, identifier: impl Into<SmolStr>) -> Self {
      Self {
         name: name.into(),
         rssi,
         identifier: identifier.into(),
      }
   }

   /// Advertised local name, empty when the peripheral has none.
   pub fn name(&self) -> &str {
      &self.name
   }

   /// Signal strength in dBm.
   pub const fn rssi(&self) -> i16 {
      self.rssi
   }

   /// Platform-specific device handle (a MAC address on BlueZ).
   pub fn identifier(&self) -> &str {
      &self.identifier
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "name": self.name.as_str(),
         "rssi": self.rssi,
         "identifier": self.identifier.as_str(),
      })
   }
}

impl fmt::Display for ScanResult {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({}, {} dBm)", self.name, self.identifier, self.rssi)
   }
}

/// A GATT characteristic reported during discovery.
///
/// Only meaningful for the connection it was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
   service: Uuid,
   characteristic: Uuid,
}

impl CharacteristicRef {
   pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
      Self {
         service,
         characteristic,
      }
   }

   pub const fn service(&self) -> Uuid {
      self.service
   }

   pub const fn characteristic(&self) -> Uuid {
      self.characteristic
   }
}

/// A notification or read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueUpdate {
   characteristic: Uuid,
   payload: Vec<u8>,
}

impl ValueUpdate {
   /// Copies `payload` into owned storage.
   ///
   /// Native buffers are only valid for the duration of the callback that
   /// delivered them, so the copy must happen before the callback returns.
   pub fn copied(characteristic: Uuid, payload: &[u8]) -> Self {
      Self {
         characteristic,
         payload: payload.to_vec(),
      }
   }

   pub const fn characteristic(&self) -> Uuid {
      self.characteristic
   }

   pub fn payload(&self) -> &[u8] {
      &self.payload
   }

   pub fn into_payload(self) -> Vec<u8> {
      self.payload
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "characteristic": self.characteristic.to_string(),
         "payload": hex::encode(&self.payload),
      })
   }
}

impl fmt::Display for ValueUpdate {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} <- {}", self.characteristic, hex::encode(&self.payload))
   }
}

/// Connection status reported by the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ConnectionStatus {
   DidDisconnect,
   DidConnect,
   DidConnectFailed,
}

/// Tagged event moved through the bridge.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BridgeEvent {
   ScanResult(ScanResult),
   CharacteristicDiscovered(CharacteristicRef),
   ValueUpdate(ValueUpdate),
   ConnectionStatus {
      identifier: SmolStr,
      status: ConnectionStatus,
   },
}

impl BridgeEvent {
   /// Short name of the event kind, for logging.
   pub fn kind(&self) -> &'static str {
      self.into()
   }
}
