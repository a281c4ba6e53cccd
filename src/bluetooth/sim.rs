//! In-process simulated radio.
//!
//! [`SimulatedStack`] implements [`NativeStack`] by recording every call it
//! receives. Its [`SimulatedRadio`] handle plays the part of the native
//! callback thread: it can be moved to any thread and fires whatever
//! callbacks are installed at that moment.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::debug;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use uuid::Uuid;

use super::{
   CallbackSlots, CharacteristicDiscoveredCallback, ConnectionStatusCallback, ErrorCode,
   NativeStack, ScanResultCallback, StackStatus, ValueUpdateCallback,
};
use crate::{
   error::{Result, SessionError},
   event::ConnectionStatus,
};

/// A call received by the simulated stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
   Init,
   Deinit,
   ScanStart(Vec<Uuid>),
   ScanStop,
   Connect(SmolStr),
   Disconnect,
   DiscoverCharacteristics,
   Subscribe(Uuid),
   Read(Uuid),
   Write(Uuid, Vec<u8>),
}

#[derive(Default)]
struct RadioInner {
   callbacks: RwLock<CallbackSlots>,
   calls: Mutex<Vec<NativeCall>>,
   status: AtomicCell<Option<StackStatus>>,
   scanning: AtomicCell<bool>,
   failure: Mutex<Option<String>>,
   max_write_size: AtomicCell<Option<usize>>,
}

/// Handle for driving the simulated radio from a test or a producer thread.
#[derive(Clone, Default)]
pub struct SimulatedRadio(Arc<RadioInner>);

impl SimulatedRadio {
   pub fn emit_scan_result(&self, name: &str, rssi: i16, identifier: &str) {
      let cb = self.0.callbacks.read().scan_result.clone();
      match cb {
         Some(cb) => cb(name, rssi, identifier),
         None => debug!("No handler for scan result {name} ({identifier})"),
      }
   }

   pub fn emit_characteristic(&self, service: Uuid, characteristic: Uuid) {
      let cb = self.0.callbacks.read().characteristic_discovered.clone();
      match cb {
         Some(cb) => cb(service, characteristic),
         None => debug!("No handler for characteristic {characteristic}"),
      }
   }

   pub fn emit_value(&self, characteristic: Uuid, data: &[u8]) {
      let cb = self.0.callbacks.read().value_update.clone();
      match cb {
         Some(cb) => cb(characteristic, data),
         None => debug!("No handler for value update on {characteristic}"),
      }
   }

   pub fn emit_connection_status(&self, identifier: &str, status: ConnectionStatus) {
      let cb = self.0.callbacks.read().connection_status.clone();
      match cb {
         Some(cb) => cb(identifier, status),
         None => debug!("No handler for connection status {status:?} of {identifier}"),
      }
   }

   /// Value-update entry point as seen by a native operation already in flight.
   pub fn in_flight_value_update(&self) -> Option<ValueUpdateCallback> {
      self.0.callbacks.read().value_update.clone()
   }

   /// Number of entry points currently installed.
   pub fn installed_callbacks(&self) -> usize {
      self.0.callbacks.read().installed()
   }

   pub fn calls(&self) -> Vec<NativeCall> {
      self.0.calls.lock().clone()
   }

   pub fn take_calls(&self) -> Vec<NativeCall> {
      std::mem::take(&mut *self.0.calls.lock())
   }

   pub fn count_calls(&self, pred: impl Fn(&NativeCall) -> bool) -> usize {
      self.0.calls.lock().iter().filter(|c| pred(c)).count()
   }

   /// Makes every subsequent native call fail until cleared with `None`.
   pub fn fail_with(&self, reason: Option<&str>) {
      *self.0.failure.lock() = reason.map(str::to_owned);
   }

   pub fn set_status(&self, status: StackStatus) {
      self.0.status.store(Some(status));
   }

   /// Puts the stack in error. Any running scan dies with it.
   pub fn report_error(&self, code: ErrorCode) {
      self.set_status(StackStatus::Error(code));
      self.end_scan();
   }

   /// Ends the running scan without a request from the session.
   pub fn end_scan(&self) {
      self.0.scanning.store(false);
   }

   pub fn set_max_write_size(&self, max: Option<usize>) {
      self.0.max_write_size.store(max);
   }

   fn record(&self, call: NativeCall) -> Result<()> {
      if let Some(reason) = self.0.failure.lock().clone() {
         return Err(SessionError::NativeStackUnavailable(reason));
      }
      self.0.calls.lock().push(call);
      Ok(())
   }
}

/// Native stack backed by a [`SimulatedRadio`].
#[derive(Default)]
pub struct SimulatedStack {
   radio: SimulatedRadio,
}

impl SimulatedStack {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn radio(&self) -> SimulatedRadio {
      self.radio.clone()
   }
}

impl NativeStack for SimulatedStack {
   fn init(&mut self) -> Result<()> {
      self.radio.record(NativeCall::Init)?;
      // Keep an error reported before init, like an adapter that is switched off
      if matches!(
         self.radio.0.status.load(),
         None | Some(StackStatus::Uninitialised)
      ) {
         self.radio.set_status(StackStatus::Initialised);
      }
      Ok(())
   }

   fn deinit(&mut self) {
      let _ = self.radio.record(NativeCall::Deinit);
      self.radio.set_status(StackStatus::Uninitialised);
      self.radio.end_scan();
   }

   fn status(&self) -> StackStatus {
      self
         .radio
         .0
         .status
         .load()
         .unwrap_or(StackStatus::Uninitialised)
   }

   fn scan_start(&mut self, services: &[Uuid]) -> Result<()> {
      self.radio.record(NativeCall::ScanStart(services.to_vec()))?;
      self.radio.0.scanning.store(true);
      Ok(())
   }

   fn scan_stop(&mut self) -> Result<()> {
      self.radio.record(NativeCall::ScanStop)?;
      self.radio.end_scan();
      Ok(())
   }

   fn is_scanning(&self) -> bool {
      self.radio.0.scanning.load()
   }

   fn connect(&mut self, identifier: &str) -> Result<()> {
      self.radio.record(NativeCall::Connect(identifier.into()))
   }

   fn disconnect(&mut self) -> Result<()> {
      self.radio.record(NativeCall::Disconnect)
   }

   fn discover_characteristics(&mut self) -> Result<()> {
      self.radio.record(NativeCall::DiscoverCharacteristics)
   }

   fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
      self.radio.record(NativeCall::Subscribe(characteristic))
   }

   fn read(&mut self, characteristic: Uuid) -> Result<()> {
      self.radio.record(NativeCall::Read(characteristic))
   }

   fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<()> {
      self
         .radio
         .record(NativeCall::Write(characteristic, data.to_vec()))
   }

   fn max_write_size(&self, _with_response: bool) -> Option<usize> {
      self.radio.0.max_write_size.load()
   }

   fn register_scan_result_cb(&mut self, cb: Option<ScanResultCallback>) {
      self.radio.0.callbacks.write().scan_result = cb;
   }

   fn register_characteristic_discovered_cb(&mut self, cb: Option<CharacteristicDiscoveredCallback>) {
      self.radio.0.callbacks.write().characteristic_discovered = cb;
   }

   fn register_value_update_cb(&mut self, cb: Option<ValueUpdateCallback>) {
      self.radio.0.callbacks.write().value_update = cb;
   }

   fn register_connection_status_cb(&mut self, cb: Option<ConnectionStatusCallback>) {
      self.radio.0.callbacks.write().connection_status = cb;
   }
}
