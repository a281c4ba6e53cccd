//! Lifecycle of the entry points installed into the native stack.
//!
//! Entry points only translate native arguments into a [`BridgeEvent`] and
//! push it. They reach the bridge through a gate that `unregister` closes
//! before removing them from the native stack, so a callback the native
//! layer already picked up but has not run yet becomes a no-op.
//!
//! Every registration gets a gate of its own. An entry point captured under
//! an earlier registration stays behind that registration's closed gate, so
//! registering again never revives it.
//!
//! `unregister` must run before the code behind the entry points becomes
//! invalid (host reload, process teardown). The session calls it from
//! `before_unload` and from `Drop`.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::{debug, info};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
   bluetooth::NativeStack,
   bridge::EventSink,
   event::{BridgeEvent, CharacteristicRef, ConnectionStatus, ScanResult, ValueUpdate},
};

struct Gate {
   sink: RwLock<Option<EventSink>>,
   discarded: Arc<AtomicU64>,
}

impl Gate {
   fn forward(&self, make: impl FnOnce() -> BridgeEvent) {
      // Held for the duration of the push; closing waits for it.
      let guard = self.sink.read();
      match &*guard {
         Some(sink) => sink.push(make()),
         None => {
            self.discarded.fetch_add(1, Ordering::Relaxed);
         },
      }
   }

   fn open(sink: EventSink, discarded: Arc<AtomicU64>) -> Self {
      Self {
         sink: RwLock::new(Some(sink)),
         discarded,
      }
   }

   fn close(&self) {
      self.sink.write().take();
   }
}

/// Owns the registration of the native entry points.
pub struct CallbackLifecycle {
   gate: Option<Arc<Gate>>,
   sink: EventSink,
   discarded: Arc<AtomicU64>,
}

impl CallbackLifecycle {
   pub fn new(sink: EventSink) -> Self {
      Self {
         gate: None,
         sink,
         discarded: Arc::default(),
      }
   }

   pub const fn is_registered(&self) -> bool {
      self.gate.is_some()
   }

   /// Callbacks that fired after `unregister` and were dropped.
   pub fn discarded(&self) -> u64 {
      self.discarded.load(Ordering::Relaxed)
   }

   /// Installs all four entry points. Calling it again is a no-op.
   pub fn register<S: NativeStack + ?Sized>(&mut self, stack: &mut S) {
      if self.is_registered() {
         debug!("Native callbacks already registered");
         return;
      }

      let current = Arc::new(Gate::open(self.sink.clone(), self.discarded.clone()));

      let gate = current.clone();
      stack.register_scan_result_cb(Some(Arc::new(
         move |name: &str, rssi: i16, identifier: &str| {
            gate.forward(|| BridgeEvent::ScanResult(ScanResult::new(name, rssi, identifier)));
         },
      )));

      let gate = current.clone();
      stack.register_characteristic_discovered_cb(Some(Arc::new(
         move |service: Uuid, characteristic: Uuid| {
            gate.forward(|| {
               BridgeEvent::CharacteristicDiscovered(CharacteristicRef::new(service, characteristic))
            });
         },
      )));

      let gate = current.clone();
      stack.register_value_update_cb(Some(Arc::new(move |characteristic: Uuid, data: &[u8]| {
         gate.forward(|| BridgeEvent::ValueUpdate(ValueUpdate::copied(characteristic, data)));
      })));

      let gate = current.clone();
      stack.register_connection_status_cb(Some(Arc::new(
         move |identifier: &str, status: ConnectionStatus| {
            gate.forward(|| BridgeEvent::ConnectionStatus {
               identifier: identifier.into(),
               status,
            });
         },
      )));

      self.gate = Some(current);
      info!("Native callbacks registered");
   }

   /// Removes all four entry points. Calling it again is a no-op.
   ///
   /// When this returns no entry point is executing, and none that the
   /// native stack still holds will reach the bridge.
   pub fn unregister<S: NativeStack + ?Sized>(&mut self, stack: &mut S) {
      let Some(gate) = self.gate.take() else {
         return;
      };

      gate.close();
      stack.register_scan_result_cb(None);
      stack.register_characteristic_discovered_cb(None);
      stack.register_value_update_cb(None);
      stack.register_connection_status_cb(None);

      info!("Native callbacks unregistered");
   }
}

impl Drop for CallbackLifecycle {
   fn drop(&mut self) {
      if let Some(gate) = &self.gate {
         gate.close();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{bluetooth::sim::SimulatedStack, bridge::EventBridge};

   #[test]
   fn test_register_then_unregister_leaves_nothing_installed() {
      let mut stack = SimulatedStack::new();
      let radio = stack.radio();
      let bridge = EventBridge::new();
      let mut lifecycle = CallbackLifecycle::new(bridge.sink());

      for _ in 0..3 {
         lifecycle.register(&mut stack);
         assert!(lifecycle.is_registered());
         assert_eq!(radio.installed_callbacks(), 4);

         lifecycle.unregister(&mut stack);
         assert!(!lifecycle.is_registered());
         assert_eq!(radio.installed_callbacks(), 0);
      }
   }

   #[test]
   fn test_register_and_unregister_are_idempotent() {
      let mut stack = SimulatedStack::new();
      let radio = stack.radio();
      let mut bridge = EventBridge::new();
      let mut lifecycle = CallbackLifecycle::new(bridge.sink());

      lifecycle.unregister(&mut stack);
      assert_eq!(radio.installed_callbacks(), 0);

      lifecycle.register(&mut stack);
      lifecycle.register(&mut stack);
      radio.emit_scan_result("X", -60, "AA:BB");
      // One registration, one delivery
      assert_eq!(bridge.drain_all().len(), 1);

      lifecycle.unregister(&mut stack);
      lifecycle.unregister(&mut stack);
      assert_eq!(radio.installed_callbacks(), 0);
   }

   #[test]
   fn test_entry_points_translate_native_arguments() {
      let mut stack = SimulatedStack::new();
      let radio = stack.radio();
      let mut bridge = EventBridge::new();
      let mut lifecycle = CallbackLifecycle::new(bridge.sink());
      lifecycle.register(&mut stack);

      let svc = Uuid::from_u128(0x1);
      let chr = Uuid::from_u128(0x2);
      radio.emit_scan_result("X", -60, "AA:BB");
      radio.emit_characteristic(svc, chr);
      radio.emit_value(chr, &[0x01, 0x02]);
      radio.emit_connection_status("AA:BB", ConnectionStatus::DidConnect);

      assert_eq!(
         bridge.drain_all(),
         vec![
            BridgeEvent::ScanResult(ScanResult::new("X", -60, "AA:BB")),
            BridgeEvent::CharacteristicDiscovered(CharacteristicRef::new(svc, chr)),
            BridgeEvent::ValueUpdate(ValueUpdate::copied(chr, &[0x01, 0x02])),
            BridgeEvent::ConnectionStatus {
               identifier: "AA:BB".into(),
               status: ConnectionStatus::DidConnect,
            },
         ]
      );
   }

   #[test]
   fn test_in_flight_callback_discarded_after_unregister() {
      let mut stack = SimulatedStack::new();
      let radio = stack.radio();
      let mut bridge = EventBridge::new();
      let mut lifecycle = CallbackLifecycle::new(bridge.sink());
      lifecycle.register(&mut stack);

      // Native operation grabbed the entry point before teardown
      let in_flight = radio.in_flight_value_update().unwrap();
      lifecycle.unregister(&mut stack);
      in_flight(Uuid::nil(), &[0xAA]);

      assert!(bridge.drain_all().is_empty());
      assert_eq!(lifecycle.discarded(), 1);
   }

   #[test]
   fn test_stale_callback_stays_closed_after_register_again() {
      let mut stack = SimulatedStack::new();
      let radio = stack.radio();
      let mut bridge = EventBridge::new();
      let mut lifecycle = CallbackLifecycle::new(bridge.sink());
      lifecycle.register(&mut stack);

      let stale = radio.in_flight_value_update().unwrap();
      lifecycle.unregister(&mut stack);
      lifecycle.register(&mut stack);

      stale(Uuid::nil(), &[0xAA]);
      assert!(bridge.drain_all().is_empty());
      assert_eq!(lifecycle.discarded(), 1);

      // The fresh registration delivers
      radio.emit_value(Uuid::nil(), &[0xBB]);
      assert_eq!(
         bridge.drain_all(),
         vec![BridgeEvent::ValueUpdate(ValueUpdate::copied(Uuid::nil(), &[0xBB]))]
      );
   }

   #[test]
   fn test_drop_closes_gate() {
      let mut stack = SimulatedStack::new();
      let radio = stack.radio();
      let mut bridge = EventBridge::new();
      let mut lifecycle = CallbackLifecycle::new(bridge.sink());
      lifecycle.register(&mut stack);

      let in_flight = radio.in_flight_value_update().unwrap();
      drop(lifecycle);
      in_flight(Uuid::nil(), &[0xAA]);

      assert!(bridge.drain_all().is_empty());
   }
}
