//! Hand-off of native callback events to the control thread.
//!
//! Producers run on whatever thread the native stack calls back on and only
//! ever push. The control thread drains once per tick. The queue is the only
//! structure shared between the two contexts.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::event::BridgeEvent;

/// Consumer side of the bridge, owned by the control thread.
///
/// Draining takes `&mut self`, so two drains can never overlap.
pub struct EventBridge {
   queue: Arc<SegQueue<BridgeEvent>>,
}

impl EventBridge {
   pub fn new() -> Self {
      Self {
         queue: Arc::new(SegQueue::new()),
      }
   }

   /// Returns a producer handle that can be moved to any thread.
   pub fn sink(&self) -> EventSink {
      EventSink {
         queue: self.queue.clone(),
      }
   }

   pub fn push(&self, event: BridgeEvent) {
      self.queue.push(event);
   }

   /// Removes and returns everything enqueued before the call, in push order.
   ///
   /// Events pushed while the drain runs are left for the next call, so the
   /// result is always finite even under a notification burst.
   pub fn drain_all(&mut self) -> Vec<BridgeEvent> {
      let pending = self.queue.len();
      let mut events = Vec::with_capacity(pending);
      for _ in 0..pending {
         let Some(event) = self.queue.pop() else {
            break;
         };
         events.push(event);
      }
      events
   }

   pub fn pending(&self) -> usize {
      self.queue.len()
   }
}

impl Default for EventBridge {
   fn default() -> Self {
      Self::new()
   }
}

/// Producer side of the bridge. Cheap to clone, never blocks.
#[derive(Clone)]
pub struct EventSink {
   queue: Arc<SegQueue<BridgeEvent>>,
}

impl EventSink {
   pub fn push(&self, event: BridgeEvent) {
      self.queue.push(event);
   }
}
