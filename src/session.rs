//! Control-thread façade over the native stack.
//!
//! A [`Session`] is the only thing the host touches. It owns the bridge,
//! the callback registration and the state machine, and it is not shared
//! across threads; the native stack reaches it only through the bridge.

use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
   bluetooth::{NativeStack, StackStatus},
   bridge::EventBridge,
   callbacks::CallbackLifecycle,
   error::{Result, SessionError},
   event::{CharacteristicRef, ScanResult, ValueUpdate},
   state::{Command, ConnectionStateMachine, Effects, SessionPolicy, SessionState, Transition},
};

/// What happened during one tick.
///
/// Each tick's report covers only the events drained in that tick, plus
/// any state changes made by host requests since the previous tick.
#[derive(Debug, Default)]
pub struct TickReport {
   pub scan_results: Vec<ScanResult>,
   pub characteristics: Vec<CharacteristicRef>,
   pub value_updates: Vec<ValueUpdate>,
   pub transitions: Vec<Transition>,
}

impl TickReport {
   pub fn is_empty(&self) -> bool {
      self.scan_results.is_empty()
         && self.characteristics.is_empty()
         && self.value_updates.is_empty()
         && self.transitions.is_empty()
   }

   pub fn into_scan_results(self) -> impl ExactSizeIterator<Item = ScanResult> {
      self.scan_results.into_iter()
   }

   pub fn into_value_updates(self) -> impl ExactSizeIterator<Item = ValueUpdate> {
      self.value_updates.into_iter()
   }
}

/// BLE central session over a native stack `S`.
pub struct Session<S: NativeStack> {
   stack: S,
   bridge: EventBridge,
   callbacks: CallbackLifecycle,
   machine: ConnectionStateMachine,
   initialised: bool,
}

impl<S: NativeStack> Session<S> {
   pub fn new(stack: S, policy: SessionPolicy) -> Self {
      let bridge = EventBridge::new();
      let callbacks = CallbackLifecycle::new(bridge.sink());
      Self {
         stack,
         bridge,
         callbacks,
         machine: ConnectionStateMachine::new(policy),
         initialised: false,
      }
   }

   /// Installs the native entry points and initialises the stack.
   ///
   /// The stack may become ready later; poll [`Session::is_ready`].
   pub fn open(&mut self) -> Result<()> {
      self.callbacks.register(&mut self.stack);
      if !self.initialised {
         self.stack.init()?;
         self.initialised = true;
         info!("Native stack initialised");
      }
      Ok(())
   }

   /// Tears the session down. Wire this to the host's before-unload signal.
   ///
   /// Entry points are removed first, then scan and connection are dropped
   /// and the stack deinitialised. Safe to call more than once.
   pub fn before_unload(&mut self) {
      self.callbacks.unregister(&mut self.stack);

      let commands = self.machine.disconnect();
      self.issue_best_effort(commands);
      self.machine.take_transitions();

      if self.initialised {
         self.stack.deinit();
         self.initialised = false;
         info!("Native stack deinitialised");
      }

      // Anything still queued belongs to the torn-down session
      let dropped = self.bridge.drain_all().len();
      if dropped > 0 {
         debug!("Dropped {dropped} undelivered events on unload");
      }
   }

   pub fn is_ready(&self) -> bool {
      self.callbacks.is_registered() && self.stack.status().is_ready()
   }

   pub fn stack_status(&self) -> StackStatus {
      self.stack.status()
   }

   pub const fn state(&self) -> SessionState {
      self.machine.state()
   }

   pub const fn is_scanning(&self) -> bool {
      self.machine.is_scanning()
   }

   pub fn peer(&self) -> Option<&str> {
      self.machine.peer()
   }

   pub fn characteristics(&self) -> &[CharacteristicRef] {
      self.machine.characteristics()
   }

   /// Callbacks that fired after unregistration and were discarded.
   pub fn discarded_callbacks(&self) -> u64 {
      self.callbacks.discarded()
   }

   pub fn max_write_size(&self, with_response: bool) -> Option<usize> {
      self.stack.max_write_size(with_response)
   }

   pub fn stack(&self) -> &S {
      &self.stack
   }

   /// Drains the bridge and applies every event to the state machine.
   pub fn tick(&mut self) -> TickReport {
      let mut effects = Effects::default();
      for event in self.bridge.drain_all() {
         self.machine.apply(event, &mut effects);
         let commands = std::mem::take(&mut effects.commands);
         if let Err(e) = self.execute(commands) {
            warn!("Native request failed during tick: {e}");
         }
      }

      if self.machine.is_scanning() && !self.stack.is_scanning() {
         warn!("Native scan ended ({})", self.stack.status());
         self.machine.scan_ended();
      }

      TickReport {
         scan_results: effects.scan_results,
         characteristics: effects.characteristics,
         value_updates: effects.value_updates,
         transitions: self.machine.take_transitions(),
      }
   }

   /// Starts scanning. An empty `services` slice scans for everything.
   pub fn start_scan(&mut self, services: &[Uuid]) -> Result<()> {
      self.ensure_ready()?;
      let commands = self.machine.start_scan(services)?;
      self.execute(commands)
   }

   pub fn stop_scan(&mut self) -> Result<()> {
      let commands = self.machine.stop_scan();
      self.execute(commands)
   }

   pub fn connect(&mut self, identifier: &str) -> Result<()> {
      self.ensure_ready()?;
      let commands = self.machine.connect(identifier)?;
      self.execute(commands)
   }

   pub fn disconnect(&mut self) -> Result<()> {
      let commands = self.machine.disconnect();
      self.execute(commands)
   }

   pub fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
      let commands = self.machine.subscribe(characteristic)?;
      self.execute(commands)
   }

   /// Requests a read; the value arrives as a [`ValueUpdate`] on a later tick.
   pub fn read(&mut self, characteristic: Uuid) -> Result<()> {
      let commands = self.machine.read(characteristic)?;
      self.execute(commands)
   }

   /// Writes with response. Payloads over the stack's with-response limit
   /// fail with [`SessionError::PayloadTooLarge`] before reaching the stack.
   pub fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<()> {
      let commands = self.machine.write(characteristic, data)?;
      if let Some(max) = self.stack.max_write_size(true)
         && data.len() > max
      {
         return Err(SessionError::PayloadTooLarge {
            len: data.len(),
            max,
         });
      }
      self.execute(commands)
   }

   fn ensure_ready(&self) -> Result<()> {
      if !self.callbacks.is_registered() {
         return Err(SessionError::CallbacksNotRegistered);
      }
      let status = self.stack.status();
      if !status.is_ready() {
         return Err(SessionError::NativeStackUnavailable(format!(
            "stack is {status}"
         )));
      }
      Ok(())
   }

   fn issue(&mut self, command: &Command) -> Result<()> {
      debug!("Issuing {command:?}");
      match command {
         Command::ScanStart(services) => self.stack.scan_start(services),
         Command::ScanStop => self.stack.scan_stop(),
         Command::Connect(identifier) => self.stack.connect(identifier),
         Command::Disconnect => self.stack.disconnect(),
         Command::DiscoverCharacteristics => self.stack.discover_characteristics(),
         Command::Subscribe(uuid) => self.stack.subscribe(*uuid),
         Command::Read(uuid) => self.stack.read(*uuid),
         Command::Write(uuid, data) => self.stack.write(*uuid, data),
      }
   }

   /// Issues `commands` in order, stopping at the first native failure.
   fn execute(&mut self, commands: Vec<Command>) -> Result<()> {
      for command in commands {
         if let Err(e) = self.issue(&command) {
            warn!("Native {command:?} failed: {e}");
            let followups = self.machine.command_failed(&command);
            self.issue_best_effort(followups);
            return Err(e);
         }
      }
      Ok(())
   }

   fn issue_best_effort(&mut self, commands: Vec<Command>) {
      for command in commands {
         if let Err(e) = self.issue(&command) {
            debug!("Ignoring failed {command:?}: {e}");
         }
      }
   }
}

impl<S: NativeStack> Drop for Session<S> {
   fn drop(&mut self) {
      self.before_unload();
   }
}
