//! Connection state machine for a single peripheral session.
//!
//! The machine is owned by the control thread and never touches the native
//! stack itself. Every transition yields the native [`Command`]s it needs,
//! which the session executes in order. This keeps every decision
//! synchronous and replayable from a recorded event sequence.

use std::collections::HashSet;

use log::{debug, info, warn};
use smol_str::SmolStr;
use strum::{Display, IntoStaticStr};
use uuid::Uuid;

use crate::{
   error::{Result, SessionError},
   event::{BridgeEvent, CharacteristicRef, ConnectionStatus, ScanResult, ValueUpdate},
};

/// Progress of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum SessionState {
   Idle,
   Scanning,
   Connecting,
   Connected,
   DiscoveringCharacteristics,
   Subscribing,
   Active,
}

impl SessionState {
   /// Whether a link to the peripheral is up.
   pub const fn is_connected(self) -> bool {
      matches!(
         self,
         Self::Connected | Self::DiscoveringCharacteristics | Self::Subscribing | Self::Active
      )
   }

   /// Whether GATT characteristics may be addressed.
   const fn is_gatt_ready(self) -> bool {
      matches!(
         self,
         Self::DiscoveringCharacteristics | Self::Subscribing | Self::Active
      )
   }
}

/// A state change, reported to the host in the tick it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
   pub from: SessionState,
   pub to: SessionState,
}

/// Native request produced by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   ScanStart(Vec<Uuid>),
   ScanStop,
   Connect(SmolStr),
   Disconnect,
   DiscoverCharacteristics,
   Subscribe(Uuid),
   Read(Uuid),
   Write(Uuid, Vec<u8>),
}

pub type ScanPredicate = Box<dyn Fn(&ScanResult) -> bool + Send>;
pub type CharacteristicPredicate = Box<dyn Fn(&CharacteristicRef) -> bool + Send>;

/// Caller-supplied decisions the machine defers to.
#[derive(Default)]
pub struct SessionPolicy {
   select: Option<ScanPredicate>,
   subscribe: Option<CharacteristicPredicate>,
   stop_scan_on_connect: bool,
}

impl SessionPolicy {
   pub fn new() -> Self {
      Self::default()
   }

   /// Scan results for which `f` returns true trigger a connect.
   #[must_use]
   pub fn select_with(mut self, f: impl Fn(&ScanResult) -> bool + Send + 'static) -> Self {
      self.select = Some(Box::new(f));
      self
   }

   /// Selects peripherals advertising exactly `name`.
   #[must_use]
   pub fn select_by_name(self, name: impl Into<SmolStr>) -> Self {
      let name = name.into();
      self.select_with(move |r| r.name() == name.as_str())
   }

   /// Discovered characteristics for which `f` returns true are subscribed to.
   #[must_use]
   pub fn subscribe_with(
      mut self,
      f: impl Fn(&CharacteristicRef) -> bool + Send + 'static,
   ) -> Self {
      self.subscribe = Some(Box::new(f));
      self
   }

   #[must_use]
   pub fn subscribe_to(self, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
      let wanted: HashSet<Uuid> = characteristics.into_iter().collect();
      self.subscribe_with(move |c| wanted.contains(&c.characteristic()))
   }

   /// Scanning keeps running after a connect unless this is set.
   #[must_use]
   pub const fn stop_scan_on_connect(mut self, stop: bool) -> Self {
      self.stop_scan_on_connect = stop;
      self
   }

   fn selects(&self, result: &ScanResult) -> bool {
      self.select.as_ref().is_some_and(|f| f(result))
   }

   fn subscribes(&self, characteristic: &CharacteristicRef) -> bool {
      self.subscribe.as_ref().is_some_and(|f| f(characteristic))
   }
}

/// Everything produced while applying a batch of events.
#[derive(Debug, Default)]
pub struct Effects {
   pub commands: Vec<Command>,
   pub scan_results: Vec<ScanResult>,
   pub characteristics: Vec<CharacteristicRef>,
   pub value_updates: Vec<ValueUpdate>,
}

pub struct ConnectionStateMachine {
   state: SessionState,
   policy: SessionPolicy,
   scan_active: bool,
   peer: Option<SmolStr>,
   discovered: Vec<CharacteristicRef>,
   pending: HashSet<Uuid>,
   subscribed: HashSet<Uuid>,
   transitions: Vec<Transition>,
}

impl ConnectionStateMachine {
   pub fn new(policy: SessionPolicy) -> Self {
      Self {
         state: SessionState::Idle,
         policy,
         scan_active: false,
         peer: None,
         discovered: Vec::new(),
         pending: HashSet::new(),
         subscribed: HashSet::new(),
         transitions: Vec::new(),
      }
   }

   pub const fn state(&self) -> SessionState {
      self.state
   }

   pub const fn is_scanning(&self) -> bool {
      self.scan_active
   }

   /// Identifier of the peripheral being connected or connected to.
   pub fn peer(&self) -> Option<&str> {
      self.peer.as_deref()
   }

   /// Characteristics discovered on the current connection.
   pub fn characteristics(&self) -> &[CharacteristicRef] {
      &self.discovered
   }

   /// Whether a subscribe request for `characteristic` awaits acknowledgement.
   pub fn is_subscribe_pending(&self, characteristic: Uuid) -> bool {
      self.pending.contains(&characteristic)
   }

   pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
      self.subscribed.contains(&characteristic)
   }

   pub fn take_transitions(&mut self) -> Vec<Transition> {
      std::mem::take(&mut self.transitions)
   }

   fn enter(&mut self, to: SessionState) {
      let from = self.state;
      if from == to {
         return;
      }
      info!("Session {from} -> {to}");
      self.state = to;
      self.transitions.push(Transition { from, to });
   }

   fn invalid(&self, operation: &'static str) -> SessionError {
      SessionError::InvalidStateTransition {
         operation,
         state: self.state,
      }
   }

   /// Drops every per-connection record and returns to `Idle`.
   fn reset(&mut self, commands: &mut Vec<Command>) {
      if self.scan_active {
         self.scan_active = false;
         commands.push(Command::ScanStop);
      }
      self.peer = None;
      self.discovered.clear();
      self.pending.clear();
      self.subscribed.clear();
      self.enter(SessionState::Idle);
   }

   fn begin_connect(&mut self, identifier: SmolStr, commands: &mut Vec<Command>) {
      commands.push(Command::Connect(identifier.clone()));
      if self.policy.stop_scan_on_connect && self.scan_active {
         self.scan_active = false;
         commands.push(Command::ScanStop);
      }
      self.peer = Some(identifier);
      self.enter(SessionState::Connecting);
   }

   // === Host requests ===

   pub fn start_scan(&mut self, services: &[Uuid]) -> Result<Vec<Command>> {
      if self.scan_active {
         return Err(SessionError::DuplicateOperation("start_scan"));
      }
      self.scan_active = true;
      if self.state == SessionState::Idle {
         self.enter(SessionState::Scanning);
      }
      Ok(vec![Command::ScanStart(services.to_vec())])
   }

   pub fn stop_scan(&mut self) -> Vec<Command> {
      if !self.scan_active {
         return Vec::new();
      }
      self.scan_active = false;
      if self.state == SessionState::Scanning {
         self.enter(SessionState::Idle);
      }
      vec![Command::ScanStop]
   }

   /// Records that the native scan ended without being asked to.
   pub fn scan_ended(&mut self) {
      if !self.scan_active {
         return;
      }
      self.scan_active = false;
      if self.state == SessionState::Scanning {
         self.enter(SessionState::Idle);
      }
   }

   pub fn connect(&mut self, identifier: &str) -> Result<Vec<Command>> {
      match self.state {
         SessionState::Idle | SessionState::Scanning => {
            let mut commands = Vec::new();
            self.begin_connect(identifier.into(), &mut commands);
            Ok(commands)
         },
         SessionState::Connecting => Err(SessionError::DuplicateOperation("connect")),
         _ => Err(self.invalid("connect")),
      }
   }

   pub fn disconnect(&mut self) -> Vec<Command> {
      let mut commands = Vec::new();
      if self.state == SessionState::Connecting || self.state.is_connected() {
         commands.push(Command::Disconnect);
      }
      self.reset(&mut commands);
      commands
   }

   pub fn subscribe(&mut self, characteristic: Uuid) -> Result<Vec<Command>> {
      if !self.state.is_gatt_ready() {
         return Err(self.invalid("subscribe"));
      }
      if self.pending.contains(&characteristic) || self.subscribed.contains(&characteristic) {
         return Err(SessionError::DuplicateOperation("subscribe"));
      }
      let mut commands = Vec::new();
      self.request_subscribe(characteristic, &mut commands);
      Ok(commands)
   }

   pub fn read(&self, characteristic: Uuid) -> Result<Vec<Command>> {
      if !self.state.is_gatt_ready() {
         return Err(self.invalid("read"));
      }
      Ok(vec![Command::Read(characteristic)])
   }

   pub fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<Vec<Command>> {
      if self.state != SessionState::Active {
         return Err(self.invalid("write"));
      }
      Ok(vec![Command::Write(characteristic, data.to_vec())])
   }

   fn request_subscribe(&mut self, characteristic: Uuid, commands: &mut Vec<Command>) {
      self.pending.insert(characteristic);
      commands.push(Command::Subscribe(characteristic));
      if self.state == SessionState::DiscoveringCharacteristics {
         self.enter(SessionState::Subscribing);
      }
   }

   // === Native events ===

   pub fn apply(&mut self, event: BridgeEvent, effects: &mut Effects) {
      match event {
         BridgeEvent::ScanResult(result) => self.on_scan_result(result, effects),
         BridgeEvent::CharacteristicDiscovered(characteristic) => {
            self.on_characteristic(characteristic, effects);
         },
         BridgeEvent::ValueUpdate(update) => self.on_value_update(update, effects),
         BridgeEvent::ConnectionStatus { identifier, status } => {
            self.on_connection_status(&identifier, status, effects);
         },
      }
   }

   fn late(&self, kind: &'static str) {
      debug!("{} (state {})", SessionError::LateEvent(kind), self.state);
   }

   fn on_scan_result(&mut self, result: ScanResult, effects: &mut Effects) {
      if !self.scan_active {
         self.late("scan_result");
         return;
      }

      if self.policy.selects(&result) {
         if self.state == SessionState::Scanning {
            info!("Selected {result}, connecting");
            self
               .begin_connect(result.identifier().into(), &mut effects.commands);
         } else {
            debug!("Ignoring matching {result} while {}", self.state);
         }
      }

      effects.scan_results.push(result);
   }

   fn on_characteristic(&mut self, characteristic: CharacteristicRef, effects: &mut Effects) {
      if !self.state.is_gatt_ready() {
         self.late("characteristic_discovered");
         return;
      }

      debug!(
         "Discovered characteristic {} of service {}",
         characteristic.characteristic(),
         characteristic.service()
      );
      if !self.discovered.contains(&characteristic) {
         self.discovered.push(characteristic);
      }

      let uuid = characteristic.characteristic();
      if self.policy.subscribes(&characteristic)
         && !self.pending.contains(&uuid)
         && !self.subscribed.contains(&uuid)
      {
         self.request_subscribe(uuid, &mut effects.commands);
      }

      effects.characteristics.push(characteristic);
   }

   fn on_value_update(&mut self, update: ValueUpdate, effects: &mut Effects) {
      if !self.state.is_connected() {
         self.late("value_update");
         return;
      }

      let uuid = update.characteristic();
      if self.pending.remove(&uuid) {
         self.subscribed.insert(uuid);
         if self.state == SessionState::Subscribing {
            self.enter(SessionState::Active);
         }
      }

      effects.value_updates.push(update);
   }

   fn on_connection_status(
      &mut self,
      identifier: &str,
      status: ConnectionStatus,
      effects: &mut Effects,
   ) {
      let is_peer = self
         .peer
         .as_deref()
         .is_some_and(|p| p.eq_ignore_ascii_case(identifier));
      if !is_peer {
         self.late("connection_status");
         return;
      }

      match (status, self.state) {
         (ConnectionStatus::DidConnect, SessionState::Connecting) => {
            self.enter(SessionState::Connected);
            effects.commands.push(Command::DiscoverCharacteristics);
            self.enter(SessionState::DiscoveringCharacteristics);
         },
         (ConnectionStatus::DidConnectFailed, SessionState::Connecting) => {
            warn!("Connection to {identifier} failed");
            self.reset(&mut effects.commands);
         },
         (ConnectionStatus::DidDisconnect, state)
            if state == SessionState::Connecting || state.is_connected() =>
         {
            warn!("Connection to {identifier} lost");
            self.reset(&mut effects.commands);
         },
         _ => self.late("connection_status"),
      }
   }

   /// Reconciles state after the native stack rejected `command`.
   ///
   /// Returns follow-up commands to issue on a best-effort basis.
   pub fn command_failed(&mut self, command: &Command) -> Vec<Command> {
      let mut commands = Vec::new();
      match command {
         Command::ScanStart(_) => self.scan_ended(),
         Command::Connect(_) | Command::DiscoverCharacteristics => {
            self.reset(&mut commands);
         },
         Command::Subscribe(uuid) => {
            self.pending.remove(uuid);
            if self.state == SessionState::Subscribing
               && self.pending.is_empty()
               && self.subscribed.is_empty()
            {
               self.enter(SessionState::DiscoveringCharacteristics);
            }
         },
         Command::ScanStop | Command::Disconnect | Command::Read(_) | Command::Write(..) => {},
      }
      commands
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const SVC: Uuid = Uuid::from_u128(0x51);
   const CHR: Uuid = Uuid::from_u128(0xC1);
   const OTHER: Uuid = Uuid::from_u128(0xC2);

   fn machine() -> ConnectionStateMachine {
      ConnectionStateMachine::new(
         SessionPolicy::new()
            .select_by_name("X")
            .subscribe_to([CHR]),
      )
   }

   fn scan(name: &str, identifier: &str) -> BridgeEvent {
      BridgeEvent::ScanResult(ScanResult::new(name, -60, identifier))
   }

   fn status(identifier: &str, status: ConnectionStatus) -> BridgeEvent {
      BridgeEvent::ConnectionStatus {
         identifier: identifier.into(),
         status,
      }
   }

   fn apply(machine: &mut ConnectionStateMachine, event: BridgeEvent) -> Effects {
      let mut effects = Effects::default();
      machine.apply(event, &mut effects);
      effects
   }

   /// Drives a fresh machine up to `Subscribing` on `CHR`.
   fn subscribing() -> ConnectionStateMachine {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      apply(&mut m, status("AA:BB", ConnectionStatus::DidConnect));
      apply(
         &mut m,
         BridgeEvent::CharacteristicDiscovered(CharacteristicRef::new(SVC, CHR)),
      );
      assert_eq!(m.state(), SessionState::Subscribing);
      m
   }

   #[test]
   fn test_start_scan_from_idle() {
      let mut m = machine();
      let commands = m.start_scan(&[SVC]).unwrap();
      assert_eq!(commands, vec![Command::ScanStart(vec![SVC])]);
      assert_eq!(m.state(), SessionState::Scanning);
      assert!(matches!(
         m.start_scan(&[]),
         Err(SessionError::DuplicateOperation(_))
      ));
   }

   #[test]
   fn test_matching_scan_result_connects_once() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();

      let first = apply(&mut m, scan("X", "AA:BB"));
      assert_eq!(first.commands, vec![Command::Connect("AA:BB".into())]);
      assert_eq!(m.state(), SessionState::Connecting);
      assert_eq!(m.peer(), Some("AA:BB"));
      // Scan keeps running, the result is still delivered
      assert!(m.is_scanning());
      assert_eq!(first.scan_results.len(), 1);

      let second = apply(&mut m, scan("X", "CC:DD"));
      assert!(second.commands.is_empty());
      assert_eq!(m.state(), SessionState::Connecting);
      assert_eq!(m.peer(), Some("AA:BB"));
   }

   #[test]
   fn test_non_matching_scan_result_only_delivered() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      let effects = apply(&mut m, scan("Y", "AA:BB"));
      assert!(effects.commands.is_empty());
      assert_eq!(effects.scan_results.len(), 1);
      assert_eq!(m.state(), SessionState::Scanning);
   }

   #[test]
   fn test_stop_scan_on_connect_policy() {
      let mut m = ConnectionStateMachine::new(
         SessionPolicy::new()
            .select_by_name("X")
            .stop_scan_on_connect(true),
      );
      m.start_scan(&[]).unwrap();
      let effects = apply(&mut m, scan("X", "AA:BB"));
      assert_eq!(
         effects.commands,
         vec![Command::Connect("AA:BB".into()), Command::ScanStop]
      );
      assert!(!m.is_scanning());
   }

   #[test]
   fn test_connect_success_requests_discovery() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      m.take_transitions();

      let effects = apply(&mut m, status("aa:bb", ConnectionStatus::DidConnect));
      assert_eq!(effects.commands, vec![Command::DiscoverCharacteristics]);
      assert_eq!(m.state(), SessionState::DiscoveringCharacteristics);
      assert_eq!(
         m.take_transitions(),
         vec![
            Transition {
               from: SessionState::Connecting,
               to: SessionState::Connected,
            },
            Transition {
               from: SessionState::Connected,
               to: SessionState::DiscoveringCharacteristics,
            },
         ]
      );
   }

   #[test]
   fn test_uninteresting_characteristic_is_observed_only() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      apply(&mut m, status("AA:BB", ConnectionStatus::DidConnect));

      let effects = apply(
         &mut m,
         BridgeEvent::CharacteristicDiscovered(CharacteristicRef::new(SVC, OTHER)),
      );
      assert!(effects.commands.is_empty());
      assert_eq!(effects.characteristics.len(), 1);
      assert_eq!(m.state(), SessionState::DiscoveringCharacteristics);
   }

   #[test]
   fn test_one_subscribe_in_flight_per_characteristic() {
      let mut m = subscribing();
      assert!(m.is_subscribe_pending(CHR));

      // Rediscovery of the same characteristic does not resubscribe
      let effects = apply(
         &mut m,
         BridgeEvent::CharacteristicDiscovered(CharacteristicRef::new(SVC, CHR)),
      );
      assert!(effects.commands.is_empty());
      assert!(matches!(
         m.subscribe(CHR),
         Err(SessionError::DuplicateOperation(_))
      ));
   }

   #[test]
   fn test_value_update_acknowledges_subscription() {
      let mut m = subscribing();

      // Stray notification on another characteristic
      let stray = apply(
         &mut m,
         BridgeEvent::ValueUpdate(ValueUpdate::copied(OTHER, &[0xFF])),
      );
      assert_eq!(stray.value_updates.len(), 1);
      assert_eq!(m.state(), SessionState::Subscribing);

      let effects = apply(
         &mut m,
         BridgeEvent::ValueUpdate(ValueUpdate::copied(CHR, &[0x01, 0x02])),
      );
      assert_eq!(m.state(), SessionState::Active);
      assert!(m.is_subscribed(CHR));
      assert!(!m.is_subscribe_pending(CHR));
      assert_eq!(effects.value_updates[0].payload(), &[0x01, 0x02]);
   }

   #[test]
   fn test_connection_lost_while_subscribing() {
      let mut m = subscribing();

      let effects = apply(&mut m, status("AA:BB", ConnectionStatus::DidDisconnect));
      assert_eq!(m.state(), SessionState::Idle);
      assert_eq!(effects.commands, vec![Command::ScanStop]);
      assert!(!m.is_subscribe_pending(CHR));
      assert!(m.characteristics().is_empty());
      assert_eq!(m.peer(), None);

      // Late notification from the old session
      let late = apply(
         &mut m,
         BridgeEvent::ValueUpdate(ValueUpdate::copied(CHR, &[0x01])),
      );
      assert!(late.value_updates.is_empty());
      assert!(late.commands.is_empty());
      assert_eq!(m.state(), SessionState::Idle);
   }

   #[test]
   fn test_connect_failed_returns_to_idle() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      apply(&mut m, status("AA:BB", ConnectionStatus::DidConnectFailed));
      assert_eq!(m.state(), SessionState::Idle);
      assert!(!m.is_scanning());
   }

   #[test]
   fn test_status_for_other_peer_is_late() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      let effects = apply(&mut m, status("CC:DD", ConnectionStatus::DidConnect));
      assert!(effects.commands.is_empty());
      assert_eq!(m.state(), SessionState::Connecting);
   }

   #[test]
   fn test_connect_guards() {
      let mut m = machine();
      assert_eq!(
         m.connect("AA:BB").unwrap(),
         vec![Command::Connect("AA:BB".into())]
      );
      assert!(matches!(
         m.connect("AA:BB"),
         Err(SessionError::DuplicateOperation(_))
      ));

      let mut m = subscribing();
      assert!(matches!(
         m.connect("CC:DD"),
         Err(SessionError::InvalidStateTransition {
            state: SessionState::Subscribing,
            ..
         })
      ));
   }

   #[test]
   fn test_write_requires_active() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      assert!(matches!(
         m.write(CHR, &[0x01]),
         Err(SessionError::InvalidStateTransition {
            operation: "write",
            state: SessionState::Scanning,
         })
      ));
   }

   #[test]
   fn test_disconnect_from_any_state() {
      let mut m = subscribing();
      assert_eq!(
         m.disconnect(),
         vec![Command::Disconnect, Command::ScanStop]
      );
      assert_eq!(m.state(), SessionState::Idle);

      let mut m = machine();
      assert!(m.disconnect().is_empty());
      assert_eq!(m.state(), SessionState::Idle);
   }

   #[test]
   fn test_stop_scan_keeps_connection() {
      let mut m = subscribing();
      assert_eq!(m.stop_scan(), vec![Command::ScanStop]);
      assert_eq!(m.state(), SessionState::Subscribing);

      let mut m = machine();
      m.start_scan(&[]).unwrap();
      m.stop_scan();
      assert_eq!(m.state(), SessionState::Idle);
      assert!(m.stop_scan().is_empty());
   }

   #[test]
   fn test_scan_results_after_stop_are_late() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      m.stop_scan();
      let effects = apply(&mut m, scan("X", "AA:BB"));
      assert!(effects.scan_results.is_empty());
      assert!(effects.commands.is_empty());
      assert_eq!(m.state(), SessionState::Idle);
   }

   #[test]
   fn test_characteristic_outside_discovery_is_late() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      assert_eq!(m.state(), SessionState::Connecting);

      let effects = apply(
         &mut m,
         BridgeEvent::CharacteristicDiscovered(CharacteristicRef::new(SVC, CHR)),
      );
      assert!(effects.commands.is_empty());
      assert!(effects.characteristics.is_empty());
      assert!(m.characteristics().is_empty());
      assert!(!m.is_subscribe_pending(CHR));
      assert_eq!(m.state(), SessionState::Connecting);
   }

   #[test]
   fn test_gatt_requests_need_discovery() {
      let mut m = machine();
      assert!(matches!(
         m.subscribe(CHR),
         Err(SessionError::InvalidStateTransition {
            operation: "subscribe",
            state: SessionState::Idle,
         })
      ));

      m.start_scan(&[]).unwrap();
      apply(&mut m, scan("X", "AA:BB"));
      assert!(matches!(
         m.read(CHR),
         Err(SessionError::InvalidStateTransition {
            operation: "read",
            state: SessionState::Connecting,
         })
      ));
      assert!(matches!(
         m.subscribe(CHR),
         Err(SessionError::InvalidStateTransition {
            operation: "subscribe",
            state: SessionState::Connecting,
         })
      ));
   }

   #[test]
   fn test_first_acknowledged_subscription_activates() {
      let mut m = subscribing();
      assert_eq!(m.subscribe(OTHER).unwrap(), vec![Command::Subscribe(OTHER)]);

      apply(
         &mut m,
         BridgeEvent::ValueUpdate(ValueUpdate::copied(CHR, &[0x01])),
      );
      assert_eq!(m.state(), SessionState::Active);
      assert!(m.is_subscribed(CHR));
      // The other request is still awaiting its first value
      assert!(m.is_subscribe_pending(OTHER));

      apply(
         &mut m,
         BridgeEvent::ValueUpdate(ValueUpdate::copied(OTHER, &[0x02])),
      );
      assert!(m.is_subscribed(OTHER));
      assert_eq!(m.state(), SessionState::Active);
   }

   #[test]
   fn test_scan_ended_natively() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      m.scan_ended();
      assert!(!m.is_scanning());
      assert_eq!(m.state(), SessionState::Idle);
      assert!(m.start_scan(&[]).is_ok());

      let mut m = subscribing();
      m.scan_ended();
      assert!(!m.is_scanning());
      assert_eq!(m.state(), SessionState::Subscribing);
   }

   #[test]
   fn test_failed_commands_reconcile() {
      let mut m = machine();
      m.start_scan(&[]).unwrap();
      m.command_failed(&Command::ScanStart(vec![]));
      assert_eq!(m.state(), SessionState::Idle);
      assert!(!m.is_scanning());

      let mut m = subscribing();
      m.command_failed(&Command::Subscribe(CHR));
      assert_eq!(m.state(), SessionState::DiscoveringCharacteristics);
      assert!(!m.is_subscribe_pending(CHR));

      let mut m = machine();
      m.connect("AA:BB").unwrap();
      m.command_failed(&Command::Connect("AA:BB".into()));
      assert_eq!(m.state(), SessionState::Idle);
   }
}
