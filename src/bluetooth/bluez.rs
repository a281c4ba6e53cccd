//! BlueZ native stack built on `bluer`.
//!
//! The stack runs its own tokio runtime on a dedicated thread, which is the
//! native callback context: every installed callback is invoked from there.
//! Requests from the control thread travel over an unbounded channel and
//! never block.

use std::{
   collections::{HashMap, HashSet},
   str::FromStr,
   sync::Arc,
   thread,
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, ErrorKind, gatt::remote::Characteristic,
};
use crossbeam::atomic::AtomicCell;
use futures::{StreamExt, pin_mut};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use smol_str::SmolStr;
use tokio::{
   runtime,
   sync::mpsc,
   task::{JoinHandle, JoinSet},
   time,
};
use uuid::Uuid;

use super::{
   CallbackSlots, CharacteristicDiscoveredCallback, ConnectionStatusCallback, ErrorCode,
   NativeStack, ScanResultCallback, StackStatus, ValueUpdateCallback,
};
use crate::{
   error::{Result, SessionError},
   event::ConnectionStatus,
};

/// Interval between checks for resolved GATT services after connecting
const SERVICE_RESOLVE_POLL: Duration = Duration::from_millis(100);
/// Number of checks before discovering with whatever is resolved
const SERVICE_RESOLVE_ATTEMPTS: u32 = 50;
/// Longest attribute value; writes with response use prepared writes up to it.
const MAX_ATTRIBUTE_LEN: usize = 512;
/// ATT header bytes preceding a write-without-response payload.
const ATT_WRITE_HEADER: usize = 3;

#[derive(Debug)]
enum StackCommand {
   ScanStart(Vec<Uuid>, u64),
   ScanStop,
   Connect(SmolStr),
   Disconnect,
   DiscoverCharacteristics,
   Subscribe(Uuid),
   Read(Uuid),
   Write(Uuid, Vec<u8>),
   Shutdown,
}

/// State shared between the control thread and the stack thread.
struct Shared {
   callbacks: RwLock<CallbackSlots>,
   status: AtomicCell<StackStatus>,
   /// Generation of the running scan, if any.
   scan: AtomicCell<Option<u64>>,
   /// ATT MTU of the current connection.
   mtu: AtomicCell<Option<usize>>,
}

impl Shared {
   /// Clears the scan marker unless a newer scan has replaced it.
   fn scan_finished(&self, generation: u64) {
      let _ = self.scan.compare_exchange(Some(generation), None);
   }

   fn scan_result(&self, name: &str, rssi: i16, identifier: &str) {
      let cb = self.callbacks.read().scan_result.clone();
      if let Some(cb) = cb {
         cb(name, rssi, identifier);
      }
   }

   fn characteristic_discovered(&self, service: Uuid, characteristic: Uuid) {
      let cb = self.callbacks.read().characteristic_discovered.clone();
      if let Some(cb) = cb {
         cb(service, characteristic);
      }
   }

   fn value_update(&self, characteristic: Uuid, data: &[u8]) {
      let cb = self.callbacks.read().value_update.clone();
      if let Some(cb) = cb {
         cb(characteristic, data);
      }
   }

   fn connection_status(&self, identifier: &str, status: ConnectionStatus) {
      let cb = self.callbacks.read().connection_status.clone();
      if let Some(cb) = cb {
         cb(identifier, status);
      }
   }
}

/// Native stack backed by the system `bluetoothd`.
pub struct BluezStack {
   shared: Arc<Shared>,
   commands: Option<mpsc::UnboundedSender<StackCommand>>,
   scan_generation: u64,
}

impl BluezStack {
   pub fn new() -> Self {
      Self {
         shared: Arc::new(Shared {
            callbacks: RwLock::default(),
            status: AtomicCell::new(StackStatus::Uninitialised),
            scan: AtomicCell::new(None),
            mtu: AtomicCell::new(None),
         }),
         commands: None,
         scan_generation: 0,
      }
   }

   fn send(&self, command: StackCommand) -> Result<()> {
      let tx = self
         .commands
         .as_ref()
         .ok_or_else(|| SessionError::NativeStackUnavailable("not initialised".into()))?;
      tx.send(command)
         .map_err(|_| SessionError::NativeStackUnavailable("stack thread stopped".into()))
   }
}

impl Default for BluezStack {
   fn default() -> Self {
      Self::new()
   }
}

impl NativeStack for BluezStack {
   fn init(&mut self) -> Result<()> {
      if self.commands.is_some() {
         return Ok(());
      }

      let (tx, rx) = mpsc::unbounded_channel();
      let shared = self.shared.clone();
      thread::Builder::new()
         .name("bluez-stack".into())
         .spawn(move || {
            let rt = match runtime::Builder::new_current_thread().enable_all().build() {
               Ok(rt) => rt,
               Err(e) => {
                  error!("Failed to start BlueZ runtime: {e}");
                  shared.status.store(StackStatus::Error(ErrorCode::Unknown));
                  return;
               },
            };
            rt.block_on(StackActor::run(shared, rx));
         })
         .map_err(|e| SessionError::NativeStackUnavailable(e.to_string()))?;

      self.commands = Some(tx);
      Ok(())
   }

   fn deinit(&mut self) {
      if let Some(tx) = self.commands.take() {
         let _ = tx.send(StackCommand::Shutdown);
      }
      self.shared.scan.store(None);
   }

   fn status(&self) -> StackStatus {
      self.shared.status.load()
   }

   fn scan_start(&mut self, services: &[Uuid]) -> Result<()> {
      let generation = self.scan_generation;
      self.scan_generation = generation.wrapping_add(1);

      // Marked before sending so a scan that ends at once still clears it
      self.shared.scan.store(Some(generation));
      let sent = self.send(StackCommand::ScanStart(services.to_vec(), generation));
      if sent.is_err() {
         self.shared.scan.store(None);
      }
      sent
   }

   fn scan_stop(&mut self) -> Result<()> {
      self.shared.scan.store(None);
      self.send(StackCommand::ScanStop)
   }

   fn is_scanning(&self) -> bool {
      self.shared.scan.load().is_some()
   }

   fn connect(&mut self, identifier: &str) -> Result<()> {
      self.send(StackCommand::Connect(identifier.into()))
   }

   fn disconnect(&mut self) -> Result<()> {
      self.send(StackCommand::Disconnect)
   }

   fn discover_characteristics(&mut self) -> Result<()> {
      self.send(StackCommand::DiscoverCharacteristics)
   }

   fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
      self.send(StackCommand::Subscribe(characteristic))
   }

   fn read(&mut self, characteristic: Uuid) -> Result<()> {
      self.send(StackCommand::Read(characteristic))
   }

   fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<()> {
      self.send(StackCommand::Write(characteristic, data.to_vec()))
   }

   fn max_write_size(&self, with_response: bool) -> Option<usize> {
      write_limit(with_response, self.shared.mtu.load())
   }

   fn register_scan_result_cb(&mut self, cb: Option<ScanResultCallback>) {
      self.shared.callbacks.write().scan_result = cb;
   }

   fn register_characteristic_discovered_cb(&mut self, cb: Option<CharacteristicDiscoveredCallback>) {
      self.shared.callbacks.write().characteristic_discovered = cb;
   }

   fn register_value_update_cb(&mut self, cb: Option<ValueUpdateCallback>) {
      self.shared.callbacks.write().value_update = cb;
   }

   fn register_connection_status_cb(&mut self, cb: Option<ConnectionStatusCallback>) {
      self.shared.callbacks.write().connection_status = cb;
   }
}

impl Drop for BluezStack {
   fn drop(&mut self) {
      self.deinit();
   }
}

/// Largest write payload for a link with the given ATT MTU.
fn write_limit(with_response: bool, mtu: Option<usize>) -> Option<usize> {
   if with_response {
      Some(MAX_ATTRIBUTE_LEN)
   } else {
      mtu.map(|mtu| mtu.saturating_sub(ATT_WRITE_HEADER))
   }
}

fn error_code(e: &bluer::Error) -> ErrorCode {
   match e.kind {
      ErrorKind::NotAuthorized => ErrorCode::PermissionsNotGranted,
      ErrorKind::NotReady => ErrorCode::HardwareTurnedOff,
      ErrorKind::NotSupported | ErrorKind::NotAvailable => ErrorCode::HardwareUnsupported,
      _ => ErrorCode::Unknown,
   }
}

// === Stack Actor ===

struct StackActor {
   shared: Arc<Shared>,
   _session: bluer::Session,
   adapter: Adapter,
   scan: Option<JoinHandle<()>>,
   device: Option<Device>,
   link: Option<JoinHandle<()>>,
   characteristics: HashMap<Uuid, Characteristic>,
   notifications: JoinSet<()>,
}

impl StackActor {
   async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<StackCommand>) {
      let (session, adapter) = match Self::open_adapter().await {
         Ok(opened) => opened,
         Err(e) => {
            error!("Failed to open Bluetooth adapter: {e}");
            shared.status.store(StackStatus::Error(error_code(&e)));
            return;
         },
      };
      info!("BlueZ stack ready on adapter {}", adapter.name());
      shared.status.store(StackStatus::Initialised);

      let mut actor = Self {
         shared,
         _session: session,
         adapter,
         scan: None,
         device: None,
         link: None,
         characteristics: HashMap::new(),
         notifications: JoinSet::new(),
      };

      while let Some(command) = rx.recv().await {
         if matches!(command, StackCommand::Shutdown) {
            break;
         }
         debug!("BlueZ handling {command:?}");
         if let Err(e) = actor.handle(command).await {
            warn!("BlueZ request failed: {e}");
         }
      }

      actor.cleanup().await;
      actor.shared.status.store(StackStatus::Uninitialised);
      info!("BlueZ stack stopped");
   }

   async fn open_adapter() -> bluer::Result<(bluer::Session, Adapter)> {
      let session = bluer::Session::new().await?;
      let adapter = session.default_adapter().await?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      Ok((session, adapter))
   }

   async fn handle(&mut self, command: StackCommand) -> Result<()> {
      match command {
         StackCommand::ScanStart(services, generation) => self.start_scan(services, generation),
         StackCommand::ScanStop => {
            if let Some(handle) = self.scan.take() {
               handle.abort();
               self.shared.status.store(StackStatus::Initialised);
            }
         },
         StackCommand::Connect(identifier) => self.connect(identifier)?,
         StackCommand::Disconnect => self.disconnect().await,
         StackCommand::DiscoverCharacteristics => self.discover().await?,
         StackCommand::Subscribe(uuid) => self.subscribe(uuid),
         StackCommand::Read(uuid) => {
            if let Some(characteristic) = self.characteristic(uuid) {
               let value = characteristic.read().await?;
               self.shared.value_update(uuid, &value);
            }
         },
         StackCommand::Write(uuid, data) => {
            if let Some(characteristic) = self.characteristic(uuid) {
               characteristic.write(&data).await?;
            }
         },
         StackCommand::Shutdown => {},
      }
      Ok(())
   }

   fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
      let found = self.characteristics.get(&uuid);
      if found.is_none() {
         warn!("Characteristic {uuid} not discovered on this connection");
      }
      found
   }

   fn start_scan(&mut self, services: Vec<Uuid>, generation: u64) {
      if let Some(handle) = self.scan.take() {
         handle.abort();
      }

      let adapter = self.adapter.clone();
      let shared = self.shared.clone();
      self.scan = Some(tokio::spawn(async move {
         match Self::scan(&adapter, services, &shared).await {
            Ok(()) => info!("Scan on {} finished", adapter.name()),
            Err(e) => {
               let code = error_code(&e);
               warn!("Scan on {} failed ({code}): {e}", adapter.name());
               if code != ErrorCode::Unknown {
                  shared.status.store(StackStatus::Error(code));
               }
            },
         }
         shared.scan_finished(generation);
      }));
      self.shared.status.store(StackStatus::Scanning);
   }

   async fn scan(adapter: &Adapter, services: Vec<Uuid>, shared: &Shared) -> bluer::Result<()> {
      let filter = DiscoveryFilter {
         uuids: services.into_iter().collect::<HashSet<_>>(),
         transport: DiscoveryTransport::Le,
         ..Default::default()
      };
      adapter.set_discovery_filter(filter).await?;

      // Discovery stops when the stream is dropped
      let events = adapter.discover_devices().await?;
      pin_mut!(events);
      while let Some(event) = events.next().await {
         if let AdapterEvent::DeviceAdded(addr) = event {
            match Self::advertisement(adapter, addr).await {
               Ok((name, rssi)) => shared.scan_result(&name, rssi, &addr.to_string()),
               Err(e) => debug!("Skipping {addr}: {e}"),
            }
         }
      }
      Ok(())
   }

   async fn advertisement(adapter: &Adapter, addr: Address) -> bluer::Result<(String, i16)> {
      let device = adapter.device(addr)?;
      let name = device.name().await?.unwrap_or_default();
      let rssi = device.rssi().await?.unwrap_or_default();
      Ok((name, rssi))
   }

   fn connect(&mut self, identifier: SmolStr) -> Result<()> {
      let addr = match Address::from_str(&identifier) {
         Ok(addr) => addr,
         Err(e) => {
            self
               .shared
               .connection_status(&identifier, ConnectionStatus::DidConnectFailed);
            return Err(SessionError::NativeStackUnavailable(format!(
               "invalid address {identifier}: {e}"
            )));
         },
      };

      let device = self.adapter.device(addr)?;
      self.device = Some(device.clone());
      self.characteristics.clear();

      if let Some(handle) = self.link.take() {
         handle.abort();
      }
      let shared = self.shared.clone();
      self.link = Some(tokio::spawn(async move {
         Self::link(device, identifier, shared).await;
      }));
      Ok(())
   }

   /// Connects, then watches the link until it drops.
   async fn link(device: Device, identifier: SmolStr, shared: Arc<Shared>) {
      shared.status.store(StackStatus::Connecting);
      if let Err(e) = device.connect().await {
         warn!("Failed to connect to {identifier}: {e}");
         shared.status.store(StackStatus::Initialised);
         shared.connection_status(&identifier, ConnectionStatus::DidConnectFailed);
         return;
      }
      info!("Connected to {identifier}");
      shared.status.store(StackStatus::Connected);
      shared.connection_status(&identifier, ConnectionStatus::DidConnect);

      let events = match device.events().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Cannot monitor connection to {identifier}: {e}");
            return;
         },
      };
      pin_mut!(events);
      while let Some(event) = events.next().await {
         if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            break;
         }
      }

      info!("Connection to {identifier} lost");
      shared.status.store(StackStatus::Initialised);
      shared.connection_status(&identifier, ConnectionStatus::DidDisconnect);
   }

   async fn disconnect(&mut self) {
      if let Some(handle) = self.link.take() {
         handle.abort();
      }
      self.notifications.abort_all();
      self.characteristics.clear();
      self.shared.mtu.store(None);

      if let Some(device) = self.device.take()
         && let Err(e) = device.disconnect().await
      {
         debug!("Disconnect from {} failed: {e}", device.address());
      }
      if self.scan.is_none() {
         self.shared.status.store(StackStatus::Initialised);
      }
   }

   async fn discover(&mut self) -> Result<()> {
      let Some(device) = self.device.clone() else {
         warn!("Characteristic discovery requested without a connection");
         return Ok(());
      };

      for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
         if device.is_services_resolved().await? {
            break;
         }
         time::sleep(SERVICE_RESOLVE_POLL).await;
      }

      for service in device.services().await? {
         let service_uuid = service.uuid().await?;
         for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if self.shared.mtu.load().is_none()
               && let Ok(mtu) = characteristic.mtu().await
            {
               self.shared.mtu.store(Some(mtu));
            }
            self.characteristics.insert(uuid, characteristic);
            self.shared.characteristic_discovered(service_uuid, uuid);
         }
      }
      Ok(())
   }

   fn subscribe(&mut self, uuid: Uuid) {
      let Some(characteristic) = self.characteristic(uuid).cloned() else {
         return;
      };

      let shared = self.shared.clone();
      self.notifications.spawn(async move {
         let values = match characteristic.notify().await {
            Ok(values) => values,
            Err(e) => {
               warn!("Failed to subscribe to {uuid}: {e}");
               return;
            },
         };
         pin_mut!(values);
         while let Some(value) = values.next().await {
            shared.value_update(uuid, &value);
         }
         debug!("Notifications from {uuid} ended");
      });
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up BlueZ stack");
      if let Some(handle) = self.scan.take() {
         handle.abort();
      }
      self.disconnect().await;
   }
}
