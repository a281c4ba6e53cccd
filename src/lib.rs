//! BLE central-role session manager.
//!
//! Native BLE stacks report scan results, discovered characteristics,
//! notifications and connection changes from a background thread. This crate
//! funnels those callbacks into a queue and applies them to a connection state
//! machine only when the host calls [`Session::tick`] on its own control
//! thread.
//!
//! ```
//! use ble_session::{Session, SessionPolicy, bluetooth::sim::SimulatedStack};
//!
//! let stack = SimulatedStack::new();
//! let radio = stack.radio();
//! let mut session = Session::new(stack, SessionPolicy::new().select_by_name("X"));
//! session.open()?;
//! session.start_scan(&[])?;
//!
//! radio.emit_scan_result("X", -60, "AA:BB");
//! let report = session.tick();
//! assert_eq!(report.scan_results.len(), 1);
//! assert_eq!(session.peer(), Some("AA:BB"));
//! # Ok::<(), ble_session::SessionError>(())
//! ```

pub mod bluetooth;
pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod state;

pub use crate::{
   bluetooth::{NativeStack, StackStatus},
   error::{Result, SessionError},
   event::{BridgeEvent, CharacteristicRef, ConnectionStatus, ScanResult, ValueUpdate},
   session::{Session, TickReport},
   state::{SessionPolicy, SessionState},
};
