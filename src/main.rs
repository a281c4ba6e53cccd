//! BLE session host.
//!
//! Drives a [`Session`] over the system Bluetooth stack from a fixed-rate
//! tick, printing scan results and notifications as JSON lines on stdout.

use std::time::Duration;

use log::{info, warn};
use tokio::{signal, time};

use ble_session::{Result, Session, SessionState, bluetooth::bluez::BluezStack, config::Config};

/// Minimum delay between scan attempts.
const SCAN_RETRY: Duration = Duration::from_secs(1);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting BLE session host...");

   let config = Config::load()?;
   match &config.target_name {
      Some(name) => info!("Looking for peripheral {name:?}"),
      None => info!("No target configured, reporting scan results only"),
   }

   let mut session = Session::new(BluezStack::new(), config.policy());
   session.open()?;

   let mut ticker = time::interval(Duration::from_millis(config.tick_interval_ms.max(1)));
   ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

   let mut next_scan = time::Instant::now();
   loop {
      tokio::select! {
         now = ticker.tick() => {
            // Rescan whenever the session falls back to idle, e.g. after a lost link
            if session.state() == SessionState::Idle
               && !session.is_scanning()
               && session.is_ready()
               && now >= next_scan
            {
               next_scan = now + SCAN_RETRY;
               if let Err(e) = session.start_scan(&config.scan_services) {
                  warn!("Failed to start scan: {e}");
               }
            }

            let report = session.tick();
            for t in &report.transitions {
               info!("Session {} -> {}", t.from, t.to);
            }
            for chr in &report.characteristics {
               info!("Characteristic {} in service {}", chr.characteristic(), chr.service());
            }
            for result in &report.scan_results {
               println!("{}", result.to_json());
            }
            for update in &report.value_updates {
               println!("{}", update.to_json());
            }
         },
         result = signal::ctrl_c() => {
            result?;
            break;
         },
      }
   }

   info!("Shutting down BLE session host...");
   session.before_unload();
   Ok(())
}
