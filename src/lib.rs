// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `state_keeper` - Remember the state of your lights across host restarts.
//!
//! Home automation hosts often lose track of light states when they restart:
//! lights come back in whatever default the hardware chooses. This library
//! watches the lights you configure, durably records their last steady state,
//! and drives them back to it after a restart.
//!
//! # Components
//!
//! - **Snapshot store** ([`store`]): one JSON file, rewritten atomically on
//!   every committed change, tolerant of corruption on load
//! - **Change observer** ([`observer`]): per-entity debounce of the host's
//!   state-change stream, so a dimmer slide becomes one write
//! - **Shutdown flush** ([`shutdown`]): commits everything still pending
//!   before the host exits
//! - **Restoration** ([`restore`]): per-entity retry with exponential
//!   backoff, failures aggregated into one report
//!
//! The host platform is abstracted behind the [`Host`](host::Host) trait;
//! [`StateKeeper`] wires the components together.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use state_keeper::config::{KeeperConfig, RetryPolicy};
//! use state_keeper::host::InMemoryHost;
//! use state_keeper::types::EntityId;
//! use state_keeper::StateKeeper;
//!
//! #[tokio::main]
//! async fn main() -> state_keeper::Result<()> {
//!     let config = KeeperConfig::new("/var/lib/keeper/lights.json")
//!         .with_entity(EntityId::new("light.kitchen")?)
//!         .with_entity(EntityId::new("light.hallway")?)
//!         .with_debounce(Duration::from_secs(2))
//!         .with_retry(RetryPolicy::default());
//!
//!     let keeper = StateKeeper::new(config, Arc::new(InMemoryHost::new()));
//!     keeper.start().await;
//!
//!     match keeper.wait_for_restoration().await {
//!         Ok(report) => println!("restored {} light(s)", report.restored.len()),
//!         Err(e) => eprintln!("{e}"),
//!     }
//!
//!     let flushed = keeper.shutdown().await;
//!     println!("flushed {} pending update(s)", flushed.total());
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! The library logs through [`tracing`] and installs no subscriber.

pub mod config;
pub mod error;
pub mod event;
pub mod host;
mod keeper;
pub mod observer;
pub mod restore;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod types;

pub use config::{KeeperConfig, RetryPolicy};
pub use error::{EntityFailure, Error, HostError, PersistenceError, Result, ValueError};
pub use event::{EventBus, KeeperEvent, StateUpdate};
pub use host::{Host, InMemoryHost};
pub use keeper::StateKeeper;
pub use restore::{RestorationReport, RestorationStatus};
pub use shutdown::FlushReport;
pub use state::{EntityState, EntityStateRecord};
pub use store::SnapshotStore;
pub use types::{AttributeValue, EntityId, PowerState};
