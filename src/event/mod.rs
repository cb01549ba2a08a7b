// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Notifications flowing into and out of the keeper.
//!
//! - [`StateUpdate`] - A state change reported by the host, consumed by the
//!   change observer
//! - [`KeeperEvent`] - What the keeper did (commits, restorations, failures),
//!   broadcast on the [`EventBus`]
//!
//! # Examples
//!
//! ```
//! use state_keeper::event::{EventBus, KeeperEvent};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(KeeperEvent::Flushed { committed: 3, failed: 0 });
//! ```

mod event_bus;
mod keeper_event;
mod state_update;

pub use event_bus::EventBus;
pub use keeper_event::KeeperEvent;
pub use state_update::StateUpdate;
