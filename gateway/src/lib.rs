//! Device-manager gateway runtime.
//!
//! Runs on a computer co-located with the sensors and actuators of one or
//! more facilities (seed bank, nursery). Drivers implementing the [`device::Device`]
//! contract are composed into a registry, polled on independent cadences,
//! audited for staleness by a watchdog, evaluated against site automations,
//! and their samples batched up and synced to the backend server.

pub mod alerts;
pub mod automation;
pub mod config;
pub mod device;
pub mod drivers;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod watchdog;
