#![warn(missing_docs)]

//! Metashare locking subsystem: multi-mode lock coordination for shared
//! digitization metadata documents.
//!
//! Documents on the shared filesystem reference each other, so plain
//! exclusive locking would starve collaboration. This crate offers four
//! lock modes with distinct compatibility rules (see [`mode::LockMode`]),
//! tracks open read/write channels per resource, and manages temporary
//! frozen copies so immutable readers see a consistent snapshot. The single
//! entry point is [`coordinator::LockCoordinator`].

pub mod coordinator;
pub mod frozen;
pub mod grant;
pub mod ledger;
pub mod mode;
pub mod store;
pub mod streams;
pub mod types;
pub mod vigilant;
