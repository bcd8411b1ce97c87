//! Relay Optimizer
//!
//! Keeps a fleet of block-producer nodes connected to the fastest reachable
//! relays of their public network.
//!
//! ```text
//! topology source ──> optimizer (lock, reconcile, probe, persist) ──> inventory
//!                                                                       │
//!                       topology writer / HTTP API <── selection <──────┘
//! ```

pub mod api;
pub mod config;
pub mod inventory;
pub mod nettest;
pub mod optimizer;
pub mod probe;
pub mod topology;
pub mod types;
