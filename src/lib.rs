//! Distserve - a lifecycle manager for static-file servers
//!
//! This library lets a user register named local directories, each bound to
//! a TCP port and a set of reverse-proxy rules, and:
//! - Starts a static-file server per directory on demand, with the compiled
//!   proxy chain applied ahead of static resolution
//! - Tracks every running server in an in-memory registry that is the sole
//!   truth for "is this id running"
//! - Probes ports before claiming them to catch servers left behind by a
//!   previous run
//! - Gracefully stops servers, escalating to OS-level forced termination
//!   when the port does not come free in time
//! - Exposes start/stop/status over a loopback HTTP control API

pub mod config;
pub mod control;
pub mod error;
pub mod instance;
pub mod manager;
pub mod probe;
pub mod reclaim;
pub mod registry;
pub mod rules;
pub mod store;
