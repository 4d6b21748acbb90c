//! Session broker core: per-session actors that own a sandbox lifecycle,
//! stream agent output over WebSockets, and reconcile state with durable
//! storage and the database of record.

pub mod actor;
pub mod broadcaster;
pub mod cli;
pub mod normalizer;
pub mod router;
pub mod session;
pub mod store;
