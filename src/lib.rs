//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates. Host applications can depend on `tablesync-workspace` and
//! enable `desktop-shims` to get the SQLite table store, the reqwest HTTP client
//! and the desktop network monitor wired into `core-service` without listing
//! each crate individually.
