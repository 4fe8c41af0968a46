//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the table sync core:
//! - Logging and tracing infrastructure
//! - Host configuration and capability injection
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that other modules depend on.
//! It establishes the logging conventions, the fail-fast configuration
//! builder, and the event broadcasting used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
