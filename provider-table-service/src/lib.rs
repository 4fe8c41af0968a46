//! # Table Service Provider
//!
//! Implements the `RemoteTable` trait against the table service REST API.
//!
//! ## Overview
//!
//! This module provides:
//! - Create, patch and delete of items with `If-Match` version preconditions
//! - Keyset-paged incremental queries ordered by `(updatedAt, id)`
//! - Classification of every response into ok, conflict, transient,
//!   unauthorized or permanent outcomes
//!
//! The client performs exactly one HTTP attempt per call. Retrying transient
//! failures is left to the caller of the sync cycle.

pub mod client;
pub mod error;
pub mod types;

pub use client::{TableServiceClient, API_VERSION, API_VERSION_HEADER};
pub use error::{Result, TableServiceError};
