//! Replicated store integration.
//!
//! This module defines the wire-level model shared with the store and the
//! contract the agent consumes:
//! - [`types`] - Versioned values, publications, areas, key filters
//! - [`client`] - The [`client::StoreHandle`] trait and request parameters

pub mod client;
pub mod types;
