//! Media-analysis service client.
//!
//! This module provides a `MediaService` trait covering the HTTP contract of
//! the service, an HTTP implementation, and fire-and-forget beacons for
//! exit-time requests.

mod beacon;
mod client;
mod error;
mod http;
mod types;

pub use beacon::{
    dispatch_detached, send_or_detach, spawn_beacon_dispatcher, Beacon, BeaconEnvelope,
    BeaconHandle,
};
pub use client::MediaService;
pub use error::ApiError;
pub use http::{resolve_reference, HttpMediaService};
pub use types::*;
