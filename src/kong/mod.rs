//! Typed client for the Kong Admin API.
//!
//! Only the pieces of the Admin API the controller drives are modeled: the
//! node information endpoint (`/`) and the API objects collection (`/apis`).
//! ref: https://getkong.org/docs/0.10.x/admin-api/

mod api;
mod client;
mod types;

pub use client::KongClient;
pub use types::{Api, ApiList, KongError, KongVersion};
