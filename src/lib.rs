//! Mockwire - WebSocket session core for a record/replay mock server
//!
//! Tracks live connections and their group memberships, captures
//! conversations frame by frame and plays them back on demand.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod id;
pub mod network;
pub mod recording;
pub mod replay;
pub mod session;

pub use error::{MockError, Result};
