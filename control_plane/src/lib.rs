#![warn(
    clippy::pedantic,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::needless_pass_by_value,
    clippy::needless_continue,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::struct_field_names
)]

pub mod apisix;
pub mod batch;
pub mod cli;
pub mod cluster;
pub mod controllers;
pub mod diff;
pub mod endpoints;
pub mod errors;
mod instrumentation;
pub mod kubernetes;
pub mod mirror;
pub mod options;
pub mod ownership;
pub mod pipeline;
pub mod secrets;

pub use errors::{AggregateError, SyncError};
pub use mirror::MirrorStore;
pub use options::Options;
pub use pipeline::{Pipeline, SyncReport, Target};
