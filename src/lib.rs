//! A rust driver for multi-channel APT motion controllers ([BBD203](https://www.thorlabs.com/thorproduct.cfm?partnumber=BBD203) and compatible) over a serial byte stream.
//!
//! [`Controller`] owns the connection. A background thread decodes everything the controller
//! sends, keeps a per-channel state table current and resolves the requests callers are waiting
//! on. Positions, velocities and accelerations are in physical units at the API and in device
//! counts on the wire; see [`ScalingContext`].

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true
)]
#![deny(
// missing_debug_implementations,
missing_docs,
trivial_casts,
trivial_numeric_casts,
unused_extern_crates,
unused_import_braces,
unused_qualifications,
// unused_results
)]
#![warn(clippy::unwrap_used)]

mod callbacks;
mod channel;
pub mod commands;
mod config;
mod controller;
mod dispatcher;
mod error;
mod monitor;
pub mod protocol;
mod scaling;
pub mod transport;

pub use callbacks::{CallbackId, CallbackResult, Event, EventKind};
pub use channel::ChannelStatus;
pub use commands::StopMode;
pub use config::DriverConfig;
pub use controller::{Controller, VelocityProfile};
pub use dispatcher::{Completion, CompletionKind};
pub use error::*;
pub use protocol::{Frame, StatusBits};
pub use scaling::ScalingContext;
pub use transport::Transport;
