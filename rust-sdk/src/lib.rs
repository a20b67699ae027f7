//! The Rust server-side SDK for flagstream, a feature-flag and
//! experimentation platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that keeps an in-process snapshot
//! of your environment's flags and segments fresh over a streaming
//! connection, and answers "which variation of flag F should this user
//! see?" in constant time against that snapshot. Evaluation telemetry is
//! batched and shipped back to the flag center in the background.
//!
//! # Typed variations
//!
//! Every flag has a value type fixed in the dashboard. Read it with the
//! matching method:
//! - [`Client::variation()`] for string flags
//! - [`Client::bool_variation()`]
//! - [`Client::int_variation()`] / [`Client::double_variation()`]
//! - [`Client::json_variation()`]
//!
//! Each returns an [`EvalDetail`] carrying the served value, the decision
//! reason, and the flag identity. On any failure the caller-supplied
//! default comes back with the failure reason; evaluation never panics.
//!
//! # Startup
//!
//! Construction blocks up to [`ClientConfig::DEFAULT_START_WAIT`] for the
//! first data sync. With a zero start-wait the client returns immediately
//! and [`Client::status_provider()`] offers wait-for-state semantics:
//!
//! ```no_run
//! # use std::time::Duration;
//! # use flagstream::{Client, ClientConfig};
//! let client = Client::with_config(
//!     "a1b2c3d4e5f6",
//!     "wss://flags.example.com",
//!     "https://events.example.com",
//!     ClientConfig::default().start_wait(Duration::ZERO),
//! ).unwrap();
//! if !client.status_provider().wait_for_ok(Duration::from_secs(10)) {
//!     // proceed with defaults; the SDK keeps retrying in the background
//! }
//! ```
//!
//! # Logging
//!
//! The SDK logs through the [`log`](https://docs.rs/log) crate under the
//! `flagstream` target. Install a `log`-compatible logger for visibility
//! into sync and delivery activity.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod all_flags;
mod client;
mod config;

#[doc(inline)]
pub use flagstream_core::{
    updater::{State, StateType, StatusProvider},
    Error, FlagUser, Result, UserBuilder,
};

pub use all_flags::AllFlagState;
pub use client::{Client, EvalDetail};
pub use config::ClientConfig;
