//! Run Controller.
//!
//! The one crate downstream consumers (the CLI, or any embedder) depend on
//! directly. Everything else in the workspace is a stage this crate wires
//! together: `stackctl-plan`'s `discover -> compile -> select -> build_graph`
//! pipeline produces a [`stackctl_types::Plan`], which [`Controller`] hands
//! to a [`stackctl_engine::Scheduler`] against a [`stackctl_store::SqliteRunStore`].

pub mod controller;
pub mod error;

pub use controller::Controller;
pub use error::StackError;
