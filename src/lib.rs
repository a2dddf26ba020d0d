#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod actuator;
pub mod agent;
pub mod brain;
pub mod config;
pub mod context;
pub mod emotion;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod history;
pub mod monitor;
pub mod permissions;
pub mod presenter;
pub mod store;

pub use config::Config;
pub use error::{FamulusError, Result};
