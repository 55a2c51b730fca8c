#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod config;
pub mod logging;
pub mod models;

pub use config::Config;
