//! Daily up/down prediction round keeper.
//!
//! Components are constructed explicitly and shared by `Arc`; see
//! [`app::Services`] for the wiring used by the binary.

pub mod app;
pub mod broadcast;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod oracle;
pub mod price;
pub mod rounds;
pub mod store;
