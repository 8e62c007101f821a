//! Escrow settlement service library
//!
//! Payments are held in escrow and released to the payee by background jobs
//! once the hold window and the rating gate allow it. The binary wires this
//! library to an HTTP admin surface.

pub mod config;
pub mod error;
pub mod handlers;
pub mod infrastructure;
pub mod jobs;
pub mod models;
pub mod ports;
pub mod services;
pub mod state;

pub use config::Settings;
pub use error::{AppError, Result};
pub use models::*;
pub use state::AppState;
