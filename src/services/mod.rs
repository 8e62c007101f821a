//! Business logic services
//!
//! Fee math, the escrow lifecycle and the outbound notifications. Services
//! reach collaborators only through the traits in [`crate::ports`].

pub mod escrow_service;
pub mod fee_service;
pub mod notification_service;
