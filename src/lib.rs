#![forbid(unsafe_code)]

//! Background intercom service for a wallet: correlated request/response
//! channels, a serialized confirmation gate, interactive approvals, and
//! operation confirmation.

pub mod config;
pub mod confirmation;
pub mod dispatch;
pub mod errors;
pub mod gate;
pub mod intercom;
pub mod operation;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
