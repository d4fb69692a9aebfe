//! # LCQ Common Library
//!
//! Shared code for the LCQ landed-cost services including:
//! - Database models and schema initialization
//! - Duty-rate lookup with source-precedence fallback (read path shared
//!   with the quoting service)
//! - Error types
//! - Configuration loading

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
