//! Result reporting
//!
//! - `text`: console tables, one block per round
//! - `json`: machine-readable run report

pub mod json;
pub mod text;
