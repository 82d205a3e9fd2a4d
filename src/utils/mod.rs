//!
//! Utility module for the sync core.
//!
//! Amount formatting helpers.
/// Amount and fee-rate formatting
pub mod index;

pub use index::{btc_per_kb_to_sat_per_vb, format_btc_amount};
