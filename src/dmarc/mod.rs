//! DMARC aggregate reports (RFC 7489, appendix C).

mod parser;
pub mod tree;
mod types;

pub use parser::parse;
pub use types::{AggregateReport, ResultTally, DEFAULT_POLICY};
