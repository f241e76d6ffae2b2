//! SMTP TLS reports (RFC 8460).

mod parser;
mod types;

pub use parser::parse;
pub use types::{DateRange, DeliveryFailureReport, FailureDetail, Policy, Summary};
