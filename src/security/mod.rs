//! Redaction of sensitive data before events leave the process.
//!
//! Detection is pattern based and heuristic: it catches common credential,
//! personal data and token shapes, and is not a security boundary.

mod filter;
mod patterns;

pub use filter::SecurityFilter;
pub use patterns::{RedactionPatternSet, RedactionRule, ReplaceStrategy};
