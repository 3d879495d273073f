//! Rule language: parser and matcher for metadata predicates.

pub mod matcher;
pub mod parser;

pub use matcher::{RuleError, RuleMatcher};
pub use parser::{RuleArgs, RuleParseError, RuleValue, parse_call};
