//! Hierarchical module addressing.
//!
//! - `RequestPath`: the ancestry chain of module instances (`a:0->b:2`)
//! - `RequestPathPattern`: wildcard/quantifier patterns over such chains with
//!   a deterministic priority order

pub mod path;
pub mod pattern;

pub use path::{ModuleId, RequestPath, CHAIN_SEPARATOR, INSTANCE_SEPARATOR};
pub use pattern::{select_best, MatchTimes, ModuleMatcher, PatternSegment, RequestPathPattern};

use thiserror::Error;

/// Malformed path or pattern text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressingError {
    #[error("request path is empty")]
    EmptyPath,

    #[error("empty module name at position {position}")]
    EmptyModule { position: usize },

    #[error("invalid instance id '{text}' for module '{module}'")]
    InvalidInstanceId { module: String, text: String },

    #[error("unbalanced group in pattern '{pattern}'")]
    UnbalancedGroup { pattern: String },

    #[error("invalid quantifier '{text}'")]
    InvalidQuantifier { text: String },

    #[error("unexpected '{found}' at offset {offset} in '{pattern}'")]
    Unexpected {
        found: char,
        offset: usize,
        pattern: String,
    },
}
