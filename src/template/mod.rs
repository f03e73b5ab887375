//! Token expansion for automation payloads and message templates.
//!
//! `{{ name }}` tokens resolve against a JSON context (dotted paths, a flat
//! `UPPER_SNAKE` map, caller tokens, dynamic repository queries and stored
//! message templates). `{{if a > b then x else y}}` selects a branch whose text
//! is rendered again.

pub mod conditional;
pub mod dynamic;
pub mod engine;
pub mod path;
pub mod pg;
pub mod source;
pub mod tokens;

pub use dynamic::{DynamicQuery, DynamicQuerySource, MemoryDynamicQuerySource};
pub use engine::{TemplateEngine, TokenMap};
pub use pg::{PgDynamicQuerySource, PgTemplateSource};
pub use source::{MemoryTemplateSource, MessageTemplate, TemplateSource};
