//! JSON rule trees (`all`/`any`/`none` over field predicates) used to pick
//! which mail a mailbox imports and which automations fire.

pub mod eval;
pub mod rule;

pub use eval::field_values;
pub use rule::{canonicalize, Branch, Condition, FilterError, FilterRule, Operator, Pattern};
