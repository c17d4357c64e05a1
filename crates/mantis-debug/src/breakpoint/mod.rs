//! Breakpoint model, condition expressions, and the registry.

pub mod expr;
pub mod model;
pub mod registry;
