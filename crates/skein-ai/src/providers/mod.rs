//! Model provider implementations

pub mod anthropic;
