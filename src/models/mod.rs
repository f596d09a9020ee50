//! Domain model module declarations.

pub mod envelope;
pub mod hook;
pub mod permission;
pub mod session;
pub mod tool;
