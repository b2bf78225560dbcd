//! Domain model module declarations.

pub mod command;
pub mod health;
pub mod session;
