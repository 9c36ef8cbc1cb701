//! Database entities.

pub mod object;
