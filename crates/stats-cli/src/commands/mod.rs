//! CLI subcommand implementations.

pub mod rows;
pub mod summary;

#[cfg(test)]
pub(crate) mod fixtures;
