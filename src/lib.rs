//! Cached bare clones of GitHub repositories, and git subcommands run
//! against them.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod types;

#[cfg(test)]
mod testing;
