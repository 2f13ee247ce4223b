//! # factdb
//!
//! The command-line front end of factdb. The binary parses arguments into a
//! [`cli::Cli`] and hands it to [`cli::execute`]; configuration is resolved
//! by [`config`].

pub mod cli;
pub mod config;
