//! Casket CLI - manipulate OCI image layouts on disk.

pub mod commands;
pub mod output;
pub mod resolve;
