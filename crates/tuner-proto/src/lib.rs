//! Wire types, configuration and platform paths shared by the tuner engine
//! and its host process.

pub mod config;
pub mod platform;
pub mod protocol;
