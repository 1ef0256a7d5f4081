pub mod block;
pub mod build;
pub mod config;
pub mod error;
pub mod exec;
pub mod flash;
pub mod guest;
pub mod media;
pub mod mount;
pub mod partition;
pub mod volume;

#[macro_use]
extern crate log;
