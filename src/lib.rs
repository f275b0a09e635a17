#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod bundle;
pub mod commands;
pub mod config;
pub mod hooks;
pub mod image;
pub mod logger;
pub mod rootfs;
pub mod security;
pub mod supervisor;
pub mod utils;
