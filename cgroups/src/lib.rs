//! Control groups provide a way of controlling groups of processes.
//! This crate covers the part of cgroup handling a container launcher needs around the
//! low-level runtime: locating hierarchies, reading the device whitelist the launcher
//! itself is confined by, and tearing down the cgroups created for a container.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod common;
pub mod v1;
