//! Translation of a container request into an OCI bundle.

pub mod builder;
pub mod device;
pub mod environment;
pub mod mount;
pub mod oci;
pub mod request;

pub use builder::{BundleBuilder, UserIdentity};
pub use oci::{Bundle, BundleEntries};
pub use request::{ContainerRequest, PidMode};
