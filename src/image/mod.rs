//! Images a container is started from. Pulling from registries is left to
//! implementations of [`Puller`], this module only reads the local repositories.

pub mod metadata;
pub mod reference;
pub mod store;

pub use metadata::ImageMetadata;
pub use reference::ImageReference;
pub use store::{pull_if_necessary, ImageStore, LocalImageStore, PullOutcome, Puller, StoredImage};
