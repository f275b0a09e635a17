//! Local image repository: `<repository>/metadata.json` lists the images,
//! `<repository>/images/<unique key>.{squashfs,meta}` hold their contents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::metadata::ImageMetadata;
use super::reference::ImageReference;
use crate::utils;

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// An entry of the repository metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub unique_key: String,
    pub server: String,
    pub namespace: String,
    pub image: String,
    pub tag: String,
    pub digest: String,
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
    pub datasize: String,
    pub created: String,
}

impl StoredImage {
    pub fn reference(&self) -> ImageReference {
        ImageReference {
            server: self.server.clone(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            tag: self.tag.clone(),
        }
    }

    pub fn metadata(&self) -> Result<ImageMetadata> {
        ImageMetadata::load(&self.metadata_path)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RepositoryMetadata {
    #[serde(default)]
    images: Vec<StoredImage>,
}

/// Read access to the images a container can be started from.
pub trait ImageStore {
    /// Whether the image is listed in the repository. Never contacts a registry.
    fn is_available(&self, reference: &ImageReference) -> Result<bool>;
    /// The listed image, after checking that its backing files exist.
    fn find(&self, reference: &ImageReference) -> Result<StoredImage>;
    fn list(&self) -> Result<Vec<StoredImage>>;
}

/// Outcome of contacting the registry for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Fetched,
    AlreadyUpToDate,
}

/// Fetches images from a registry into a repository.
pub trait Puller {
    fn pull(&self, reference: &ImageReference) -> Result<PullOutcome>;
}

/// Pulls the image only when the repository does not list it yet.
/// Returns `None` when the local copy was used.
pub fn pull_if_necessary<S: ImageStore, P: Puller>(
    store: &S,
    puller: &P,
    reference: &ImageReference,
) -> Result<Option<PullOutcome>> {
    if store.is_available(reference)? {
        log::info!("image {} is already available", reference);
        return Ok(None);
    }
    log::info!("image {} is not available, pulling it", reference);
    let outcome = puller.pull(reference)?;
    Ok(Some(outcome))
}

#[derive(Debug, Clone)]
pub struct LocalImageStore {
    repository: PathBuf,
    centralized: bool,
}

impl LocalImageStore {
    pub fn new<P: Into<PathBuf>>(repository: P) -> Self {
        Self {
            repository: repository.into(),
            centralized: false,
        }
    }

    pub fn centralized<P: Into<PathBuf>>(repository: P) -> Self {
        Self {
            repository: repository.into(),
            centralized: true,
        }
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.repository.join(METADATA_FILE_NAME)
    }

    fn read_metadata(&self) -> Result<RepositoryMetadata> {
        let path = self.metadata_file();
        if !path.exists() {
            return Ok(RepositoryMetadata::default());
        }
        let reader = utils::open(&path)?;
        serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse repository metadata {:?}", path))
    }

    fn pull_hint(&self, reference: &ImageReference) -> String {
        let option = if self.centralized {
            " --centralized-repository"
        } else {
            ""
        };
        format!(
            "sarus pull{} {}:{}",
            option,
            reference.repository(),
            reference.tag
        )
    }
}

impl ImageStore for LocalImageStore {
    fn is_available(&self, reference: &ImageReference) -> Result<bool> {
        let key = reference.unique_key();
        Ok(self
            .read_metadata()?
            .images
            .iter()
            .any(|i| i.unique_key == key))
    }

    fn find(&self, reference: &ImageReference) -> Result<StoredImage> {
        let key = reference.unique_key();
        let image = match self
            .read_metadata()?
            .images
            .into_iter()
            .find(|i| i.unique_key == key)
        {
            Some(image) => image,
            None => bail!(
                "Specified image {} is not available. Hint: pull it first with '{}'",
                reference,
                self.pull_hint(reference)
            ),
        };

        for file in [&image.image_path, &image.metadata_path] {
            if !file.exists() {
                bail!(
                    "Storage inconsistency detected: image {} is listed in {:?} but its file {:?} is missing. Hint: pull the image again with '{}'",
                    reference,
                    self.metadata_file(),
                    file,
                    self.pull_hint(reference)
                );
            }
        }

        Ok(image)
    }

    fn list(&self) -> Result<Vec<StoredImage>> {
        Ok(self.read_metadata()?.images)
    }
}
