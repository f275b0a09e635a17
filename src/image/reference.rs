use std::fmt::Display;
use std::str::FromStr;

use anyhow::{bail, Result};

pub const DEFAULT_SERVER: &str = "index.docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// A normalized image reference: `server/namespace/image:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    pub server: String,
    pub namespace: String,
    pub image: String,
    pub tag: String,
}

impl ImageReference {
    /// Parses `[server/][namespace/]image[:tag][@digest]`. A digest is accepted
    /// for compatibility with registry references but not kept, images are
    /// stored by tag.
    pub fn parse(input: &str) -> Result<Self> {
        log::debug!("parsing image reference '{}'", input);
        if input.contains("..") {
            bail!(
                "Invalid image ID '{}'\nImage IDs are not allowed to contain the sequence '..'",
                input
            );
        }

        let without_digest = match input.split_once('@') {
            Some((name, _digest)) => name,
            None => input,
        };

        let components: Vec<&str> = without_digest.splitn(3, '/').collect();
        let (server, namespace, last) = match components[..] {
            [server, namespace, last] => (server, namespace, last),
            [namespace, last] => (DEFAULT_SERVER, namespace, last),
            [last] => (DEFAULT_SERVER, DEFAULT_NAMESPACE, last),
            _ => bail!("Invalid image ID '{}'", input),
        };

        let (image, tag) = match last.rsplit_once(':') {
            Some((image, tag)) => (image, tag),
            None => (last, DEFAULT_TAG),
        };

        if [server, namespace, image, tag].iter().any(|s| s.is_empty()) {
            bail!("Invalid image ID '{}'", input);
        }

        Ok(Self {
            server: server.to_string(),
            namespace: namespace.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Key identifying the image in the repository, also the relative path of its files.
    pub fn unique_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.server, self.namespace, self.image, self.tag
        )
    }

    /// Repository name as shown by `sarus images`: defaults are omitted.
    pub fn repository(&self) -> String {
        if self.server != DEFAULT_SERVER {
            format!("{}/{}/{}", self.server, self.namespace, self.image)
        } else if self.namespace != DEFAULT_NAMESPACE {
            format!("{}/{}", self.namespace, self.image)
        } else {
            self.image.clone()
        }
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.server, self.namespace, self.image, self.tag
        )
    }
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
