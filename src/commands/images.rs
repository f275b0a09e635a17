//! Contains functionality of the images command
use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;
use tabwriter::TabWriter;

use super::{load_configuration, GlobalOpts};
use crate::image::{ImageStore, LocalImageStore, StoredImage};
use crate::utils;

const SHORT_DIGEST_LENGTH: usize = 12;

/// List images
#[derive(Parser, Debug, Default)]
pub struct Images {
    /// Show the full digests
    #[clap(long)]
    pub digests: bool,
    /// Use the centralized repository instead of the local one
    #[clap(long)]
    pub centralized_repository: bool,
}

fn displayed_digest(digest: &str, full: bool) -> &str {
    if full {
        return digest;
    }
    match digest.char_indices().nth(SHORT_DIGEST_LENGTH) {
        Some((end, _)) => &digest[..end],
        None => digest,
    }
}

pub fn render<W: Write>(out: W, images: &[StoredImage], full_digests: bool) -> Result<()> {
    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "REPOSITORY\tTAG\tDIGEST\tCREATED\tSIZE\tSERVER")?;
    for image in images {
        writeln!(
            &mut tab_writer,
            "{}\t{}\t{}\t{}\t{}\t{}",
            image.reference().repository(),
            image.tag,
            displayed_digest(&image.digest, full_digests),
            image.created,
            image.datasize,
            image.server
        )?;
    }
    tab_writer.flush()?;
    Ok(())
}

pub fn images(args: Images, global: &GlobalOpts) -> Result<()> {
    let config = load_configuration(global)?;
    let username = utils::current_username()?;
    let repository = config.repository_dir(args.centralized_repository, &username)?;
    let store = if args.centralized_repository {
        LocalImageStore::centralized(repository)
    } else {
        LocalImageStore::new(repository)
    };
    let mut images = store.list()?;
    images.sort_by(|a, b| a.unique_key.cmp(&b.unique_key));
    render(io::stdout(), &images, args.digests)
}
