//! Checks that the files Sarus trusts cannot be tampered with by unprivileged users.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::Configuration;
use crate::hooks::registry::HookRegistry;

const GROUP_WRITABLE: u32 = 0o020;
const WORLD_WRITABLE: u32 = 0o002;

#[derive(Debug, Clone)]
pub struct SecurityChecks {
    /// Owner required for every checked path
    privileged_uid: u32,
}

impl Default for SecurityChecks {
    fn default() -> Self {
        Self { privileged_uid: 0 }
    }
}

impl SecurityChecks {
    #[cfg(test)]
    pub(crate) fn with_privileged_uid(privileged_uid: u32) -> Self {
        Self { privileged_uid }
    }

    /// Checks a single filesystem entry, without looking at its ancestors or children.
    pub fn check_entry(&self, path: &Path) -> Result<()> {
        let metadata = fs::symlink_metadata(path)
            .with_context(|| format!("Failed to check that path {:?} is untamperable", path))?;

        if metadata.uid() != self.privileged_uid {
            bail!(
                "Path {:?} must be owned by root in order to prevent other users from tampering its contents. Found uid={}, gid={}.",
                path,
                metadata.uid(),
                metadata.gid()
            );
        }

        // symlink permissions are meaningless
        if !metadata.file_type().is_symlink()
            && metadata.mode() & (GROUP_WRITABLE | WORLD_WRITABLE) != 0
        {
            bail!(
                "Path {:?} cannot be group- or world-writable in order to prevent other users from tampering its contents.",
                path
            );
        }

        Ok(())
    }

    /// Checks `path`, each of its ancestors and, for directories, everything below it.
    /// Missing paths are skipped.
    pub fn check_path_is_untamperable(&self, path: &Path) -> Result<()> {
        log::info!("checking that path {:?} is untamperable", path);
        if !path.exists() {
            log::info!("path {:?} does not exist, skipping", path);
            return Ok(());
        }

        let mut current = Some(path);
        while let Some(p) = current {
            if p == Path::new("/") || !p.exists() {
                break;
            }
            self.check_entry(p)?;
            current = p.parent();
        }

        if path.is_dir() {
            self.check_tree(path)?;
        }

        log::info!("successfully checked that path {:?} is untamperable", path);
        Ok(())
    }

    fn check_tree(&self, dir: &Path) -> Result<()> {
        let entries = fs::read_dir(dir).with_context(|| format!("failed to read {:?}", dir))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read entry of {:?}", dir))?;
            let path = entry.path();
            self.check_entry(&path)?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to get file type of {:?}", path))?;
            if file_type.is_dir() {
                self.check_tree(&path)?;
            }
        }
        Ok(())
    }

    /// The configuration and its schema must both exist, be owned by the
    /// privileged user and only be writable by it. Their ancestors are not checked.
    pub fn check_config_files(&self, config_file: &Path, schema_file: &Path) -> Result<()> {
        if !schema_file.exists() {
            bail!("Configuration schema file {:?} not found", schema_file);
        }
        self.check_entry(config_file)?;
        self.check_entry(schema_file)
    }

    pub fn check_hooks_are_untamperable(&self, registry: &HookRegistry) -> Result<()> {
        log::info!("checking that OCI hooks are untamperable");
        for hook in registry.hooks() {
            self.check_path_is_untamperable(&hook.file)?;
            self.check_path_is_untamperable(&hook.hook.path)?;
        }
        Ok(())
    }

    /// Runs every check required before a container is set up. The
    /// configuration files were already checked when they were loaded.
    pub fn run(&self, config: &Configuration, registry: Option<&HookRegistry>) -> Result<()> {
        if !config.security_checks {
            log::info!("skipping security checks (disabled in the configuration)");
            return Ok(());
        }

        self.check_path_is_untamperable(&config.mksquashfs_path)?;
        self.check_path_is_untamperable(&config.init_path)?;
        self.check_path_is_untamperable(&config.runc_path)?;
        if let Some(registry) = registry {
            self.check_hooks_are_untamperable(registry)?;
        }
        self.check_path_is_untamperable(&config.oci_bundle_dir)?;
        self.check_path_is_untamperable(&config.prefix_dir.join("openssh"))?;
        Ok(())
    }
}
