use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::descriptor::{HookDescriptor, Stage};

/// Hooks configured on the system, in execution order.
///
/// The order is decided once, by descriptor file name, when the registry is built.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<HookDescriptor>,
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_descriptors(hooks: Vec<HookDescriptor>) -> Self {
        Self { hooks }
    }

    /// Parses every `*.json` file of `hooks_dir`. A descriptor that cannot be
    /// parsed is left out with a warning, the other hooks stay usable.
    pub fn discover(hooks_dir: &Path) -> Result<Self> {
        log::info!("creating OCI hooks from {:?}", hooks_dir);
        if !hooks_dir.is_dir() {
            bail!("Specified hooks directory {:?} is not valid", hooks_dir);
        }

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(hooks_dir)
            .with_context(|| format!("failed to read hooks directory {:?}", hooks_dir))?
        {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") && path.is_file() {
                log::debug!("found OCI hook's config file {:?}", path);
                files.push(path);
            }
        }
        files.sort();

        let mut hooks = Vec::with_capacity(files.len());
        for file in files {
            match HookDescriptor::load(&file) {
                Ok(hook) => hooks.push(hook),
                Err(err) => log::warn!("skipping hook descriptor {:?}: {:#}", file, err),
            }
        }

        log::info!("successfully created {} OCI hooks", hooks.len());
        Ok(Self::from_descriptors(hooks))
    }

    pub fn hooks(&self) -> &[HookDescriptor] {
        &self.hooks
    }

    /// Hooks firing on `stage`, in registry order.
    pub fn for_stage(&self, stage: Stage) -> impl Iterator<Item = &HookDescriptor> {
        self.hooks.iter().filter(move |hook| hook.fires_on(stage))
    }
}
