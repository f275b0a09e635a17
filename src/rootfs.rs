//! Filesystem of the container: the OCI bundle directory is covered with a RAM
//! filesystem and the rootfs is an overlay on top of the squashfs image.
//! Every mount happens in a private mount namespace and disappears with it.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::mount::{mount as nix_mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chown, Gid, Uid};

use crate::bundle::UserIdentity;
use crate::config::Configuration;
use crate::utils;

const DEV_OPTIONS: &str = "mode=755,size=65536k";

/// Files copied from the host `/etc`.
const HOST_ETC_FILES: [&str; 2] = ["hosts", "resolv.conf"];
/// Files copied from `<prefixDir>/etc`, generated at installation time.
const PREFIX_ETC_FILES: [&str; 3] = ["nsswitch.conf", "passwd", "group"];

/// Directories of the bundle that make up the rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsLayout {
    pub bundle_dir: PathBuf,
    pub rootfs_dir: PathBuf,
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl RootfsLayout {
    pub fn new(config: &Configuration) -> Self {
        let bundle_dir = config.oci_bundle_dir.clone();
        let overlay = bundle_dir.join("overlay");
        Self {
            rootfs_dir: config.rootfs_dir(),
            lower_dir: overlay.join("rootfs-lower"),
            upper_dir: overlay.join("rootfs-upper"),
            work_dir: overlay.join("rootfs-work"),
            bundle_dir,
        }
    }

    pub fn overlay_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Arguments of `mount` loop mounting a squashfs image.
pub fn squashfs_mount_args(image: &Path, mount_point: &Path) -> Vec<String> {
    vec![
        "-n".to_string(),
        "-o".to_string(),
        "loop,nosuid,nodev,ro".to_string(),
        "-t".to_string(),
        "squashfs".to_string(),
        image.display().to_string(),
        mount_point.display().to_string(),
    ]
}

fn chown_to(path: &Path, identity: &UserIdentity) -> Result<()> {
    chown(
        path,
        Some(Uid::from_raw(identity.uid)),
        Some(Gid::from_raw(identity.gid)),
    )
    .with_context(|| format!("failed to change ownership of {:?}", path))
}

/// Moves this process into its own mount namespace. Nothing mounted
/// afterwards propagates back to the host.
pub fn setup_mount_isolation() -> Result<()> {
    log::info!("setting up mount isolation");
    unshare(CloneFlags::CLONE_NEWNS).context("Failed to unshare the mount namespace")?;
    nix_mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("Failed to remount \"/\" with MS_SLAVE")?;
    Ok(())
}

pub fn setup_ram_filesystem(config: &Configuration) -> Result<()> {
    let fs_type = config.ram_filesystem_type.as_str();
    let bundle_dir = &config.oci_bundle_dir;
    log::info!("setting up {} filesystem on {:?}", fs_type, bundle_dir);
    nix_mount(
        None::<&str>,
        bundle_dir,
        Some(fs_type),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .with_context(|| format!("Failed to setup {} filesystem on {:?}", fs_type, bundle_dir))?;
    nix_mount(
        None::<&str>,
        bundle_dir,
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("Failed to remount {:?} with MS_SLAVE", bundle_dir))?;
    Ok(())
}

pub fn mount_image(layout: &RootfsLayout, image: &Path, identity: &UserIdentity) -> Result<()> {
    log::info!("mounting image {:?} into {:?}", image, layout.rootfs_dir);
    for dir in [&layout.rootfs_dir, &layout.lower_dir, &layout.upper_dir, &layout.work_dir] {
        utils::create_dir_all(dir)?;
    }
    chown_to(&layout.upper_dir, identity)?;

    let status = Command::new("mount")
        .args(squashfs_mount_args(image, &layout.lower_dir))
        .status()
        .context("failed to execute mount")?;
    if !status.success() {
        bail!(
            "Failed to loop mount {:?} on {:?}: mount exited with {}",
            image,
            layout.lower_dir,
            status
        );
    }

    let options = layout.overlay_options();
    nix_mount(
        Some("overlay"),
        &layout.rootfs_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .with_context(|| {
        format!(
            "Failed to mount OverlayFS on {:?} (options: {})",
            layout.rootfs_dir, options
        )
    })?;
    Ok(())
}

pub fn setup_dev_filesystem(config: &Configuration, layout: &RootfsLayout) -> Result<()> {
    let dev = layout.rootfs_dir.join("dev");
    let fs_type = config.ram_filesystem_type.as_str();
    log::info!("setting up /dev filesystem on {:?}", dev);
    utils::create_dir_all(&dev)?;
    nix_mount(
        None::<&str>,
        &dev,
        Some(fs_type),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some(DEV_OPTIONS),
    )
    .with_context(|| format!("Failed to setup {} filesystem on {:?}", fs_type, dev))?;
    Ok(())
}

/// Copies the files describing users, groups and name resolution into the
/// container `/etc`, owned by the user running the container.
pub fn copy_etc_files(
    host_etc: &Path,
    prefix_etc: &Path,
    rootfs_dir: &Path,
    identity: &UserIdentity,
) -> Result<()> {
    let etc = rootfs_dir.join("etc");
    utils::create_dir_all(&etc)?;
    chown_to(&etc, identity)?;

    let sources = HOST_ETC_FILES
        .iter()
        .map(|name| (host_etc, *name))
        .chain(PREFIX_ETC_FILES.iter().map(|name| (prefix_etc, *name)));
    for (dir, name) in sources {
        let destination = etc.join(name);
        utils::copy_file(dir.join(name), &destination)?;
        chown_to(&destination, identity)?;
    }
    Ok(())
}

pub fn remount_rootfs_nosuid(layout: &RootfsLayout) -> Result<()> {
    nix_mount(
        Some(&layout.rootfs_dir),
        &layout.rootfs_dir,
        Some("overlay"),
        MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID,
        None::<&str>,
    )
    .with_context(|| format!("Failed to remount rootfs {:?} with MS_NOSUID", layout.rootfs_dir))
}

/// Prepares the rootfs of the bundle from a squashfs image. Requires the
/// privileges to create mount namespaces and mount filesystems.
pub fn prepare_rootfs(config: &Configuration, image: &Path, identity: &UserIdentity) -> Result<()> {
    log::info!("setting up OCI bundle in {:?}", config.oci_bundle_dir);
    let layout = RootfsLayout::new(config);
    setup_mount_isolation()?;
    setup_ram_filesystem(config)?;
    mount_image(&layout, image, identity)?;
    setup_dev_filesystem(config, &layout)?;
    copy_etc_files(
        Path::new("/etc"),
        &config.prefix_dir.join("etc"),
        &layout.rootfs_dir,
        identity,
    )?;
    remount_rootfs_nosuid(&layout)?;
    log::info!("successfully set up OCI bundle rootfs");
    Ok(())
}
