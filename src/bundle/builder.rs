use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use cgroups::v1::HostWhitelist;
use nix::unistd::{getgid, getgroups, getuid};
use oci_spec::runtime::{
    Hook, HooksBuilder, LinuxBuilder, LinuxCapabilitiesBuilder, LinuxNamespaceBuilder,
    LinuxNamespaceType, LinuxResourcesBuilder, LinuxSeccomp, Mount, MountBuilder, ProcessBuilder,
    RootBuilder, SpecBuilder, UserBuilder,
};

use super::device::{merge_devices, resolve_cli_device, resolve_site_device, DeviceEntry};
use super::environment::{self, Environment, EnvironmentSources};
use super::mount::{merge_mounts, parse_mount_request, MountEntry};
use super::oci::{self, Bundle};
use super::request::{ContainerRequest, PidMode};
use crate::config::Configuration;
use crate::hooks::{all_match, ConditionContext, HookRegistry, Stage};
use crate::image::ImageMetadata;
use crate::utils;

pub const INIT_PATH_IN_CONTAINER: &str = "/dev/init";

pub const ANNOTATION_LOGGING_LEVEL: &str = "com.hooks.logging.level";
pub const ANNOTATION_MPI_ENABLED: &str = "com.hooks.mpi.enabled";
pub const ANNOTATION_MPI_TYPE: &str = "com.hooks.mpi.type";
pub const ANNOTATION_GLIBC_ENABLED: &str = "com.hooks.glibc.enabled";
pub const ANNOTATION_SSH_ENABLED: &str = "com.hooks.ssh.enabled";

/// Identity the container process runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

impl UserIdentity {
    pub fn current() -> Result<Self> {
        let additional_gids = getgroups()
            .context("failed to get supplementary groups")?
            .into_iter()
            .map(|g| g.as_raw())
            .collect();
        Ok(Self {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            additional_gids,
        })
    }
}

/// Command of the container process. An entrypoint given on the command line
/// replaces the one of the image and drops the command of the image.
pub fn resolve_command(request: &ContainerRequest, image: &ImageMetadata) -> Result<Vec<String>> {
    let entrypoint = match &request.entrypoint {
        Some(entrypoint) => entrypoint.clone(),
        None => image.entry.clone().unwrap_or_default(),
    };
    let command = if !request.command.is_empty() {
        request.command.clone()
    } else if request.entrypoint.is_none() {
        image.cmd.clone().unwrap_or_default()
    } else {
        Vec::new()
    };

    let args: Vec<String> = entrypoint.into_iter().chain(command).collect();
    if args.is_empty() {
        bail!(
            "Failed to determine the command to execute in the container. At least one command or an entry point should be specified through the CLI arguments or the image metadata."
        );
    }
    Ok(args)
}

pub fn resolve_workdir(request: &ContainerRequest, image: &ImageMetadata) -> PathBuf {
    request
        .workdir
        .clone()
        .or_else(|| image.workdir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Parses `--annotation KEY=VALUE` options. A bare `KEY` gets an empty value.
pub fn parse_annotations(tokens: &[String]) -> Result<BTreeMap<String, String>> {
    tokens
        .iter()
        .map(|token| {
            let (key, value) = utils::parse_key_value(token).map_err(|e| {
                anyhow!(
                    "Failed to parse annotation requested from CLI '{}': {}",
                    token,
                    e
                )
            })?;
            Ok((key, value.unwrap_or_default()))
        })
        .collect()
}

/// Turns a [`ContainerRequest`] into an OCI bundle. Every request is validated
/// before anything is written, the first invalid one aborts the build.
pub struct BundleBuilder<'a> {
    config: &'a Configuration,
    request: &'a ContainerRequest,
    image: &'a ImageMetadata,
    host_env: Environment,
    whitelist: Option<HostWhitelist>,
    hooks: Option<&'a HookRegistry>,
    identity: Option<UserIdentity>,
    log_level: u8,
}

impl<'a> BundleBuilder<'a> {
    pub fn new(
        config: &'a Configuration,
        request: &'a ContainerRequest,
        image: &'a ImageMetadata,
    ) -> Self {
        Self {
            config,
            request,
            image,
            host_env: std::env::vars().collect(),
            whitelist: None,
            hooks: None,
            identity: None,
            log_level: crate::logger::hook_log_level(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_host_env(mut self, host_env: Environment) -> Self {
        self.host_env = host_env;
        self
    }

    /// Device whitelist to honour instead of the one of the calling process.
    #[cfg(test)]
    pub(crate) fn with_whitelist(mut self, whitelist: HostWhitelist) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    /// Hooks to embed for the `startContainer` stage.
    pub fn with_hooks(mut self, hooks: &'a HookRegistry) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_identity(mut self, identity: UserIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_log_level(mut self, log_level: u8) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn environment(&self) -> Result<Environment> {
        environment::resolve_environment(&EnvironmentSources {
            host: &self.host_env,
            image: &self.image.env,
            policy: &self.config.environment,
            cli: &self.request.env,
            mpi: self.request.mpi_enabled(),
            ssh: self.request.ssh,
            pmix_v3: self.config.enable_pmix_v3_support,
        })
    }

    pub fn mounts(&self) -> Result<Vec<MountEntry>> {
        let site = self
            .config
            .site_mounts
            .iter()
            .map(MountEntry::from_site)
            .collect::<Result<Vec<_>>>()?;
        let cli = self
            .request
            .mounts
            .iter()
            .map(|token| parse_mount_request(token, &self.config.user_mounts))
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_mounts(site, cli))
    }

    pub fn devices(&self) -> Result<Vec<DeviceEntry>> {
        if self.config.site_devices.is_empty() && self.request.devices.is_empty() {
            return Ok(Vec::new());
        }
        let whitelist = match &self.whitelist {
            Some(whitelist) => whitelist.clone(),
            None => HostWhitelist::for_current_process()?,
        };
        let site = self
            .config
            .site_devices
            .iter()
            .map(|device| resolve_site_device(device, &whitelist))
            .collect::<Result<Vec<_>>>()?;
        let cli = self
            .request
            .devices
            .iter()
            .map(|token| resolve_cli_device(token, &whitelist))
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_devices(site, cli))
    }

    pub fn annotations(&self) -> Result<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_LOGGING_LEVEL.to_string(),
            self.log_level.to_string(),
        );
        if self.request.mpi_enabled() {
            annotations.insert(ANNOTATION_MPI_ENABLED.to_string(), "true".to_string());
            let mpi_type = self
                .request
                .mpi_type
                .as_ref()
                .or(self.config.default_mpi_type.as_ref());
            if let Some(mpi_type) = mpi_type {
                annotations.insert(ANNOTATION_MPI_TYPE.to_string(), mpi_type.clone());
            }
        }
        if self.request.glibc {
            annotations.insert(ANNOTATION_GLIBC_ENABLED.to_string(), "true".to_string());
        }
        if self.request.ssh {
            annotations.insert(ANNOTATION_SSH_ENABLED.to_string(), "true".to_string());
        }
        annotations.extend(parse_annotations(&self.request.annotations)?);
        Ok(annotations)
    }

    fn start_container_hooks(
        &self,
        annotations: &BTreeMap<String, String>,
        argv0: Option<&str>,
        has_bind_mounts: bool,
    ) -> Result<Vec<Hook>> {
        let registry = match self.hooks {
            Some(registry) => registry,
            None => return Ok(Vec::new()),
        };
        let context = ConditionContext {
            annotations,
            argv0,
            has_bind_mounts,
        };
        registry
            .for_stage(Stage::StartContainer)
            .filter(|hook| all_match(&hook.conditions, &context))
            .map(|hook| hook.to_oci_hook())
            .collect()
    }

    fn init_mount(&self) -> Result<Mount> {
        Ok(MountBuilder::default()
            .destination(INIT_PATH_IN_CONTAINER)
            .typ("bind")
            .source(self.config.init_path.clone())
            .options(vec![
                "bind".to_string(),
                "ro".to_string(),
                "nosuid".to_string(),
                "private".to_string(),
            ])
            .build()?)
    }

    fn seccomp(&self, profile: &Path) -> Result<LinuxSeccomp> {
        let reader = utils::open(profile)?;
        serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse seccomp profile {:?}", profile))
    }

    /// Resolves every request and renders the OCI configuration. Nothing is
    /// written to disk, see [`Bundle::write`].
    pub fn build(&self, container_id: &str) -> Result<Bundle> {
        self.request.validate()?;

        let env = self.environment()?;
        let mounts = self.mounts()?;
        let devices = self.devices()?;
        let annotations = self.annotations()?;
        let mut args = resolve_command(self.request, self.image)?;
        if self.request.init {
            args = [INIT_PATH_IN_CONTAINER.to_string(), "--".to_string()]
                .into_iter()
                .chain(args)
                .collect();
        }
        let cwd = resolve_workdir(self.request, self.image);
        let has_bind_mounts = !mounts.is_empty();

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => UserIdentity::current()?,
        };
        let user = UserBuilder::default()
            .uid(identity.uid)
            .gid(identity.gid)
            .additional_gids(identity.additional_gids)
            .build()?;
        let capabilities = LinuxCapabilitiesBuilder::default()
            .bounding(HashSet::new())
            .effective(HashSet::new())
            .inheritable(HashSet::new())
            .permitted(HashSet::new())
            .ambient(HashSet::new())
            .build()?;
        let process = ProcessBuilder::default()
            .terminal(false)
            .user(user)
            .args(args.clone())
            .env(environment::to_list(&env))
            .cwd(cwd)
            .capabilities(capabilities)
            .rlimits(Vec::new())
            .no_new_privileges(true)
            .build()?;

        let root = RootBuilder::default()
            .path(self.config.rootfs_folder.clone())
            .readonly(false)
            .build()?;

        let mut oci_mounts = oci::default_mounts()?;
        if self.request.init {
            oci_mounts.push(self.init_mount()?);
        }
        for entry in &mounts {
            oci_mounts.push(oci::bind_mount(entry)?);
        }
        for device in &devices {
            oci_mounts.push(oci::device_mount(device)?);
        }

        let mut device_rules = vec![oci::deny_all_devices()?];
        for device in &devices {
            device_rules.push(oci::device_rule(device)?);
        }

        let mut namespaces = vec![LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Mount)
            .build()?];
        if self.request.pid_mode == PidMode::Private {
            namespaces.push(
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Pid)
                    .build()?,
            );
        }

        let mut linux = LinuxBuilder::default()
            .namespaces(namespaces)
            .rootfs_propagation("slave")
            .masked_paths(oci::MASKED_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
            .readonly_paths(oci::READONLY_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
            .cgroups_path(utils::get_cgroup_path(container_id))
            .resources(LinuxResourcesBuilder::default().devices(device_rules).build()?);
        if let Some(profile) = &self.config.seccomp_profile {
            linux = linux.seccomp(self.seccomp(profile)?);
        }

        let argv0 = args.first().map(String::as_str);
        let start_container = self.start_container_hooks(&annotations, argv0, has_bind_mounts)?;

        let mut spec = SpecBuilder::default()
            .version("1.0.0")
            .process(process)
            .root(root)
            .mounts(oci_mounts)
            .linux(linux.build()?)
            .annotations(annotations.into_iter().collect::<HashMap<_, _>>())
            .build()?;
        spec.set_hostname(None);
        if !start_container.is_empty() {
            spec.set_hooks(Some(
                HooksBuilder::default()
                    .start_container(start_container)
                    .build()?,
            ));
        }

        let dir = self.config.oci_bundle_dir.clone();
        log::info!("prepared OCI bundle for container {} in {:?}", container_id, dir);
        Ok(Bundle::new(dir, container_id, spec, has_bind_mounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::{SiteDevice, SiteMount};
    use crate::hooks::HookDescriptor;
    use crate::image::ImageReference;

    fn identity() -> UserIdentity {
        UserIdentity {
            uid: 1000,
            gid: 1000,
            additional_gids: vec![1000, 27],
        }
    }

    fn request() -> ContainerRequest {
        let mut request = ContainerRequest::new(ImageReference::parse("alpine").unwrap());
        request.command = vec!["cat".to_string(), "/etc/os-release".to_string()];
        request
    }

    fn image() -> ImageMetadata {
        ImageMetadata {
            cmd: Some(vec!["/bin/sh".to_string()]),
            entry: None,
            workdir: Some("/work".to_string()),
            env: vec!["IMAGE_ENV_VARIABLE=image_env_variable_value".to_string()],
            labels: BTreeMap::new(),
        }
    }

    fn build(
        config: &Configuration,
        request: &ContainerRequest,
        image: &ImageMetadata,
    ) -> Result<Bundle> {
        BundleBuilder::new(config, request, image)
            .with_host_env(Environment::new())
            .with_whitelist(HostWhitelist::allow_all())
            .with_identity(identity())
            .with_log_level(2)
            .build("sarus-container-test")
    }

    #[test]
    fn test_resolve_command() -> Result<()> {
        let mut request = request();
        let mut image = image();
        image.entry = Some(vec!["/entry.sh".to_string()]);
        assert_eq!(
            resolve_command(&request, &image)?,
            vec!["/entry.sh", "cat", "/etc/os-release"]
        );

        request.command.clear();
        assert_eq!(resolve_command(&request, &image)?, vec!["/entry.sh", "/bin/sh"]);

        request.entrypoint = Some(vec!["/other.sh".to_string()]);
        assert_eq!(resolve_command(&request, &image)?, vec!["/other.sh"]);

        request.entrypoint = Some(Vec::new());
        let err = resolve_command(&request, &image).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Failed to determine the command to execute in the container."));
        Ok(())
    }

    #[test]
    fn test_resolve_workdir() {
        let mut request = request();
        let mut image = image();
        assert_eq!(resolve_workdir(&request, &image), PathBuf::from("/work"));
        request.workdir = Some(PathBuf::from("/scratch"));
        assert_eq!(resolve_workdir(&request, &image), PathBuf::from("/scratch"));
        request.workdir = None;
        image.workdir = None;
        assert_eq!(resolve_workdir(&request, &image), PathBuf::from("/"));
    }

    #[test]
    fn test_parse_annotations() -> Result<()> {
        let annotations = parse_annotations(&[
            "com.example.key=value=with=equals".to_string(),
            "com.example.empty".to_string(),
        ])?;
        assert_eq!(
            annotations.get("com.example.key").map(String::as_str),
            Some("value=with=equals")
        );
        assert_eq!(annotations.get("com.example.empty").map(String::as_str), Some(""));

        let err = parse_annotations(&["=value".to_string()]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to parse annotation requested from CLI '=value': Failed to parse key-value pair '=value': key is empty"
        );
        Ok(())
    }

    #[test]
    fn test_build_bundle() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = sample_config(tmp.path());
        config.environment.prepend.insert(
            "IMAGE_ENV_VARIABLE".to_string(),
            "config_prepend_value0".to_string(),
        );
        config.environment.append.insert(
            "IMAGE_ENV_VARIABLE".to_string(),
            "config_append_value0".to_string(),
        );
        let image = image();
        let mut request = request();
        request.env = vec!["CLI_VAR=cli".to_string()];
        request.mpi = true;
        request.annotations = vec!["com.example.note=hello".to_string()];

        let bundle = build(&config, &request, &image)?;
        let json = serde_json::to_value(bundle.spec())?;

        assert_eq!(json["ociVersion"], "1.0.0");
        assert!(json.get("hostname").is_none());
        assert_eq!(json["root"]["path"], "rootfs");
        assert_eq!(json["process"]["user"]["uid"], 1000);
        assert_eq!(json["process"]["user"]["additionalGids"][1], 27);
        assert_eq!(json["process"]["cwd"], "/work");
        assert_eq!(json["process"]["noNewPrivileges"], true);
        assert_eq!(json["process"]["args"][0], "cat");
        let env: Vec<&str> = json["process"]["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(env.contains(
            &"IMAGE_ENV_VARIABLE=config_prepend_value0:image_env_variable_value:config_append_value0"
        ));
        assert!(env.contains(&"CLI_VAR=cli"));
        assert!(env.contains(&"SARUS_MPI_HOOK=1"));

        assert_eq!(json["linux"]["rootfsPropagation"], "slave");
        assert_eq!(json["linux"]["cgroupsPath"], "/sarus-container-test");
        assert_eq!(json["linux"]["namespaces"].as_array().unwrap().len(), 2);
        assert_eq!(json["linux"]["maskedPaths"][0], "/proc/kcore");

        let annotations = bundle.annotations();
        assert_eq!(annotations.get(ANNOTATION_LOGGING_LEVEL).map(String::as_str), Some("2"));
        assert_eq!(annotations.get(ANNOTATION_MPI_ENABLED).map(String::as_str), Some("true"));
        assert_eq!(annotations.get("com.example.note").map(String::as_str), Some("hello"));
        assert!(!annotations.contains_key(ANNOTATION_SSH_ENABLED));
        assert_eq!(bundle.argv0(), Some("cat"));
        assert!(!bundle.has_bind_mounts());
        Ok(())
    }

    #[test]
    fn test_mpi_type_from_configuration() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = sample_config(tmp.path());
        config.default_mpi_type = Some("mpich".to_string());
        let image = image();
        let mut request = request();
        request.mpi = true;
        let bundle = build(&config, &request, &image)?;
        assert_eq!(
            bundle.annotations().get(ANNOTATION_MPI_TYPE).map(String::as_str),
            Some("mpich")
        );

        request.mpi_type = Some("openmpi".to_string());
        let bundle = build(&config, &request, &image)?;
        assert_eq!(
            bundle.annotations().get(ANNOTATION_MPI_TYPE).map(String::as_str),
            Some("openmpi")
        );
        Ok(())
    }

    #[test]
    fn test_init_and_host_pid_namespace() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = sample_config(tmp.path());
        let image = image();
        let mut request = request();
        request.init = true;
        request.pid_mode = PidMode::Host;

        let bundle = build(&config, &request, &image)?;
        let json = serde_json::to_value(bundle.spec())?;
        assert_eq!(json["process"]["args"][0], "/dev/init");
        assert_eq!(json["process"]["args"][1], "--");
        assert_eq!(json["process"]["args"][2], "cat");
        let namespaces = json["linux"]["namespaces"].as_array().unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0]["type"], "mount");
        assert!(json["mounts"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| {
                m["destination"] == "/dev/init" && m["source"] == "/usr/bin/tini-static-amd64"
            }));
        Ok(())
    }

    #[test]
    fn test_site_and_cli_mounts_and_devices() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = sample_config(tmp.path());
        config.site_mounts = vec![SiteMount {
            typ: "bind".to_string(),
            source: PathBuf::from("/opt/site"),
            destination: PathBuf::from("/site"),
            flags: BTreeMap::new(),
        }];
        config.site_devices = vec![SiteDevice {
            source: PathBuf::from("/dev/null"),
            destination: None,
            access: Some("r".to_string()),
        }];
        let image = image();
        let mut request = request();
        request.mounts = vec![
            "type=bind,source=/tmp,destination=/site".to_string(),
            "type=bind,source=/tmp,destination=/scratch".to_string(),
        ];
        request.devices = vec!["/dev/null:rwm".to_string(), "/dev/zero:rw".to_string()];

        let bundle = build(&config, &request, &image)?;
        assert!(bundle.has_bind_mounts());
        let entries = bundle.entries();
        assert!(entries.mounts.contains(&"/opt/site -> /site".to_string()));
        assert!(!entries.mounts.contains(&"/tmp -> /site".to_string()));
        assert!(entries.mounts.contains(&"/tmp -> /scratch".to_string()));
        assert!(entries.mounts.contains(&"/dev/zero -> /dev/zero".to_string()));
        assert_eq!(
            entries.devices,
            vec![
                "deny a *:* rwm".to_string(),
                "allow c 1:3 r".to_string(),
                "allow c 1:5 rw".to_string()
            ]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_request_aborts_build() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = sample_config(tmp.path());
        let image = image();

        let mut request = request();
        request.devices = vec!["/dev/fuse:rwmm".to_string()];
        let err = build(&config, &request, &image).unwrap_err().to_string();
        assert!(
            err.contains("Input string for device access 'rwmm' is longer than 3 characters"),
            "{}",
            err
        );

        let mut request = self::request();
        request.devices = vec!["/home".to_string()];
        let err = build(&config, &request, &image).unwrap_err().to_string();
        assert!(err.contains("Source path \"/home\" is not a device file"), "{}", err);

        let mut request = self::request();
        request.env = vec!["=value".to_string()];
        assert!(build(&config, &request, &image).is_err());
        assert!(!config.oci_bundle_dir.join(oci::CONFIG_FILE_NAME).exists());
        Ok(())
    }

    #[test]
    fn test_start_container_hooks_are_embedded() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = sample_config(tmp.path());
        let image = image();
        let request = request();
        let always = HookDescriptor::from_json(
            Path::new("/hooks.d/01-inside.json"),
            r#"{"version": "1.0.0", "hook": {"path": "/bin/true"}, "when": {"always": true}, "stages": ["startContainer"]}"#,
        )?;
        let gated = HookDescriptor::from_json(
            Path::new("/hooks.d/02-gated.json"),
            r#"{"version": "1.0.0", "hook": {"path": "/bin/false"}, "when": {"annotations": {"^com.hooks.ssh.enabled$": "^true$"}}, "stages": ["startContainer"]}"#,
        )?;
        let prestart = HookDescriptor::from_json(
            Path::new("/hooks.d/03-prestart.json"),
            r#"{"version": "1.0.0", "hook": {"path": "/bin/true"}, "when": {"always": true}, "stages": ["prestart"]}"#,
        )?;
        let registry = HookRegistry::from_descriptors(vec![always, gated, prestart]);

        let bundle = BundleBuilder::new(&config, &request, &image)
            .with_host_env(Environment::new())
            .with_whitelist(HostWhitelist::allow_all())
            .with_identity(identity())
            .with_hooks(&registry)
            .build("sarus-container-test")?;
        let json = serde_json::to_value(bundle.spec())?;
        let hooks = json["hooks"]["startContainer"].as_array().unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0]["path"], "/bin/true");
        assert!(json["hooks"].get("prestart").is_none());
        Ok(())
    }
}
