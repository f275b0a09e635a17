//! Utility functionality

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::unistd::{Uid, User};

/// Splits `KEY=VALUE` at the first `=`. A bare `KEY` yields no value,
/// which callers interpret as "remove this key".
pub fn parse_key_value(pair: &str) -> Result<(String, Option<String>)> {
    let (key, value) = match pair.split_once('=') {
        Some((key, value)) => (key, Some(value.to_string())),
        None => (pair, None),
    };
    if key.is_empty() {
        bail!("Failed to parse key-value pair '{}': key is empty", pair);
    }
    Ok((key.to_string(), value))
}

pub fn parse_env(envs: &[String]) -> HashMap<String, String> {
    envs.iter()
        .filter_map(|e| {
            let mut split = e.split('=');

            if let Some(key) = split.next() {
                let value: String = split.collect::<Vec<&str>>().join("=");
                Some((String::from(key), value))
            } else {
                None
            }
        })
        .collect()
}

/// Generates a container name that is unique enough to not collide
/// with other containers started on the same node.
pub fn random_container_name() -> String {
    format!("sarus-container-{:016x}", fastrand::u64(..))
}

/// Cgroup path of a container, relative to each hierarchy root.
pub fn get_cgroup_path(container_id: &str) -> PathBuf {
    PathBuf::from(format!("/{}", container_id))
}

pub fn current_username() -> Result<String> {
    let uid = Uid::current();
    let user = User::from_uid(uid)
        .with_context(|| format!("failed to look up user {}", uid))?
        .with_context(|| format!("no passwd entry for uid {}", uid))?;
    Ok(user.name)
}

pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, contents).with_context(|| format!("failed to write to {:?}", path))?;
    Ok(())
}

pub fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).with_context(|| format!("failed to create directory {:?}", path))
}

pub fn open<P: AsRef<Path>>(path: P) -> Result<File> {
    let path = path.as_ref();
    File::open(path).with_context(|| format!("failed to open {:?}", path))
}

pub fn copy_file<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }
    fs::copy(from, to).with_context(|| format!("failed to copy {:?} to {:?}", from, to))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_cgroup_path() {
        assert_eq!(
            get_cgroup_path("sarus-container-abc"),
            PathBuf::from("/sarus-container-abc")
        );
    }

    #[test]
    fn test_parse_key_value() -> Result<()> {
        assert_eq!(
            parse_key_value("KEY=VALUE")?,
            ("KEY".to_string(), Some("VALUE".to_string()))
        );
        assert_eq!(
            parse_key_value("KEY=a=b")?,
            ("KEY".to_string(), Some("a=b".to_string()))
        );
        assert_eq!(
            parse_key_value("KEY=")?,
            ("KEY".to_string(), Some(String::new()))
        );
        assert_eq!(parse_key_value("KEY")?, ("KEY".to_string(), None));
        Ok(())
    }

    #[test]
    fn test_parse_key_value_empty_key() {
        let err = parse_key_value("=VALUE").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to parse key-value pair '=VALUE': key is empty"
        );
    }

    #[test]
    fn test_parse_env() -> Result<()> {
        let key = "key".to_string();
        let value = "value".to_string();
        let env_input = vec![format!("{}={}", key, value)];
        let env_output = parse_env(&env_input);
        assert_eq!(
            env_output.len(),
            1,
            "There should be exactly one entry inside"
        );
        assert_eq!(env_output.get_key_value(&key), Some((&key, &value)));

        Ok(())
    }

    #[test]
    fn test_random_container_name() {
        let a = random_container_name();
        let b = random_container_name();
        assert!(a.starts_with("sarus-container-"));
        assert_eq!(a.len(), "sarus-container-".len() + 16);
        assert_ne!(a, b);
    }
}
