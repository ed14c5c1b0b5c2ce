use anyhow::Result;
use sha1::{Digest, Sha1};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::models::{ContainerName, EnvironmentId};

/// Presence of this file marks a directory as a managed environment.
pub const SENTINEL_FILE: &str = ".denv";

/// The working directory an environment is tied to. Identifiers derived
/// from it are pure functions of the path string, so the same directory
/// always maps to the same image and container.
pub struct Environment {
    path: PathBuf,
    dir_name: String,
}

impl Environment {
    pub fn current() -> Result<Environment> {
        Ok(Environment::from_path(env::current_dir()?))
    }

    pub fn from_path<P: Into<PathBuf>>(path: P) -> Environment {
        let path = path.into();
        let dir_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(String::new);

        Environment { path, dir_name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// `{basename}_{hex(sha1(path))[..8]}`, plus a `_tmp` suffix for the
    /// transient variant used while a container is recreated.
    ///
    /// The basename follows `Path::file_name`, which ignores a trailing
    /// separator; the hash does not, so `/foo` and `/foo/` share a basename
    /// but never an identifier. The root directory has no basename and its
    /// identifier is all hash.
    pub fn identifier(&self, temporary: bool) -> EnvironmentId {
        let mut hasher = Sha1::new();
        hasher.update(self.path.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());

        let mut identifier = format!("{}_{}", self.dir_name, &digest[..8]);
        if temporary {
            identifier.push_str("_tmp");
        }

        EnvironmentId(identifier)
    }

    pub fn container_name(&self) -> ContainerName {
        ContainerName(format!("container_{}", self.identifier(false).0))
    }

    pub fn is_initialized(&self) -> bool {
        self.path.join(SENTINEL_FILE).exists()
    }

    /// Drops the sentinel file. The file's content is irrelevant, only its
    /// presence counts.
    pub fn mark_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            fs::write(self.path.join(SENTINEL_FILE), b"")?;
        }

        Ok(())
    }
}
