use anyhow::{anyhow, Error};
use std::{path::PathBuf, str::FromStr};

/// Deterministic name of the environment tied to a working directory.
/// Doubles as the tag of the environment's image and as the value of the
/// `owner` label on its containers.
#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct EnvironmentId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

/// A `host:container` bind mount handed to the engine when a container is
/// created. Anything after the second colon (mount options such as `ro`)
/// stays attached to the container part.
#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: String,
    pub container: String,
}

impl VolumeMount {
    pub fn to_argument(&self) -> String {
        format!("{}:{}", self.host, self.container)
    }
}

impl FromStr for VolumeMount {
    type Err = Error;

    fn from_str(value: &str) -> Result<VolumeMount, Error> {
        let mut parts = value.splitn(2, ':');
        let host = parts.next().unwrap_or("");
        let container = parts.next().unwrap_or("");

        if host.is_empty() || container.is_empty() {
            return Err(anyhow!(
                "volume mounts must look like host_path:container_path, got {:?}",
                value
            ));
        }

        Ok(VolumeMount {
            host: host.to_owned(),
            container: container.to_owned(),
        })
    }
}

/// Where the environment image comes from. A user dockerfile wins over a
/// base image, which wins over the built-in default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    Dockerfile(PathBuf),
    BaseImage(String),
    Default,
}

impl ImageSource {
    pub fn select(dockerfile: Option<PathBuf>, base_image: Option<String>) -> ImageSource {
        match (dockerfile, base_image) {
            (Some(path), _) => ImageSource::Dockerfile(path),
            (None, Some(name)) => ImageSource::BaseImage(name),
            (None, None) => ImageSource::Default,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageBuildSpec {
    pub tag: ImageName,
    /// Tar archive holding the synthesized build context.
    pub context_tar: Vec<u8>,
    /// Disables the engine's layer cache.
    pub nocache: bool,
}

/// Everything needed to start a fresh interactive container.
#[derive(Clone, Debug)]
pub struct SessionSpec {
    pub image: ImageName,
    pub container_name: ContainerName,
    pub owner: EnvironmentId,
    pub volumes: Vec<VolumeMount>,
    pub env_file: Option<PathBuf>,
    pub extra_options: Vec<String>,
    pub entrypoint: String,
}

/// Gates how much of the build output reaches the user.
#[derive(Copy, Clone, Debug, PartialOrd, Ord, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

#[derive(Clone, Debug, Default)]
pub struct CleanOutcome {
    pub removed_containers: Vec<ContainerId>,
    pub removed_image: Option<ImageName>,
}
