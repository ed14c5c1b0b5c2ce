use anyhow::Result;

use crate::models::{
    ContainerId, ContainerName, EnvironmentId, ImageBuildSpec, ImageId, ImageName,
};

/// Raw build output, handed out chunk by chunk as the engine produces it.
pub type BuildOutput = Box<dyn Iterator<Item = Result<Vec<u8>>>>;

/// The engine operations the tool needs. The backend is constructed once
/// per invocation and injected wherever a command needs it.
pub trait ContainerBackend {
    /// An absent image is an ordinary answer here, not an error.
    fn image_exists(&mut self, name: &ImageName) -> Result<bool>;

    /// Kicks off an image build and returns its progress stream without
    /// draining it.
    fn build_image(&mut self, spec: ImageBuildSpec) -> Result<BuildOutput>;

    fn container_exists(&mut self, name: &ContainerName) -> Result<bool>;

    /// Snapshots a container into an image with the given tag.
    fn commit_container(&mut self, name: &ContainerName, tag: &ImageName) -> Result<ImageId>;

    /// Removes stopped containers carrying this owner label, never anything
    /// else. Returns the ids of whatever was removed.
    fn prune_containers(&mut self, owner: &EnvironmentId) -> Result<Vec<ContainerId>>;

    /// Returns false when there is no such image.
    fn remove_image(&mut self, name: &ImageName) -> Result<bool>;
}
