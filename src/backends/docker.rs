use anyhow::{anyhow, Result};
use log::debug;
use serde::Deserialize;

use crate::{
    models::{ContainerId, ContainerName, EnvironmentId, ImageBuildSpec, ImageId, ImageName},
    services::{BuildOutput, ContainerBackend},
};

use super::transport::EngineTransport;

/// Talks to the docker daemon over its local HTTP API.
pub struct DockerBackend {
    transport: EngineTransport,
}

impl DockerBackend {
    /// Connects and pings the daemon once. An unreachable daemon is fatal
    /// here, it is never retried later.
    pub fn connect() -> Result<DockerBackend> {
        let transport = EngineTransport::from_env()?;

        let reply = transport.request("GET", "/_ping", &[], None)?;
        let status = reply.status;
        let body = reply.into_bytes()?;
        if status != 200 {
            return Err(anyhow!(
                "the docker daemon refused the ping: {}",
                daemon_message(status, &body)
            ));
        }

        Ok(DockerBackend { transport })
    }
}

impl ContainerBackend for DockerBackend {
    fn image_exists(&mut self, name: &ImageName) -> Result<bool> {
        let path = format!("/images/{}/json", urlencoding::encode(&name.0));
        let reply = self.transport.request("GET", &path, &[], None)?;

        match reply.status {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(anyhow!(
                "failed to inspect image {}: {}",
                name.0,
                daemon_message(status, &reply.into_bytes()?)
            )),
        }
    }

    fn build_image(&mut self, spec: ImageBuildSpec) -> Result<BuildOutput> {
        let path = format!(
            "/build?t={}&nocache={}",
            urlencoding::encode(&spec.tag.0),
            spec.nocache
        );
        debug!("building image {} ({} byte context)", spec.tag.0, spec.context_tar.len());

        let reply = self.transport.request(
            "POST",
            &path,
            &[("Content-Type", "application/x-tar")],
            Some(&spec.context_tar),
        )?;

        if reply.status != 200 {
            let status = reply.status;
            let body = reply.into_bytes()?;
            return Err(anyhow!(
                "the docker daemon rejected the build: {}",
                daemon_message(status, &body)
            ));
        }

        Ok(Box::new(reply.body))
    }

    fn container_exists(&mut self, name: &ContainerName) -> Result<bool> {
        let path = format!("/containers/{}/json", urlencoding::encode(&name.0));
        let reply = self.transport.request("GET", &path, &[], None)?;

        match reply.status {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(anyhow!(
                "failed to inspect container {}: {}",
                name.0,
                daemon_message(status, &reply.into_bytes()?)
            )),
        }
    }

    fn commit_container(&mut self, name: &ContainerName, tag: &ImageName) -> Result<ImageId> {
        let path = format!(
            "/commit?container={}&repo={}",
            urlencoding::encode(&name.0),
            urlencoding::encode(&tag.0)
        );
        let reply = self.transport.request("POST", &path, &[], None)?;

        let status = reply.status;
        let body = reply.into_bytes()?;
        if status != 201 {
            return Err(anyhow!(
                "failed to commit container {}: {}",
                name.0,
                daemon_message(status, &body)
            ));
        }

        let reply: CommitReply = serde_json::from_slice(&body)?;
        Ok(ImageId(reply.id))
    }

    fn prune_containers(&mut self, owner: &EnvironmentId) -> Result<Vec<ContainerId>> {
        let filters = serde_json::json!({ "label": [format!("owner={}", owner.0)] });
        let path = format!(
            "/containers/prune?filters={}",
            urlencoding::encode(&filters.to_string())
        );
        let reply = self.transport.request("POST", &path, &[], None)?;

        let status = reply.status;
        let body = reply.into_bytes()?;
        if status != 200 {
            return Err(anyhow!(
                "failed to prune containers: {}",
                daemon_message(status, &body)
            ));
        }

        let reply: PruneReply = serde_json::from_slice(&body)?;
        let containers = reply
            .containers_deleted
            .unwrap_or_else(Default::default)
            .into_iter()
            .map(ContainerId)
            .collect();

        Ok(containers)
    }

    fn remove_image(&mut self, name: &ImageName) -> Result<bool> {
        let path = format!(
            "/images/{}?force=true&noprune=true",
            urlencoding::encode(&name.0)
        );
        let reply = self.transport.request("DELETE", &path, &[], None)?;

        match reply.status {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(anyhow!(
                "failed to remove image {}: {}",
                name.0,
                daemon_message(status, &reply.into_bytes()?)
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommitReply {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PruneReply {
    containers_deleted: Option<Vec<String>>,
}

/// Error replies use lowercase field names, unlike the rest of the API.
#[derive(Debug, Deserialize)]
struct ErrorReply {
    message: String,
}

fn daemon_message(status: u16, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorReply>(body) {
        Ok(reply) => reply.message,
        Err(_) => format!("status {}", status),
    }
}
