use anyhow::{Context, Result};
use log::{debug, info};
use std::{fs, io::stdout, path::PathBuf};
use tar::{Builder as TarBuilder, Header};

use crate::{
    identity::Environment,
    models::{
        CleanOutcome, ImageBuildSpec, ImageName, ImageSource, SessionSpec, Verbosity, VolumeMount,
    },
    progress::{consume_build_output, ProgressPrinter},
    services::ContainerBackend,
    session,
};

const DEFAULT_BASE_IMAGE: &str = "centos:6";
const SHELL_ENTRYPOINT: &str = "/bin/bash";

/// Options shared by every command that may build the image.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub source: ImageSource,
    pub force: bool,
    pub verbosity: Verbosity,
}

/// Everything the shell command collects from the user.
#[derive(Clone, Debug)]
pub struct ShellRequest {
    pub build: BuildRequest,
    pub volumes: Vec<VolumeMount>,
    pub env_file: Option<PathBuf>,
    pub extra_options: Vec<String>,
    pub recreate: bool,
}

pub struct Controller {
    backend: Box<dyn ContainerBackend>,
    environment: Environment,
}

impl Controller {
    pub fn init<B>(environment: Environment, backend: B) -> Controller
    where
        B: 'static + ContainerBackend,
    {
        Controller {
            backend: Box::new(backend),
            environment,
        }
    }

    /// Ensures the image exists, then starts or resumes the interactive
    /// session. Returns the session's exit code.
    pub fn shell(&mut self, request: ShellRequest) -> Result<i32> {
        self.ensure_image(&request.build)?;

        if request.recreate {
            // Keep the old state reachable under the _tmp tag before the
            // container goes away.
            let saved = self.commit(true)?;
            debug!("saved previous state as {:?}", saved);

            let removed = self
                .backend
                .prune_containers(&self.environment.identifier(false))?;
            debug!("removed containers {:?}", removed);
        }

        let container_name = self.environment.container_name();
        let exit_code = if self.backend.container_exists(&container_name)? {
            println!("Container exists - resuming");
            session::resume_shell(&container_name)?
        } else {
            session::start_new_shell(&self.session_spec(request))?
        };
        debug!("session exited with code {}", exit_code);

        println!("Exited. (Run \"denv commit\" to save state)");

        Ok(exit_code)
    }

    /// Builds the image, printing interpreted progress as it arrives.
    pub fn build(&mut self, request: &BuildRequest) -> Result<()> {
        if request.force {
            println!("Forcing new image {}", self.environment.identifier(false).0);
        }

        self.refresh_image(request)
    }

    /// Drops the sentinel file that marks this directory as managed.
    pub fn mark_initialized(&mut self) -> Result<()> {
        self.environment.mark_initialized()?;
        info!("initialized environment at {:?}", self.environment.path());

        Ok(())
    }

    /// Snapshots the environment's container. None means there was nothing
    /// to commit, which is an ordinary outcome.
    pub fn commit(&mut self, temporary: bool) -> Result<Option<ImageName>> {
        let container_name = self.environment.container_name();

        if !self.backend.container_exists(&container_name)? {
            return Ok(None);
        }

        let tag = ImageName(self.environment.identifier(temporary).0);
        let image_id = self.backend.commit_container(&container_name, &tag)?;
        debug!("committed {} as {} ({})", container_name.0, tag.0, image_id.0);

        Ok(Some(tag))
    }

    /// Removes this environment's containers, and with `all` its image too.
    pub fn clean(&mut self, all: bool) -> Result<CleanOutcome> {
        let identifier = self.environment.identifier(false);
        let removed_containers = self.backend.prune_containers(&identifier)?;

        let mut removed_image = None;
        if all {
            let image = ImageName(identifier.0.clone());
            if self.backend.remove_image(&image)? {
                removed_image = Some(image);
            }

            // A forced recreation can leave a safety snapshot behind.
            let temporary = ImageName(self.environment.identifier(true).0);
            self.backend.remove_image(&temporary)?;
        }

        Ok(CleanOutcome {
            removed_containers,
            removed_image,
        })
    }

    /// Builds transparently when the image is missing.
    fn ensure_image(&mut self, request: &BuildRequest) -> Result<()> {
        let image = ImageName(self.environment.identifier(false).0);

        if self.backend.image_exists(&image)? {
            debug!("image {} already exists", image.0);
            return Ok(());
        }

        self.refresh_image(request)
    }

    fn refresh_image(&mut self, request: &BuildRequest) -> Result<()> {
        let tag = ImageName(self.environment.identifier(false).0);
        let dockerfile = self.render_dockerfile(&request.source)?;
        debug!("dockerfile for {}:\n{}", tag.0, dockerfile);

        let spec = ImageBuildSpec {
            tag,
            context_tar: build_context(dockerfile.as_bytes())?,
            nocache: request.force,
        };

        let output = self.backend.build_image(spec)?;
        let mut printer = ProgressPrinter::new(stdout(), request.verbosity);
        consume_build_output(output, &mut printer)
    }

    /// The effective dockerfile: the user's file, or a FROM line for the
    /// chosen base image, always followed by the prompt and workdir suffix.
    fn render_dockerfile(&self, source: &ImageSource) -> Result<String> {
        let mut dockerfile = match source {
            ImageSource::Dockerfile(path) => fs::read_to_string(path)
                .with_context(|| format!("failed to read dockerfile {:?}", path))?,
            ImageSource::BaseImage(name) => format!("\nFROM {}\n", name),
            ImageSource::Default => format!("\nFROM {}\n", DEFAULT_BASE_IMAGE),
        };

        dockerfile.push_str(&format!(
            "\nENV PS1='[\\u@{} \\w]\\$ '\nWORKDIR /{}\n",
            self.environment.identifier(false).0,
            self.environment.dir_name(),
        ));

        Ok(dockerfile)
    }

    fn session_spec(&self, request: ShellRequest) -> SessionSpec {
        let identifier = self.environment.identifier(false);

        // The working directory is always mounted at /{basename}, ahead of
        // whatever the user asked for.
        let mut volumes = vec![VolumeMount {
            host: self.environment.path().to_string_lossy().into_owned(),
            container: format!("/{}", self.environment.dir_name()),
        }];
        volumes.extend(request.volumes);

        SessionSpec {
            image: ImageName(identifier.0.clone()),
            container_name: self.environment.container_name(),
            owner: identifier,
            volumes,
            env_file: request.env_file,
            extra_options: request.extra_options,
            entrypoint: SHELL_ENTRYPOINT.to_owned(),
        }
    }
}

/// A tar archive holding the synthesized dockerfile as its only entry.
fn build_context(dockerfile: &[u8]) -> Result<Vec<u8>> {
    let mut tar = TarBuilder::new(Vec::new());

    let mut header = Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, "Dockerfile", dockerfile)?;

    let context = tar.into_inner()?;
    Ok(context)
}
