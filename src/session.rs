use anyhow::{Context, Result};
use log::debug;
use std::process::Command;

use crate::models::{ContainerName, SessionSpec};

/// Runs a fresh interactive container, blocking until the shell exits.
///
/// The session needs the caller's terminal, so it goes through the `docker`
/// binary rather than the HTTP API. The child inherits stdio; whatever the
/// engine prints lands directly in front of the user.
pub fn start_new_shell(spec: &SessionSpec) -> Result<i32> {
    run_docker(new_shell_args(spec))
}

/// Reattaches to the environment's existing container.
pub fn resume_shell(name: &ContainerName) -> Result<i32> {
    run_docker(resume_args(name))
}

fn new_shell_args(spec: &SessionSpec) -> Vec<String> {
    let mut args = vec!["run".to_owned(), "-i".to_owned(), "-t".to_owned()];

    for volume in spec.volumes.iter() {
        args.push("-v".to_owned());
        args.push(volume.to_argument());
    }

    args.push("--label".to_owned());
    args.push(format!("owner={}", spec.owner.0));
    args.push("--name".to_owned());
    args.push(spec.container_name.0.clone());

    if let Some(env_file) = spec.env_file.as_ref() {
        args.push("--env-file".to_owned());
        args.push(env_file.to_string_lossy().into_owned());
    }

    args.extend(spec.extra_options.iter().cloned());

    args.push(spec.image.0.clone());
    args.push(spec.entrypoint.clone());

    args
}

fn resume_args(name: &ContainerName) -> Vec<String> {
    vec![
        "start".to_owned(),
        "-a".to_owned(),
        "-i".to_owned(),
        name.0.clone(),
    ]
}

fn run_docker(args: Vec<String>) -> Result<i32> {
    debug!("docker {:?}", args);

    let status = Command::new("docker")
        .args(&args)
        .status()
        .context("failed to invoke `docker`, is it installed and on PATH?")?;

    let code = status.code().unwrap_or(if status.success() { 0 } else { 1 });
    Ok(code)
}
