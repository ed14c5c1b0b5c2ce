use anyhow::{Context, Result};
use crossterm::{
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::{info, LevelFilter};
use std::{
    env,
    io::{stderr, Write},
    path::PathBuf,
    process::exit,
};
use structopt::StructOpt;

use backends::DockerBackend;
use controller::{BuildRequest, Controller, ShellRequest};
use identity::Environment;
use models::{ImageSource, Verbosity, VolumeMount};

mod backends;
mod controller;
mod identity;
mod models;
mod progress;
mod services;
mod session;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "denv",
    about = "Disposable per-directory development shells backed by docker."
)]
struct Opt {
    #[structopt(long, global = true)]
    /// Log debug details to stderr (also via DENV_DEBUG).
    debug: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Starts or resumes the interactive shell for this directory.
    Shell {
        #[structopt(flatten)]
        image: ImageOpts,

        #[structopt(flatten)]
        output: OutputOpts,

        #[structopt(short, long)]
        /// Rebuild the image without the layer cache.
        force: bool,

        #[structopt(long = "env_file", parse(from_os_str))]
        /// Env file handed to the engine when the container is created.
        env_file: Option<PathBuf>,

        #[structopt(long)]
        /// Extra HOST:CONTAINER mounts for new containers.
        volume: Vec<VolumeMount>,

        #[structopt(long = "docker_opts", allow_hyphen_values = true)]
        /// Extra options passed through to `docker run` verbatim.
        docker_opts: Option<String>,

        #[structopt(long)]
        /// Commit the current state and recreate the container.
        new: bool,
    },
    /// Builds the image for this directory.
    Build {
        #[structopt(flatten)]
        image: ImageOpts,

        #[structopt(flatten)]
        output: OutputOpts,

        #[structopt(short, long)]
        /// Rebuild the image without the layer cache.
        force: bool,
    },
    /// Marks this directory as a managed environment and opens a fresh shell.
    Init,
    /// Snapshots the container into this directory's image.
    Commit,
    /// Removes this environment's containers.
    Clean {
        #[structopt(long)]
        /// Also delete the image.
        all: bool,
    },
    /// Uploads the environment image to a registry.
    Push,
    /// Plumbing helpers for scripts.
    Internal(InternalCommand),
}

#[derive(Debug, StructOpt)]
enum InternalCommand {
    #[structopt(name = "image_name")]
    /// Prints the identifier derived from the current directory.
    ImageName,
}

#[derive(Debug, StructOpt)]
struct ImageOpts {
    #[structopt(long, parse(from_os_str))]
    /// Dockerfile to base the environment on.
    dockerfile: Option<PathBuf>,

    #[structopt(long = "base_image")]
    /// Existing image to base the environment on.
    base_image: Option<String>,
}

impl ImageOpts {
    fn source(self) -> ImageSource {
        ImageSource::select(self.dockerfile, self.base_image)
    }
}

#[derive(Debug, StructOpt)]
struct OutputOpts {
    #[structopt(short, long)]
    /// Echo the build's stream output.
    verbose: bool,

    #[structopt(short, long, conflicts_with = "verbose")]
    /// Print the resulting image id only.
    quiet: bool,
}

impl OutputOpts {
    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }
}

fn main() {
    let opt = Opt::from_args();
    init_logger(opt.debug);

    if let Err(error) = run(opt.command) {
        let _ = report_error(&error);
        exit(1);
    }
}

fn report_error(error: &anyhow::Error) -> Result<()> {
    let mut stderr = stderr();
    stderr
        .queue(style::PrintStyledContent("ERROR: ".red().bold()))?
        .queue(style::Print(format!("{:#}\n", error)))?
        .flush()?;

    Ok(())
}

fn init_logger(debug: bool) {
    let debug = debug || env::var_os("DENV_DEBUG").is_some();

    if debug {
        pretty_env_logger::formatted_builder()
            .filter_level(LevelFilter::Debug)
            .init();
    } else {
        pretty_env_logger::init_custom_env("DENV_LOG");
    }
}

fn run(command: Command) -> Result<()> {
    let environment = Environment::current()?;

    match command {
        Command::Push => {
            println!("push is not implemented yet.");
            Ok(())
        }
        Command::Internal(InternalCommand::ImageName) => {
            println!("{}", environment.identifier(false).0);
            Ok(())
        }
        command => run_engine_command(environment, command),
    }
}

fn run_engine_command(environment: Environment, command: Command) -> Result<()> {
    let backend = DockerBackend::connect()?;
    info!("connected to the docker daemon");

    let mut controller = Controller::init(environment, backend);

    match command {
        Command::Shell {
            image,
            output,
            force,
            env_file,
            volume,
            docker_opts,
            new,
        } => {
            let request = ShellRequest {
                build: BuildRequest {
                    source: image.source(),
                    force,
                    verbosity: output.verbosity(),
                },
                volumes: volume,
                env_file,
                extra_options: split_docker_opts(docker_opts)?,
                recreate: new,
            };

            controller.shell(request)?;
        }
        Command::Build {
            image,
            output,
            force,
        } => {
            let request = BuildRequest {
                source: image.source(),
                force,
                verbosity: output.verbosity(),
            };

            controller.build(&request)?;
        }
        Command::Init => {
            controller.mark_initialized()?;

            let request = ShellRequest {
                build: BuildRequest {
                    source: ImageSource::Default,
                    force: false,
                    verbosity: Verbosity::Normal,
                },
                volumes: Vec::new(),
                env_file: None,
                extra_options: Vec::new(),
                recreate: true,
            };

            controller.shell(request)?;
        }
        Command::Commit => match controller.commit(false)? {
            Some(tag) => println!("Container committed as: {}", tag.0),
            None => println!("No container found for environment."),
        },
        Command::Clean { all } => {
            let outcome = controller.clean(all)?;

            if !outcome.removed_containers.is_empty() {
                let ids = outcome
                    .removed_containers
                    .iter()
                    .map(|id| id.0.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                println!("Deleted containers: {}", ids);
            }

            if let Some(image) = outcome.removed_image {
                println!("Deleted image {}", image.0);
            }
        }
        // Handled before the daemon connection.
        Command::Push | Command::Internal(_) => {}
    }

    Ok(())
}

fn split_docker_opts(docker_opts: Option<String>) -> Result<Vec<String>> {
    match docker_opts {
        Some(opts) => shell_words::split(&opts).context("failed to parse --docker_opts"),
        None => Ok(Vec::new()),
    }
}
