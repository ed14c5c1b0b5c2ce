mod docker;
mod transport;

pub use docker::DockerBackend;
