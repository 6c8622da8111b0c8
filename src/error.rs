use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Service already registered: {0}")]
    #[diagnostic(
        code(overseer::service::exists),
        help("Service names must be unique within a service set")
    )]
    ServiceExists(String),

    #[error("Service not found: {0}")]
    #[diagnostic(code(overseer::service::not_found))]
    ServiceNotFound(String),

    #[error("Service '{0}' has no command")]
    #[diagnostic(
        code(overseer::service::empty_command),
        help("Process and scripted services need a non-empty argv")
    )]
    EmptyCommand(String),

    #[error("Dependency target is not registered")]
    #[diagnostic(
        code(overseer::dependency::unknown),
        help("Register the dependency before the services that depend on it")
    )]
    UnknownDependency,

    #[error("Service '{0}' is not stopped")]
    #[diagnostic(
        code(overseer::service::not_stopped),
        help("A service may only be removed once it has fully stopped")
    )]
    NotStopped(String),

    #[error("Service '{0}' still has dependents")]
    #[diagnostic(
        code(overseer::service::has_dependents),
        help("Remove the dependent services first")
    )]
    HasDependents(String),

    #[error("Failed to load service '{0}': {1}")]
    #[diagnostic(code(overseer::service::load_failed))]
    Load(String, #[source] LoadError),
}

/// Errors a [`Host`](crate::Host) may report when asked to load a service
/// definition for a chain target.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("no service definition found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
