//! Service management for usbscale-service.
//!
//! Installs the binary with the platform's native service manager
//! (systemd, launchd, Windows services) through the service-manager crate.
//! A user-level install doubles as "start at login".

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use service_manager::{
    RestartPolicy, ServiceInstallCtx, ServiceLabel, ServiceLevel, ServiceManager, ServiceStartCtx,
    ServiceStatusCtx, ServiceStopCtx, ServiceUninstallCtx,
};
use thiserror::Error;
use tracing::{debug, info};

/// Service label for usbscale
const SERVICE_LABEL: &str = "io.github.usbscale";

/// Errors that can occur during service management.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No service manager available on this platform")]
    NoServiceManager,

    #[error("Service manager error: {0}")]
    Manager(String),

    #[error("Could not find usbscale-service executable")]
    ExecutableNotFound,

    #[error("User-level services not supported on this platform")]
    UserLevelNotSupported,

    #[error("Invalid service label '{0}'")]
    InvalidLabel(String),
}

/// Service management level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Level {
    /// System-level service (requires root/admin)
    System,
    /// User-level service, started at login
    #[default]
    User,
}

impl Level {
    /// Map the CLI `--system` flag to a level.
    pub fn from_system_flag(system: bool) -> Self {
        if system { Level::System } else { Level::User }
    }
}

fn get_manager(level: Level) -> Result<Box<dyn ServiceManager>, ServiceError> {
    let mut manager = <dyn ServiceManager>::native().map_err(|_| ServiceError::NoServiceManager)?;

    let service_level = match level {
        Level::System => ServiceLevel::System,
        Level::User => ServiceLevel::User,
    };

    manager
        .set_level(service_level)
        .map_err(|_| ServiceError::UserLevelNotSupported)?;

    Ok(manager)
}

fn get_executable_path() -> Result<PathBuf, ServiceError> {
    env::current_exe().map_err(|_| ServiceError::ExecutableNotFound)
}

fn get_label() -> Result<ServiceLabel, ServiceError> {
    SERVICE_LABEL
        .parse()
        .map_err(|_| ServiceError::InvalidLabel(SERVICE_LABEL.to_string()))
}

/// Arguments the installed service is launched with.
fn service_args() -> Vec<OsString> {
    vec![OsString::from("run")]
}

/// Install usbscale-service with the native service manager.
pub fn install(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    let program = get_executable_path()?;
    let label = get_label()?;

    manager
        .install(ServiceInstallCtx {
            label,
            program,
            args: service_args(),
            contents: None,
            username: None,
            working_directory: None,
            environment: None,
            autostart: true,
            restart_policy: RestartPolicy::OnFailure {
                delay_secs: Some(5),
            },
        })
        .map_err(|e| ServiceError::Manager(e.to_string()))?;

    Ok(())
}

/// Uninstall the usbscale-service service.
pub fn uninstall(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    let label = get_label()?;

    manager
        .uninstall(ServiceUninstallCtx { label })
        .map_err(|e| ServiceError::Manager(e.to_string()))?;

    Ok(())
}

/// Start the installed service.
pub fn start(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    let label = get_label()?;

    manager
        .start(ServiceStartCtx { label })
        .map_err(|e| ServiceError::Manager(e.to_string()))?;

    Ok(())
}

/// Stop the installed service.
pub fn stop(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    let label = get_label()?;

    manager
        .stop(ServiceStopCtx { label })
        .map_err(|e| ServiceError::Manager(e.to_string()))?;

    Ok(())
}

/// Get the status of the installed service.
pub fn status(level: Level) -> Result<ServiceStatus, ServiceError> {
    let manager = get_manager(level)?;
    let label = get_label()?;

    let status = manager
        .status(ServiceStatusCtx { label })
        .map_err(|e| ServiceError::Manager(e.to_string()))?;

    Ok(match status {
        service_manager::ServiceStatus::NotInstalled => ServiceStatus::NotInstalled,
        service_manager::ServiceStatus::Running => ServiceStatus::Running,
        service_manager::ServiceStatus::Stopped(_) => ServiceStatus::Stopped,
    })
}

/// What to do to bring the login registration to `enabled`.
fn autostart_change(enabled: bool, current: ServiceStatus) -> Option<AutostartChange> {
    match (enabled, current.is_installed()) {
        (true, false) => Some(AutostartChange::Install),
        (false, true) => Some(AutostartChange::Uninstall),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutostartChange {
    Install,
    Uninstall,
}

/// Bring the login autostart registration in line with the configuration.
///
/// Only acts when the user-level registration differs from `enabled`.
pub fn sync_autostart(enabled: bool) -> Result<(), ServiceError> {
    let current = status(Level::User)?;
    match autostart_change(enabled, current) {
        Some(AutostartChange::Install) => {
            install(Level::User)?;
            info!("Registered usbscale-service to start at login");
        }
        Some(AutostartChange::Uninstall) => {
            uninstall(Level::User)?;
            info!("Removed usbscale-service from login autostart");
        }
        None => debug!("Login autostart already {}", current),
    }
    Ok(())
}

/// Service status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    NotInstalled,
    Running,
    Stopped,
}

impl ServiceStatus {
    /// Whether a registration exists.
    pub fn is_installed(self) -> bool {
        !matches!(self, ServiceStatus::NotInstalled)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::NotInstalled => write!(f, "not installed"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}
