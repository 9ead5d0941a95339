// Consistent exit codes for the statesync CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/configuration error
//   10 = server not reachable (retry budget spent)
//   13 = timed out waiting for project state

use std::process;

use thiserror::Error;

use statesync_client::channel::ConnectionState;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Unreachable = 10,
    Timeout = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(cli_err) = cause.downcast_ref::<CliError>() {
                return match cli_err {
                    CliError::Usage(_) => Self::Usage,
                    CliError::NotReady { .. } => Self::Timeout,
                    CliError::CannotConnect { .. } => Self::Unreachable,
                };
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused => Self::Unreachable,
                    std::io::ErrorKind::TimedOut => Self::Timeout,
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("server_url") || msg.contains("invalid") {
            return Self::Usage;
        }
        if msg.contains("failed to open push") || msg.contains("failed to request") {
            return Self::Unreachable;
        }

        Self::Error
    }

    /// Short machine-readable code for JSON error output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "OK",
            Self::Error => "ERROR",
            Self::Usage => "USAGE",
            Self::Unreachable => "SERVER_UNREACHABLE",
            Self::Timeout => "NOT_READY",
        }
    }

    /// Exit the process with this code.
    pub fn exit(self) -> ! {
        process::exit(self.code())
    }
}

/// Typed CLI failures that can be embedded in an `anyhow::Error` chain.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("project state not ready after {secs}s (connection: {connection:?})")]
    NotReady { secs: u64, connection: ConnectionState },
    #[error("cannot connect to project `{project}`: push channel gave up after {attempts} attempts")]
    CannotConnect { project: String, attempts: u32 },
}
