//! Session configuration and interpreter validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SessionError;
use crate::local::{InterruptMode, KernelCommand, LaunchSpec};
use crate::output::EventCallback;

/// Environment variable naming the Python interpreter to launch.
pub const PYTHON_ENV: &str = "CELLRUN_PYTHON";

/// Environment variable holding the default cell timeout in milliseconds.
pub const TIMEOUT_ENV: &str = "CELLRUN_TIMEOUT_MS";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Runtime behavior of a session, independent of how its kernel was launched.
#[derive(Clone)]
pub struct SessionOptions {
    /// Default per-cell deadline; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Invoked for every event before it is handed to the caller.
    pub callback: Option<EventCallback>,
    /// Receive poll interval for both the listener and the consumer.
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            callback: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("timeout", &self.timeout)
            .field("callback", &self.callback.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Configuration for a session backed by a locally launched kernel.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Python interpreter with `ipykernel` installed. Defaults to `python3`
    /// on PATH.
    pub python: Option<PathBuf>,
    /// Launch an installed kernelspec by name instead of a Python interpreter.
    pub kernelspec: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub ready_timeout: Option<Duration>,
    pub interrupt_mode: Option<InterruptMode>,
    pub options: SessionOptions,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration seeded from `CELLRUN_PYTHON` and `CELLRUN_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(PYTHON_ENV) {
            if !path.is_empty() {
                config.python = Some(PathBuf::from(path));
            }
        }
        if let Ok(ms) = std::env::var(TIMEOUT_ENV) {
            match ms.parse::<u64>() {
                Ok(ms) => config.options.timeout = Some(Duration::from_millis(ms)),
                Err(_) => log::warn!("[session] Ignoring invalid {}={:?}", TIMEOUT_ENV, ms),
            }
        }
        config
    }

    pub fn python(mut self, path: impl Into<PathBuf>) -> Self {
        self.python = Some(path.into());
        self
    }

    pub fn kernelspec(mut self, name: impl Into<String>) -> Self {
        self.kernelspec = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn callback(mut self, callback: EventCallback) -> Self {
        self.options.callback = Some(callback);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn interrupt_mode(mut self, mode: InterruptMode) -> Self {
        self.interrupt_mode = Some(mode);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Validate the configuration and turn it into a kernel launch spec.
    pub fn launch_spec(&self) -> Result<LaunchSpec, SessionError> {
        let command = match (&self.kernelspec, &self.python) {
            (Some(name), _) => KernelCommand::Kernelspec(name.clone()),
            (None, Some(python)) => {
                validate_executable(python)?;
                KernelCommand::Python(python.clone())
            }
            (None, None) => KernelCommand::Python(PathBuf::from("python3")),
        };

        let mut spec = LaunchSpec::new(command);
        if let Some(dir) = &self.working_dir {
            spec.working_dir = Some(dir.clone());
        }
        if let Some(timeout) = self.ready_timeout {
            spec.ready_timeout = timeout;
        }
        if let Some(mode) = self.interrupt_mode {
            spec.interrupt_mode = mode;
        }
        Ok(spec)
    }
}

/// Check that `path` is an existing, executable regular file.
pub fn validate_executable(path: &Path) -> Result<(), SessionError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SessionError::configuration(path, "file does not exist"));
        }
        Err(e) => return Err(SessionError::configuration(path, e.to_string())),
    };

    if metadata.is_dir() {
        return Err(SessionError::configuration(
            path,
            "is a directory, not a Python executable",
        ));
    }
    if !metadata.is_file() {
        return Err(SessionError::configuration(path, "is not a regular file"));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(SessionError::configuration(path, "is not executable"));
        }
    }

    Ok(())
}
