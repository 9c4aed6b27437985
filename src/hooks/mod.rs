use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::sync::lock;

const HOOK_TIMEOUT: Duration = Duration::from_secs(5);
const NO_VALUE: &str = "none";

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook name '{0}'")]
    InvalidName(String),

    #[error("hook {0} timed out")]
    Timeout(String),

    #[error("hook {hook} exited with {status}: {stderr}")]
    Failed {
        hook: String,
        status: String,
        stderr: String,
    },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Supplies the current value of a resource guests can poll.
pub trait PollProvider: Send + Sync {
    fn poll(&self) -> Result<String, HookError>;
}

impl<F> PollProvider for F
where
    F: Fn() -> Result<String, HookError> + Send + Sync,
{
    fn poll(&self) -> Result<String, HookError> {
        self()
    }
}

/// Reacts to a named signal sent by the guest.
pub trait SignalHandler: Send + Sync {
    fn handle(&self, value: &str) -> Result<(), HookError>;
}

impl<F> SignalHandler for F
where
    F: Fn(&str) -> Result<(), HookError> + Send + Sync,
{
    fn handle(&self, value: &str) -> Result<(), HookError> {
        self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollSource {
    Provider,
    Stored,
    ShellHook,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollValue {
    pub value: String,
    pub source: PollSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRoute {
    Handler,
    ShellHook,
    LoggedOnly,
}

/// Where a signal ended up, and the last hook failure on the way there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDispatch {
    pub route: SignalRoute,
    pub failure: Option<String>,
}

fn hook_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("hook name pattern is valid")
    })
}

/// Resource and event names become file names under the hooks directory.
pub fn validate_hook_name(name: &str) -> Result<(), HookError> {
    if hook_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(HookError::InvalidName(name.to_string()))
    }
}

/// Guest-facing polls and signals, answered by registered Rust callbacks
/// first and by shell scripts under `hooks_dir` second.
pub struct HookRegistry {
    hooks_dir: PathBuf,
    timeout: Duration,
    error_events: HashSet<String>,
    poll_providers: Mutex<HashMap<String, Arc<dyn PollProvider>>>,
    signal_handlers: Mutex<HashMap<String, Arc<dyn SignalHandler>>>,
    poll_state: Mutex<HashMap<String, String>>,
}

impl HookRegistry {
    pub fn new(hooks_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks_dir: hooks_dir.into(),
            timeout: HOOK_TIMEOUT,
            error_events: HashSet::new(),
            poll_providers: Mutex::new(HashMap::new()),
            signal_handlers: Mutex::new(HashMap::new()),
            poll_state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_error_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.error_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn hooks_dir(&self) -> &Path {
        &self.hooks_dir
    }

    /// Whether `event` means the guest is reporting its own failure.
    pub fn is_error_event(&self, event: &str) -> bool {
        self.error_events.contains(event)
    }

    pub fn register_poll_provider(&self, resource: &str, provider: impl PollProvider + 'static) {
        lock(&self.poll_providers).insert(resource.to_string(), Arc::new(provider));
        log::info!("Registered poll provider for '{}'", resource);
    }

    pub fn register_signal_handler(&self, event: &str, handler: impl SignalHandler + 'static) {
        lock(&self.signal_handlers).insert(event.to_string(), Arc::new(handler));
        log::info!("Registered signal handler for '{}'", event);
    }

    pub fn set_poll_value(&self, resource: &str, value: &str) -> Result<(), HookError> {
        validate_hook_name(resource)?;
        lock(&self.poll_state).insert(resource.to_string(), value.to_string());
        log::info!("Poll state '{}' set to '{}'", resource, value);
        Ok(())
    }

    /// Looks up `resource`: registered provider, then stored value, then
    /// `polls/<resource>.sh`. Falls back to `"none"`; only an invalid name
    /// is an error.
    pub async fn poll(&self, resource: &str) -> Result<PollValue, HookError> {
        validate_hook_name(resource)?;

        let provider = lock(&self.poll_providers).get(resource).cloned();
        if let Some(provider) = provider {
            match provider.poll() {
                Ok(value) => {
                    log::debug!("Poll '{}' -> '{}' (provider)", resource, value);
                    return Ok(PollValue {
                        value,
                        source: PollSource::Provider,
                    });
                }
                Err(e) => log::error!("Poll provider '{}' failed: {}", resource, e),
            }
        }

        let stored = lock(&self.poll_state).get(resource).cloned();
        if let Some(value) = stored {
            return Ok(PollValue {
                value,
                source: PollSource::Stored,
            });
        }

        let script = self.script_path("polls", resource);
        if script.is_file() {
            match self.run_script(&script, None).await {
                Ok(value) => {
                    log::debug!("Poll '{}' -> '{}' (shell hook)", resource, value);
                    return Ok(PollValue {
                        value,
                        source: PollSource::ShellHook,
                    });
                }
                Err(e) => log::error!("Poll hook '{}' failed: {}", resource, e),
            }
        }

        Ok(PollValue {
            value: NO_VALUE.to_string(),
            source: PollSource::Default,
        })
    }

    /// Dispatches a guest signal: registered handler, then
    /// `signals/<event>.sh <value>`, then just the log line. A failing hook
    /// falls through to the next one; only an invalid name is an error.
    pub async fn handle_signal(
        &self,
        event: &str,
        value: &str,
    ) -> Result<SignalDispatch, HookError> {
        validate_hook_name(event)?;
        let mut failure = None;

        let handler = lock(&self.signal_handlers).get(event).cloned();
        if let Some(handler) = handler {
            match handler.handle(value) {
                Ok(()) => {
                    log::info!("Signal '{}' = '{}' (handler)", event, value);
                    return Ok(SignalDispatch {
                        route: SignalRoute::Handler,
                        failure,
                    });
                }
                Err(e) => {
                    log::error!("Signal handler '{}' failed: {}", event, e);
                    failure = Some(e.to_string());
                }
            }
        }

        let script = self.script_path("signals", event);
        if script.is_file() {
            match self.run_script(&script, Some(value)).await {
                Ok(_) => {
                    log::info!("Signal '{}' = '{}' (shell hook)", event, value);
                    return Ok(SignalDispatch {
                        route: SignalRoute::ShellHook,
                        failure,
                    });
                }
                Err(e) => {
                    log::error!("Signal hook '{}' failed: {}", event, e);
                    failure = Some(e.to_string());
                }
            }
        }

        log::info!("Signal '{}' = '{}' (no handler)", event, value);
        Ok(SignalDispatch {
            route: SignalRoute::LoggedOnly,
            failure,
        })
    }

    fn script_path(&self, kind: &str, name: &str) -> PathBuf {
        self.hooks_dir.join(kind).join(format!("{}.sh", name))
    }

    async fn run_script(&self, script: &Path, arg: Option<&str>) -> Result<String, HookError> {
        let hook = script.display().to_string();
        let mut command = Command::new(script);
        command.args(arg).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| HookError::Timeout(hook.clone()))??;

        if !output.status.success() {
            return Err(HookError::Failed {
                hook,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
