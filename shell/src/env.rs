use std::collections::HashMap;
use std::env as stdenv;
use std::ffi::{CString, NulError};
use std::path::PathBuf;
use std::time::Instant;

/// Variable holding the interpreter's own process id.
pub const MYPID_VAR: &str = "mypid";
/// Variable holding the root process id of the most recent background pipeline.
pub const BGPID_VAR: &str = "bgpid";
/// Variable holding the exit status of the most recent foreground pipeline.
pub const STATUS_VAR: &str = "status";
/// Variable holding the interactive prompt text.
pub const PROMPT_VAR: &str = "prompt";

pub const DEFAULT_PROMPT: &str = "msh> ";

/// Mutable, user-level view of the process environment used by the interpreter.
///
/// The environment contains:
/// - `vars`: the variables exported to every program the interpreter starts.
/// - `current_dir`: the working directory last set through `cd`.
/// - `started_at`: when the interpreter came up, for `time` without arguments.
///
/// Every component that reads or mutates shared state receives this value
/// explicitly, so tests can hand in a hand-built environment.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Key-value store of environment variables (e.g., PATH, HOME).
    pub vars: HashMap<String, String>,
    /// The current working directory for command execution.
    pub current_dir: PathBuf,
    pub started_at: Instant,
}

impl Environment {
    /// Capture the current process state into a new `Environment` instance.
    ///
    /// This copies variables from `std::env::vars_os()` (lossily, so a stray
    /// non-UTF-8 value cannot abort start-up) and initializes `current_dir`
    /// from `std::env::current_dir()`.
    pub fn new() -> Self {
        let vars = stdenv::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_vars(vars, current_dir)
    }

    /// Build an environment from explicit parts, ignoring the process state.
    pub fn with_vars(vars: HashMap<String, String>, current_dir: PathBuf) -> Self {
        Self {
            vars,
            current_dir,
            started_at: Instant::now(),
        }
    }

    /// Get the value of an environment variable.
    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set or override an environment variable.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// The invoking user's home directory, as recorded in `HOME`.
    pub fn home(&self) -> Option<&str> {
        self.get_var("HOME")
    }

    /// `KEY=value` strings handed to `execve`.
    pub fn envp(&self) -> Result<Vec<CString>, NulError> {
        self.vars
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
