use crate::command::{
    EXPAND_FAILURE, ExitCode, PIPELINE_FAILURE, ParsedLine, Pipeline, SUCCESS, SYNTAX_FAILURE,
};
use crate::env::{BGPID_VAR, DEFAULT_PROMPT, Environment, MYPID_VAR, PROMPT_VAR, STATUS_VAR};
use crate::expand::{self, ExpandError, SystemUsers, UserDirectory};
use crate::io_adapters::{FdReader, read_line};
use crate::parser::{self, ParseError};
use crate::pipeline::run_pipeline;
use crate::process;
use crate::redirect::{self, RedirectError};
use anyhow::Context;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, IsTerminal};
use thiserror::Error;

/// Why one interactive cycle did not run to completion.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("syntax error: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Redirect(#[from] RedirectError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error("cannot start background pipeline: {0}")]
    Background(#[source] nix::Error),
}

impl CycleError {
    /// Only a failure to put the standard streams back ends the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Redirect(e) if e.is_restore())
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            CycleError::Parse(_) => SYNTAX_FAILURE,
            CycleError::Redirect(e) => e.exit_code(),
            CycleError::Expand(_) => EXPAND_FAILURE,
            CycleError::Background(_) => PIPELINE_FAILURE,
        }
    }
}

/// The interactive command interpreter.
///
/// Owns the [`Environment`] every built-in and pipeline stage works against,
/// and drives one cycle per input line: redirect, expand, run, restore.
///
/// Example
/// ```no_run
/// use msh::Interpreter;
/// let mut sh = Interpreter::new();
/// let code = sh.run_line("echo hello | tr a-z A-Z").unwrap();
/// assert_eq!(code, 0);
/// ```
pub struct Interpreter {
    env: Environment,
    users: Box<dyn UserDirectory>,
    last_status: ExitCode,
}

impl Interpreter {
    /// Interpreter over a snapshot of the process environment.
    pub fn new() -> Self {
        Self::with_environment(Environment::new(), Box::new(SystemUsers))
    }

    /// Interpreter over an explicit environment and user database.
    ///
    /// Records `mypid` and a default `prompt` if none is set.
    pub fn with_environment(mut env: Environment, users: Box<dyn UserDirectory>) -> Self {
        env.set_var(MYPID_VAR, unistd::getpid().to_string());
        if env.get_var(PROMPT_VAR).is_none() {
            env.set_var(PROMPT_VAR, DEFAULT_PROMPT);
        }
        Self {
            env,
            users,
            last_status: SUCCESS,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    #[cfg(test)]
    fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// Exit code of the last cycle that ran something.
    pub fn last_status(&self) -> ExitCode {
        self.last_status
    }

    /// Run one already parsed line.
    ///
    /// Redirection is applied before expansion and undone after the pipeline,
    /// whatever happened in between. A foreground result is stored in
    /// `status`; a background launch stores the child's pid in `bgpid`.
    pub fn execute(&mut self, line: ParsedLine) -> Result<ExitCode, CycleError> {
        let ParsedLine {
            mut pipeline,
            redirection,
            background,
        } = line;

        let saved = redirect::apply(&redirection)?;
        let outcome = self.expand_and_run(&mut pipeline, background);
        process::flush_stdio();
        saved.restore()?;
        outcome
    }

    fn expand_and_run(
        &mut self,
        pipeline: &mut Pipeline,
        background: bool,
    ) -> Result<ExitCode, CycleError> {
        expand::expand_pipeline(pipeline, &self.env, self.users.as_ref())?;
        if background {
            return self.spawn_background(pipeline);
        }
        let code = run_pipeline(pipeline, &mut self.env, false);
        self.env.set_var(STATUS_VAR, code.to_string());
        Ok(code)
    }

    fn spawn_background(&mut self, pipeline: &Pipeline) -> Result<ExitCode, CycleError> {
        process::flush_stdio();
        // SAFETY: the interpreter is single-threaded; the child never returns.
        match unsafe { unistd::fork() }.map_err(CycleError::Background)? {
            ForkResult::Child => {
                process::reset_child_signals(false);
                let code = run_pipeline(pipeline, &mut self.env, true);
                process::terminate(code)
            }
            ForkResult::Parent { child } => {
                tracing::debug!("background pipeline is {child}");
                self.env.set_var(BGPID_VAR, child.to_string());
                eprintln!("[{child}]");
                Ok(SUCCESS)
            }
        }
    }

    /// Parse and run one input line.
    ///
    /// Blank lines do nothing. Non-fatal failures are reported on standard
    /// error and become the cycle's status; only a fatal [`CycleError`] is
    /// returned as an error.
    pub fn run_line(&mut self, line: &str) -> Result<ExitCode, CycleError> {
        let outcome = match parser::parse_line(line) {
            Ok(Some(parsed)) => self.execute(parsed),
            Ok(None) => return Ok(self.last_status),
            Err(e) => Err(CycleError::from(e)),
        };
        let code = match outcome {
            Ok(code) => code,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                eprintln!("msh: {e}");
                let code = e.exit_code();
                self.env.set_var(STATUS_VAR, code.to_string());
                code
            }
        };
        self.last_status = code;
        Ok(code)
    }

    /// Collect background children that have finished, without blocking.
    pub fn reap_finished(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => tracing::debug!("background job done: {status:?}"),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!("waitpid failed: {e}");
                    break;
                }
            }
        }
    }

    fn prompt(&self) -> String {
        self.env
            .get_var(PROMPT_VAR)
            .unwrap_or(DEFAULT_PROMPT)
            .to_string()
    }

    /// Read-eval loop until end of input.
    ///
    /// A terminal gets line editing and history; anything else is read as a
    /// script, one unbuffered line at a time and without a prompt. Returns the
    /// last cycle's status, or the sentinel of a fatal cycle error.
    pub fn repl(&mut self) -> anyhow::Result<ExitCode> {
        process::ignore_interactive_signals();
        if io::stdin().is_terminal() {
            self.repl_terminal()
        } else {
            self.repl_script()
        }
    }

    fn repl_terminal(&mut self) -> anyhow::Result<ExitCode> {
        let mut rl = DefaultEditor::new().context("cannot set up line editing")?;
        loop {
            self.reap_finished();
            process::flush_stdio();
            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    if let Err(e) = self.run_line(&line) {
                        eprintln!("msh: {e}");
                        return Ok(e.exit_code());
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return Ok(self.last_status),
                Err(e) => return Err(e).context("cannot read input"),
            }
        }
    }

    fn repl_script(&mut self) -> anyhow::Result<ExitCode> {
        let mut stdin = FdReader::stdin();
        loop {
            self.reap_finished();
            let Some(line) = read_line(&mut stdin).context("cannot read standard input")? else {
                return Ok(self.last_status);
            };
            if let Err(e) = self.run_line(&line) {
                eprintln!("msh: {e}");
                return Ok(e.exit_code());
            }
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{READ_FAILURE, REDIRECT_FAILURE};
    use serial_test::serial;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    struct NoUsers;

    impl UserDirectory for NoUsers {
        fn home_dir(&self, _user: &str) -> Option<PathBuf> {
            None
        }
    }

    fn interpreter(dir: &Path) -> Interpreter {
        let vars = HashMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), dir.display().to_string()),
        ]);
        Interpreter::with_environment(Environment::with_vars(vars, dir.to_path_buf()), Box::new(NoUsers))
    }

    #[test]
    fn start_up_records_pid_and_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let sh = interpreter(dir.path());
        assert_eq!(
            sh.env().get_var(MYPID_VAR),
            Some(unistd::getpid().to_string().as_str())
        );
        assert_eq!(sh.env().get_var(PROMPT_VAR), Some(DEFAULT_PROMPT));
    }

    #[test]
    fn blank_line_keeps_last_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = interpreter(dir.path());
        assert_eq!(sh.run_line("   ").unwrap(), SUCCESS);
        assert_eq!(sh.env().get_var(STATUS_VAR), None);
    }

    #[test]
    fn syntax_error_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = interpreter(dir.path());
        assert_eq!(sh.run_line("echo 'open").unwrap(), SYNTAX_FAILURE);
        assert_eq!(sh.run_line("| wc").unwrap(), SYNTAX_FAILURE);
        assert_eq!(sh.last_status(), SYNTAX_FAILURE);
    }

    #[test]
    fn unknown_user_fails_only_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = interpreter(dir.path());
        assert_eq!(sh.run_line("read x ~ghost").unwrap(), EXPAND_FAILURE);
        assert_eq!(sh.env().get_var(STATUS_VAR), Some("1"));
        assert_eq!(sh.env().get_var("x"), None);
    }

    #[test]
    #[serial]
    fn read_takes_its_line_from_redirected_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "1 2 3\n").unwrap();
        let mut sh = interpreter(dir.path());

        let code = sh.run_line(&format!("read x y < {}", input.display())).unwrap();

        assert_eq!(code, SUCCESS);
        assert_eq!(sh.env().get_var("x"), Some("1"));
        assert_eq!(sh.env().get_var("y"), Some("2 3"));
        assert_eq!(sh.env().get_var(STATUS_VAR), Some("0"));
    }

    #[test]
    #[serial]
    fn read_of_an_empty_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty");
        fs::write(&input, "").unwrap();
        let mut sh = interpreter(dir.path());

        let code = sh.run_line(&format!("read x < {}", input.display())).unwrap();

        assert_eq!(code, READ_FAILURE);
        assert_eq!(sh.env().get_var(STATUS_VAR), Some("40"));
    }

    #[test]
    #[serial]
    fn variables_are_expanded_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "hello\n").unwrap();
        let mut sh = interpreter(dir.path());
        sh.env_mut().set_var("NAME", "greeting");

        sh.run_line(&format!("read $NAME < {}", input.display()))
            .unwrap();

        assert_eq!(sh.env().get_var("greeting"), Some("hello"));
    }

    #[test]
    #[serial]
    fn missing_input_file_is_a_redirect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = interpreter(dir.path());
        let missing = dir.path().join("nope");

        let code = sh.run_line(&format!("read x < {}", missing.display())).unwrap();

        assert_eq!(code, REDIRECT_FAILURE);
        assert_eq!(sh.env().get_var(STATUS_VAR), Some("-2"));
    }

    #[test]
    #[serial]
    fn external_status_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = interpreter(dir.path());
        assert_eq!(sh.run_line("false").unwrap(), 1);
        assert_eq!(sh.env().get_var(STATUS_VAR), Some("1"));
        assert_eq!(sh.run_line("true").unwrap(), 0);
        assert_eq!(sh.env().get_var(STATUS_VAR), Some("0"));
    }

    #[test]
    #[serial]
    fn output_redirection_captures_a_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut sh = interpreter(dir.path());

        let code = sh
            .run_line(&format!("echo b a | sort -r > {}", out.display()))
            .unwrap();

        assert_eq!(code, SUCCESS);
        assert_eq!(fs::read_to_string(&out).unwrap(), "b a\n");
    }

    #[test]
    #[serial]
    fn background_launch_sets_bgpid() {
        let dir = tempfile::tempdir().unwrap();
        let mut sh = interpreter(dir.path());

        assert_eq!(sh.run_line("true &").unwrap(), SUCCESS);

        let pid: i32 = sh.env().get_var(BGPID_VAR).unwrap().parse().unwrap();
        assert!(pid > 0);
        assert_eq!(sh.env().get_var(STATUS_VAR), None);
        waitpid(Pid::from_raw(pid), None).unwrap();
    }
}
