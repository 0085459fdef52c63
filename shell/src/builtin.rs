use crate::command::{
    CD_FAILURE, ExitCode, READ_FAILURE, SUCCESS, TIME_FAILURE, UMASK_FAILURE,
};
use crate::env::Environment;
use crate::external;
use crate::io_adapters::{FdReader, read_line};
use crate::process;
use anyhow::{Context, Result, anyhow, bail};
use argh::{EarlyExit, FromArgs};
use nix::sys::resource::{Usage, UsageWho, getrusage};
use nix::sys::stat::{Mode, umask};
use nix::sys::time::TimeVal;
use nix::unistd::{self, ForkResult};
use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd" or "umask".
    fn name() -> &'static str;

    /// Treat every argument as positional, even one starting with `-`.
    const POSITIONAL_ONLY: bool = false;

    /// Executes the command using provided IO streams and environment.
    ///
    /// An `Err` is reported by the dispatcher and turned into the built-in's
    /// failure code.
    fn execute(
        self,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

/// The fixed set of commands that run inside the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Cd,
    Umask,
    Time,
    Read,
}

impl BuiltinKind {
    /// `None` means the name refers to an external program.
    pub fn classify(name: &str) -> Option<Self> {
        match name {
            "cd" => Some(BuiltinKind::Cd),
            "umask" => Some(BuiltinKind::Umask),
            "time" => Some(BuiltinKind::Time),
            "read" => Some(BuiltinKind::Read),
            _ => None,
        }
    }

    pub fn failure_code(self) -> ExitCode {
        match self {
            BuiltinKind::Cd => CD_FAILURE,
            BuiltinKind::Umask => UMASK_FAILURE,
            BuiltinKind::Time => TIME_FAILURE,
            BuiltinKind::Read => READ_FAILURE,
        }
    }

    /// Run the built-in with `argv[0]` being its own name.
    pub fn run(
        self,
        argv: &[String],
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> ExitCode {
        match self {
            BuiltinKind::Cd => invoke::<Cd>(self, argv, stdin, stdout, env),
            BuiltinKind::Umask => invoke::<Umask>(self, argv, stdin, stdout, env),
            BuiltinKind::Time => invoke::<Time>(self, argv, stdin, stdout, env),
            BuiltinKind::Read => invoke::<ReadVars>(self, argv, stdin, stdout, env),
        }
    }
}

/// Where an external program may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// In a new child that the caller waits for.
    Foreground,
    /// In place of the current process; only valid in a disposable child.
    Replace,
}

/// Run one command: a built-in in-process, anything else as a program.
///
/// Built-ins use the real descriptors 0 and 1, read without buffering so
/// nothing meant for a later reader is consumed.
pub fn dispatch(argv: &[String], env: &mut Environment, placement: Placement) -> ExitCode {
    let Some(name) = argv.first() else {
        return SUCCESS;
    };
    match BuiltinKind::classify(name) {
        Some(kind) => {
            let mut stdout = io::stdout();
            let code = kind.run(argv, &mut FdReader::stdin(), &mut stdout, env);
            if let Err(e) = stdout.flush() {
                tracing::warn!("failed to flush output of {name}: {e}");
            }
            code
        }
        None => match placement {
            Placement::Foreground => external::run_foreground(argv, env),
            Placement::Replace => external::exec_replace(argv, env),
        },
    }
}

fn invoke<T: BuiltinCommand>(
    kind: BuiltinKind,
    argv: &[String],
    stdin: &mut dyn Read,
    stdout: &mut dyn Write,
    env: &mut Environment,
) -> ExitCode {
    let mut args: Vec<&str> = Vec::with_capacity(argv.len());
    if T::POSITIONAL_ONLY {
        args.push("--");
    }
    args.extend(argv.iter().skip(1).map(String::as_str));
    let outcome = match T::from_args(&[T::name()], &args) {
        Ok(cmd) => cmd.execute(stdin, stdout, env),
        Err(EarlyExit {
            output,
            status: Ok(()),
        }) => write!(stdout, "{output}")
            .map(|_| SUCCESS)
            .map_err(Into::into),
        Err(EarlyExit {
            output,
            status: Err(()),
        }) => Err(anyhow!("{}", output.trim_end())),
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            if let Err(flush) = stdout.flush() {
                tracing::warn!("failed to flush output of {}: {flush}", T::name());
            }
            eprintln!("msh: {}: {e:#}", T::name());
            kind.failure_code()
        }
    }
}

#[derive(FromArgs)]
/// Change the working directory and print the new one.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    const POSITIONAL_ONLY: bool = true;

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        let target = match self.target {
            Some(t) => PathBuf::from(t),
            None => PathBuf::from(env.home().ok_or_else(|| anyhow!("HOME not set"))?),
        };

        env::set_current_dir(&target).with_context(|| format!("{}", target.display()))?;
        let cwd = env::current_dir().context("cannot read the new working directory")?;
        writeln!(stdout, "{}", cwd.display())?;
        env.current_dir = cwd;
        Ok(SUCCESS)
    }
}

#[derive(FromArgs)]
/// Print the file mode creation mask, or set it and print the previous one.
pub struct Umask {
    #[argh(positional)]
    /// new mask, in octal.
    pub mask: Option<String>,
}

fn parse_mask(text: &str) -> Option<Mode> {
    let bits = u32::from_str_radix(text, 8).ok().filter(|&b| b <= 0o7777)?;
    Some(Mode::from_bits_truncate(bits))
}

impl BuiltinCommand for Umask {
    fn name() -> &'static str {
        "umask"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _env: &mut Environment,
    ) -> Result<ExitCode> {
        let previous = match self.mask {
            Some(text) => {
                let mask = parse_mask(&text).ok_or_else(|| anyhow!("invalid mask: {text}"))?;
                umask(mask)
            }
            None => {
                // The only way to read the mask is to set it; put it straight back.
                let current = umask(Mode::empty());
                umask(current);
                current
            }
        };
        writeln!(stdout, "{:o}", previous.bits())?;
        Ok(SUCCESS)
    }
}

#[derive(FromArgs)]
/// Run a command and report the time it took.
/// Without a command, report the times accumulated by the interpreter and its children.
pub struct Time {
    #[argh(positional, greedy)]
    /// command to run, with its arguments.
    pub command: Vec<String>,
}

fn seconds(tv: TimeVal) -> f64 {
    tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1_000_000.0
}

fn cpu_seconds(usage: &Usage) -> (f64, f64) {
    (seconds(usage.user_time()), seconds(usage.system_time()))
}

fn report(stdout: &mut dyn Write, user: f64, sys: f64, real: Duration) -> io::Result<()> {
    writeln!(stdout, "{user:.3}u {sys:.3}s {:.3}r", real.as_secs_f64())
}

impl Time {
    fn accumulated(stdout: &mut dyn Write, env: &Environment) -> Result<ExitCode> {
        let own = cpu_seconds(&getrusage(UsageWho::RUSAGE_SELF).context("getrusage")?);
        let children = cpu_seconds(&getrusage(UsageWho::RUSAGE_CHILDREN).context("getrusage")?);
        report(
            stdout,
            own.0 + children.0,
            own.1 + children.1,
            env.started_at.elapsed(),
        )?;
        Ok(SUCCESS)
    }
}

impl BuiltinCommand for Time {
    fn name() -> &'static str {
        "time"
    }

    fn execute(
        self,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.command.is_empty() {
            return Self::accumulated(stdout, env);
        }

        let before = cpu_seconds(&getrusage(UsageWho::RUSAGE_CHILDREN).context("getrusage")?);
        let started = Instant::now();
        stdout.flush()?;
        process::flush_stdio();
        // SAFETY: the interpreter is single-threaded; the child exits without returning.
        let child = match unsafe { unistd::fork() }.context("fork")? {
            ForkResult::Child => {
                process::reset_child_signals(true);
                // A program that cannot be started is a failure of `time` itself.
                let code = match BuiltinKind::classify(&self.command[0]) {
                    Some(_) => dispatch(&self.command, env, Placement::Replace),
                    None => external::exec_or_exit(&self.command, env, TIME_FAILURE),
                };
                process::terminate(code)
            }
            ForkResult::Parent { child } => child,
        };
        tracing::debug!("timing {} as {child}", self.command[0]);
        let code = external::wait_for(child);
        let real = started.elapsed();
        let after = cpu_seconds(&getrusage(UsageWho::RUSAGE_CHILDREN).context("getrusage")?);
        report(stdout, after.0 - before.0, after.1 - before.1, real)?;
        Ok(code)
    }
}

#[derive(FromArgs)]
/// Read one line from standard input and assign its words to variables.
pub struct ReadVars {
    #[argh(positional)]
    /// variables to assign in order; the last one receives the rest of the line.
    pub names: Vec<String>,
}

/// Split `line` on whitespace into at most `count` fields; the last keeps
/// the remainder of the line, inner whitespace included.
fn split_fields(line: &str, count: usize) -> Vec<&str> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    while !rest.is_empty() && fields.len() + 1 < count {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if !rest.is_empty() {
        fields.push(rest.trim_end());
    }
    fields
}

impl BuiltinCommand for ReadVars {
    fn name() -> &'static str {
        "read"
    }

    fn execute(
        self,
        stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode> {
        if self.names.is_empty() {
            bail!("expected at least one variable name");
        }
        let line = read_line(stdin)?.unwrap_or_default();
        if line.is_empty() {
            bail!("empty line");
        }
        for (name, value) in self.names.iter().zip(split_fields(&line, self.names.len())) {
            env.set_var(name.as_str(), value);
        }
        Ok(SUCCESS)
    }
}
