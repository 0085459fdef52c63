use std::fmt;
use std::path::PathBuf;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

pub const SUCCESS: ExitCode = 0;
/// `cd` argument or path error.
pub const CD_FAILURE: ExitCode = 10;
/// `umask` argument error.
pub const UMASK_FAILURE: ExitCode = 20;
/// `time` measurement or nested-command spawn error.
pub const TIME_FAILURE: ExitCode = 30;
/// `read` argument or empty-line error.
pub const READ_FAILURE: ExitCode = 40;
/// The line could not be parsed.
pub const SYNTAX_FAILURE: ExitCode = 2;
/// A `~user` in an argument names no known user.
pub const EXPAND_FAILURE: ExitCode = 1;
/// A pipe or a stage process could not be created or wired.
pub const PIPELINE_FAILURE: ExitCode = 3;
/// A redirection file could not be opened or swapped in.
pub const REDIRECT_FAILURE: ExitCode = -2;
/// The standard streams could not be put back after a cycle.
pub const RESTORE_FAILURE: ExitCode = 4;
/// An external program could not be started, or it did not exit normally.
pub const EXEC_FAILURE: ExitCode = 246;

/// One stage of a pipeline: the program (or built-in) name followed by its arguments.
///
/// A command is never empty; the only way to build one is [`Command::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
}

impl Command {
    /// Returns `None` for an empty argument vector.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    /// Program or built-in name (`argv[0]`).
    pub fn name(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Tokens may be rewritten in place, but never added or removed.
    pub(crate) fn argv_mut(&mut self) -> &mut [String] {
        &mut self.argv
    }
}

/// An ordered, non-empty chain of commands, each feeding the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    /// Returns `None` when `commands` is empty.
    pub fn new(commands: Vec<Command>) -> Option<Self> {
        if commands.is_empty() {
            None
        } else {
            Some(Self { commands })
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub(crate) fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }
}

/// One of the three standard streams, numbered like their descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Input = 0,
    Output = 1,
    Error = 2,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Input, Stream::Output, Stream::Error];

    pub fn fd(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Input => write!(f, "standard input"),
            Stream::Output => write!(f, "standard output"),
            Stream::Error => write!(f, "standard error"),
        }
    }
}

/// Files bound to the standard streams for the whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectionSpec {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub error: Option<PathBuf>,
}

impl RedirectionSpec {
    pub fn get(&self, stream: Stream) -> Option<&PathBuf> {
        match stream {
            Stream::Input => self.input.as_ref(),
            Stream::Output => self.output.as_ref(),
            Stream::Error => self.error.as_ref(),
        }
    }

    pub(crate) fn slot_mut(&mut self, stream: Stream) -> &mut Option<PathBuf> {
        match stream {
            Stream::Input => &mut self.input,
            Stream::Output => &mut self.output,
            Stream::Error => &mut self.error,
        }
    }

    pub fn is_empty(&self) -> bool {
        Stream::ALL.iter().all(|&s| self.get(s).is_none())
    }
}

/// Everything the parser hands over for one interactive cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub pipeline: Pipeline,
    pub redirection: RedirectionSpec,
    pub background: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        assert!(Command::new(Vec::new()).is_none());
        let cmd = Command::new(vec!["ls".to_string(), "-l".to_string()]).unwrap();
        assert_eq!(cmd.name(), "ls");
        assert_eq!(cmd.argv().len(), 2);
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(Pipeline::new(Vec::new()).is_none());
    }

    #[test]
    fn redirection_slots_follow_stream_order() {
        let mut spec = RedirectionSpec::default();
        assert!(spec.is_empty());
        *spec.slot_mut(Stream::Error) = Some(PathBuf::from("err.log"));
        assert_eq!(spec.get(Stream::Error), Some(&PathBuf::from("err.log")));
        assert_eq!(spec.get(Stream::Input), None);
        assert_eq!(Stream::Error.fd(), 2);
        assert!(!spec.is_empty());
    }
}
