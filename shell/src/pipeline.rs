//! Running a chain of commands connected by pipes.
//!
//! Every stage but the last runs in its own forked child. The last stage runs
//! in the calling process with its standard input wired to the final pipe, so
//! a built-in at the tail (`ls | cd /tmp`) changes the interpreter's own
//! working directory and variables, while the same built-in earlier in the
//! chain only changes a short-lived child.

use crate::builtin::{Placement, dispatch};
use crate::command::{Command, ExitCode, PIPELINE_FAILURE, Pipeline, SUCCESS, Stream};
use crate::env::Environment;
use crate::process;
use crate::redirect::SavedFd;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("fork: {0}")]
    Fork(#[source] nix::Error),
    #[error("cannot wire {stream} to the pipeline: {source}")]
    Wire { stream: Stream, source: nix::Error },
    #[error("cannot restore standard input after the pipeline: {0}")]
    Restore(#[source] nix::Error),
}

/// Read end first, write end second.
type PipeFds = (OwnedFd, OwnedFd);

/// Run `pipeline` and return the exit code of its last stage.
///
/// With `background` set the pipeline already runs in a disposable child, so
/// the last stage may replace the process image, and children keep ignoring
/// terminal signals. Structural failures are reported and mapped to
/// [`PIPELINE_FAILURE`].
pub fn run_pipeline(pipeline: &Pipeline, env: &mut Environment, background: bool) -> ExitCode {
    match execute(pipeline, env, background) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("msh: {e}");
            PIPELINE_FAILURE
        }
    }
}

fn placement(background: bool) -> Placement {
    if background {
        Placement::Replace
    } else {
        Placement::Foreground
    }
}

fn execute(
    pipeline: &Pipeline,
    env: &mut Environment,
    background: bool,
) -> Result<ExitCode, PipelineError> {
    let Some((last, upstream)) = pipeline.commands().split_last() else {
        return Ok(SUCCESS);
    };
    if upstream.is_empty() {
        return Ok(dispatch(last.argv(), env, placement(background)));
    }

    // All pipes exist before the first stage is forked.
    let mut pipes: Vec<PipeFds> = Vec::with_capacity(upstream.len());
    for _ in upstream {
        pipes.push(unistd::pipe2(OFlag::O_CLOEXEC).map_err(PipelineError::Pipe)?);
    }

    let mut children = Vec::with_capacity(upstream.len());
    for (index, command) in upstream.iter().enumerate() {
        process::flush_stdio();
        // SAFETY: the interpreter is single-threaded; the child never returns.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                run_stage(index, command, std::mem::take(&mut pipes), env, background)
            }
            Ok(ForkResult::Parent { child }) => {
                tracing::debug!("stage {index} ({}) is {child}", command.name());
                children.push(child);
            }
            Err(e) => return Err(PipelineError::Fork(e)),
        }
    }

    let code = run_last_stage(last, pipes, env, background)?;
    reap(&children);
    Ok(code)
}

/// Body of the forked child for upstream stage `index`; never returns.
fn run_stage(
    index: usize,
    command: &Command,
    pipes: Vec<PipeFds>,
    env: &mut Environment,
    background: bool,
) -> ! {
    process::reset_child_signals(!background);
    if let Err(e) = wire_stage(index, &pipes) {
        eprintln!("msh: {e}");
        process::terminate(PIPELINE_FAILURE);
    }
    // Only the duplicated standard descriptors stay open.
    drop(pipes);
    let code = dispatch(command.argv(), env, Placement::Replace);
    process::terminate(code)
}

fn wire_stage(index: usize, pipes: &[PipeFds]) -> Result<(), PipelineError> {
    if index > 0 {
        let (read_end, _) = &pipes[index - 1];
        wire(read_end, Stream::Input)?;
    }
    let (_, write_end) = &pipes[index];
    wire(write_end, Stream::Output)
}

fn wire(fd: &OwnedFd, stream: Stream) -> Result<(), PipelineError> {
    unistd::dup2(fd.as_raw_fd(), stream.fd())
        .map(drop)
        .map_err(|source| PipelineError::Wire { stream, source })
}

/// Run the tail stage at home, reading from the last pipe.
///
/// Standard input is put back afterwards whatever the stage returned.
fn run_last_stage(
    last: &Command,
    pipes: Vec<PipeFds>,
    env: &mut Environment,
    background: bool,
) -> Result<ExitCode, PipelineError> {
    let saved_stdin = SavedFd::save(Stream::Input)
        .map_err(|source| PipelineError::Wire { stream: Stream::Input, source })?;
    let Some((read_end, _)) = pipes.last() else {
        return Ok(SUCCESS);
    };
    wire(read_end, Stream::Input)?;
    drop(pipes);

    let code = dispatch(last.argv(), env, placement(background));

    saved_stdin.restore().map_err(PipelineError::Restore)?;
    Ok(code)
}

/// Wait for the upstream stages so none of them lingers as a zombie.
fn reap(children: &[Pid]) {
    for &child in children {
        loop {
            match waitpid(child, None) {
                Ok(status) => {
                    tracing::debug!("upstream stage finished: {status:?}");
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!("waitpid({child}) failed: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::MetadataExt;

    fn stdin_identity() -> (u64, u64) {
        let meta = fs::metadata("/proc/self/fd/0").unwrap();
        (meta.dev(), meta.ino())
    }

    fn pipeline(stages: &[&[&str]]) -> Pipeline {
        let commands = stages
            .iter()
            .map(|argv| Command::new(argv.iter().map(|w| w.to_string()).collect()).unwrap())
            .collect();
        Pipeline::new(commands).unwrap()
    }

    #[test]
    #[serial]
    fn tail_builtin_reads_upstream_output() {
        let mut env = Environment::new();
        let before = stdin_identity();

        let code = run_pipeline(
            &pipeline(&[&["printf", "a b c\\n"], &["cat"], &["read", "x", "y"]]),
            &mut env,
            false,
        );

        assert_eq!(code, SUCCESS);
        assert_eq!(env.get_var("x"), Some("a"));
        assert_eq!(env.get_var("y"), Some("b c"));
        assert_eq!(stdin_identity(), before);
    }

    #[test]
    #[serial]
    fn stdin_is_restored_after_an_external_tail() {
        let mut env = Environment::new();
        let before = stdin_identity();

        let code = run_pipeline(&pipeline(&[&["true"], &["false"]]), &mut env, false);

        assert_eq!(code, 1);
        assert_eq!(stdin_identity(), before);
    }

    #[test]
    #[serial]
    fn upstream_builtin_only_changes_its_child() {
        let mut env = Environment::new();
        let cwd = std::env::current_dir().unwrap();
        let recorded = env.current_dir.clone();

        let code = run_pipeline(&pipeline(&[&["cd", "/"], &["true"]]), &mut env, false);

        assert_eq!(code, SUCCESS);
        assert_eq!(std::env::current_dir().unwrap(), cwd);
        assert_eq!(env.current_dir, recorded);
    }

    #[test]
    #[serial]
    fn single_command_runs_without_pipes() {
        let mut env = Environment::new();
        let code = run_pipeline(&pipeline(&[&["false"]]), &mut env, false);
        assert_eq!(code, 1);
    }
}
