use crate::command::{EXEC_FAILURE, ExitCode};
use crate::env::Environment;
use crate::process;
use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use std::borrow::Cow;
use std::convert::Infallible;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Run a program in a child process and wait for it.
///
/// The child gets the default SIGINT/SIGQUIT dispositions back so the
/// terminal can interrupt it. Normal termination yields the program's exit
/// status; anything else (a signal, a failed fork or wait) yields
/// [`EXEC_FAILURE`].
pub fn run_foreground(argv: &[String], env: &Environment) -> ExitCode {
    process::flush_stdio();
    // SAFETY: the interpreter is single-threaded; the child only execs or exits.
    match unsafe { unistd::fork() } {
        Err(e) => {
            eprintln!("msh: fork: {e}");
            EXEC_FAILURE
        }
        Ok(ForkResult::Child) => {
            process::reset_child_signals(true);
            exec_replace(argv, env)
        }
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!("started {} as {child}", argv[0]);
            wait_for(child)
        }
    }
}

/// Block until `child` terminates and translate how it ended.
pub fn wait_for(child: Pid) -> ExitCode {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::debug!("{child} killed by {signal}");
                return EXEC_FAILURE;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                eprintln!("msh: waitpid: {e}");
                return EXEC_FAILURE;
            }
        }
    }
}

/// Replace the current process image with `argv[0]`.
///
/// The program is looked up on the `PATH` recorded in `env` and receives
/// `env`'s variables. If it cannot be started the failure is reported and
/// the process terminates with [`EXEC_FAILURE`].
pub fn exec_replace(argv: &[String], env: &Environment) -> ! {
    exec_or_exit(argv, env, EXEC_FAILURE)
}

/// Like [`exec_replace`], but a program that cannot be started ends the
/// process with `failure` instead.
pub fn exec_or_exit(argv: &[String], env: &Environment, failure: ExitCode) -> ! {
    match try_exec(argv, env) {
        Ok(never) => match never {},
        Err(e) => {
            eprintln!("msh: {}: {e:#}", argv[0]);
            process::terminate(failure)
        }
    }
}

fn try_exec(argv: &[String], env: &Environment) -> Result<Infallible> {
    let search_paths = env.get_var("PATH").unwrap_or_default();
    let program = find_command_path(OsStr::new(search_paths), Path::new(&argv[0]))
        .ok_or_else(|| anyhow!("command not found"))?;
    let program = CString::new(program.as_os_str().as_bytes())?;
    let args = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let envp = env.envp()?;
    Ok(unistd::execve(&program, &args, &envp).context("exec")?)
}

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it exists.
/// - Relative with multiple components (e.g., `bin/sh`): returns it if it exists.
/// - `./foo`: returns it if it exists.
/// - Single path component (no separators): search each directory in `search_paths` (PATH)
///   and return the first existing match.
/// - Empty path: returns `None`.
///
/// Returns either a borrowed reference to the provided `path` or an owned `PathBuf`
/// when the result is discovered via PATH lookup.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    if path.is_absolute() {
        return find_by_path(path).map(Cow::Borrowed);
    }

    if path.starts_with("./") && path.exists() {
        return Some(Cow::Borrowed(path));
    }

    let mut components = path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        // Empty path -> not found
        (None, None) => None,
        (Some(x), None) => find_in_path(search_paths, x.as_os_str()).map(Cow::Owned),
        // Multiple components -> relative to current dir
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| candidate.is_file())
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if path.exists() { Some(path) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::fs::File;

    fn osstr(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn absolute_existing_true() {
        let path = Path::new("/bin/sh");
        let res = find_command_path(osstr("/bin"), path);
        assert!(res.is_some(), "Expected to find /bin/sh via absolute path");
        let found = res.unwrap();
        assert_eq!(found.as_ref(), path);
    }

    #[test]
    fn absolute_nonexisting() {
        let path = Path::new("/bin/nonexisting");
        let res = find_command_path(osstr("/bin"), path);
        assert!(
            res.is_none(),
            "Expected not to find /bin/nonexisting via absolute path"
        );
    }

    #[test]
    fn single_component_found_in_path() {
        let path = Path::new("sh");
        let res = find_command_path(osstr("/nonexistent-dir:/bin"), path);
        let found = res.expect("Expected to find 'sh' in /bin via PATH search");
        assert!(found.as_ref().ends_with("sh"));
        assert!(found.as_ref().starts_with("/bin"));
    }

    #[test]
    fn single_component_not_found_in_path() {
        let path = Path::new("nonexisting");
        let res = find_command_path(osstr("/bin"), path);
        assert!(res.is_none(), "Expected not to find 'nonexisting' in PATH");
    }

    #[test]
    fn directories_on_path_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sh")).unwrap();
        let search = format!("{}:/bin", tmp.path().display());
        let found = find_command_path(osstr(&search), Path::new("sh")).unwrap();
        assert!(found.as_ref().starts_with("/bin"));
    }

    #[test]
    #[serial]
    fn multiple_components_relative_existing() {
        let cwd_before = std::env::current_dir().expect("cwd");
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("bin")).expect("create temp bin dir");
        File::create(tmp.path().join("bin").join("sh")).expect("touch bin/sh");

        std::env::set_current_dir(tmp.path()).expect("set cwd");
        let res = find_command_path(osstr("/does/not/matter"), Path::new("bin/sh"))
            .map(|p| p.into_owned());
        // Restore cwd early to avoid interference even on failure
        std::env::set_current_dir(&cwd_before).ok();

        let found = res.expect("Expected to find relative 'bin/sh' in current dir");
        assert!(found.ends_with("bin/sh"));
    }

    #[test]
    #[serial]
    fn current_dir_with_dot_prefix() {
        let cwd_before = std::env::current_dir().expect("cwd");
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join("foo")).expect("touch foo");

        std::env::set_current_dir(tmp.path()).expect("set cwd");
        let res = find_command_path(osstr("/bin"), Path::new("./foo")).map(|p| p.into_owned());
        std::env::set_current_dir(&cwd_before).ok();

        assert_eq!(res.as_deref(), Some(Path::new("./foo")));
    }

    #[test]
    fn empty_path_is_none() {
        let res = find_command_path(osstr("/bin"), Path::new(""));
        assert!(res.is_none(), "Empty path should not resolve to anything");
    }
}
