//! Redirection of the three standard streams for the duration of one cycle.
//!
//! [`apply`] swaps the requested files into descriptors 0-2 and hands back a
//! [`SavedDescriptors`] that knows how to put the originals back. Dropping it
//! restores too, so no exit path leaks the interpreter's own descriptors.

use crate::command::{ExitCode, REDIRECT_FAILURE, RESTORE_FAILURE, RedirectionSpec, Stream};
use nix::fcntl::{FcntlArg, fcntl};
use nix::unistd;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Saved copies live above the range a user is likely to touch.
const SAVED_FD_FLOOR: RawFd = 10;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("cannot save {stream}: {source}")]
    Save { stream: Stream, source: nix::Error },
    #[error("{}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot redirect {stream}: {source}")]
    Replace { stream: Stream, source: nix::Error },
    #[error("cannot restore {stream}: {source}")]
    Restore { stream: Stream, source: nix::Error },
}

impl RedirectError {
    pub fn is_restore(&self) -> bool {
        matches!(self, RedirectError::Restore { .. })
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_restore() {
            RESTORE_FAILURE
        } else {
            REDIRECT_FAILURE
        }
    }
}

/// A close-on-exec duplicate of one standard descriptor, taken before it was replaced.
///
/// [`SavedFd::restore`] puts it back and releases the duplicate; if that never
/// happens, `Drop` does the same thing and logs any failure.
#[derive(Debug)]
pub struct SavedFd {
    stream: Stream,
    original: Option<OwnedFd>,
}

impl SavedFd {
    pub fn save(stream: Stream) -> nix::Result<Self> {
        let raw = fcntl(stream.fd(), FcntlArg::F_DUPFD_CLOEXEC(SAVED_FD_FLOOR))?;
        // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
        let original = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            stream,
            original: Some(original),
        })
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn restore(mut self) -> nix::Result<()> {
        self.restore_in_place()
    }

    fn restore_in_place(&mut self) -> nix::Result<()> {
        match self.original.take() {
            // dup2 closes whatever currently occupies the slot; dropping
            // `original` then releases the saved duplicate.
            Some(original) => unistd::dup2(original.as_raw_fd(), self.stream.fd()).map(drop),
            None => Ok(()),
        }
    }
}

impl Drop for SavedFd {
    fn drop(&mut self) {
        if let Err(e) = self.restore_in_place() {
            tracing::warn!("failed to restore {}: {e}", self.stream);
        }
    }
}

/// The three-slot table produced by [`apply`]; `None` marks an untouched stream.
#[derive(Debug, Default)]
pub struct SavedDescriptors {
    slots: [Option<SavedFd>; 3],
}

impl SavedDescriptors {
    #[cfg(test)]
    fn is_saved(&self, stream: Stream) -> bool {
        self.slots[stream as usize].is_some()
    }

    /// Put every saved descriptor back, in stream order.
    ///
    /// All slots are attempted even after a failure; the first error is returned.
    pub fn restore(mut self) -> Result<(), RedirectError> {
        let mut first_error = None;
        for slot in self.slots.iter_mut() {
            if let Some(saved) = slot.take() {
                let stream = saved.stream();
                if let Err(source) = saved.restore() {
                    first_error.get_or_insert(RedirectError::Restore { stream, source });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn open_for(stream: Stream, path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    match stream {
        Stream::Input => options.read(true),
        Stream::Output | Stream::Error => options.write(true).create(true).truncate(true).mode(0o666),
    };
    options.open(path)
}

/// Make `replacement` the new occupant of `stream`'s slot.
///
/// The opened descriptor is released once it has been duplicated into place.
fn replace(stream: Stream, replacement: OwnedFd) -> nix::Result<()> {
    unistd::dup2(replacement.as_raw_fd(), stream.fd())?;
    drop(replacement);
    Ok(())
}

fn apply_stream(
    saved: &mut SavedDescriptors,
    stream: Stream,
    path: &Path,
) -> Result<(), RedirectError> {
    let slot = SavedFd::save(stream).map_err(|source| RedirectError::Save { stream, source })?;
    saved.slots[stream as usize] = Some(slot);
    let file = open_for(stream, path).map_err(|source| RedirectError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    replace(stream, OwnedFd::from(file)).map_err(|source| RedirectError::Replace { stream, source })?;
    tracing::debug!("{stream} redirected to {}", path.display());
    Ok(())
}

/// Bind each requested file to its standard stream.
///
/// Input files must exist; output and error files are created or truncated
/// with mode 0666 (before umask). On failure, whatever was already swapped is
/// restored before the error is returned; a failing restore takes precedence.
pub fn apply(spec: &RedirectionSpec) -> Result<SavedDescriptors, RedirectError> {
    let mut saved = SavedDescriptors::default();
    for stream in Stream::ALL {
        let Some(path) = spec.get(stream) else {
            continue;
        };
        if let Err(e) = apply_stream(&mut saved, stream, path) {
            saved.restore()?;
            return Err(e);
        }
    }
    Ok(saved)
}
