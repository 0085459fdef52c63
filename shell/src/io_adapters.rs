use nix::errno::Errno;
use nix::unistd;
use std::io::{self, Read};
use std::os::fd::RawFd;

/// Unbuffered reader over a raw descriptor.
///
/// `std::io::Stdin` keeps its own buffer, which would swallow bytes that a
/// child process or the next pipeline stage is meant to see. Every `read`
/// here goes straight to the descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdReader {
    fd: RawFd,
}

impl FdReader {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Reader over whatever currently occupies descriptor 0.
    pub fn stdin() -> Self {
        Self::new(libc::STDIN_FILENO)
    }
}

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match unistd::read(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

/// Read a single line, one byte at a time, so nothing past the newline is consumed.
///
/// Returns `None` at end of input with nothing read. The trailing newline
/// (and a preceding carriage return) is stripped; invalid UTF-8 is replaced.
pub fn read_line(reader: &mut dyn Read) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    let mut saw_newline = false;
    loop {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => {
                saw_newline = true;
                break;
            }
            Ok(_) => line.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if line.is_empty() && !saw_newline {
        return Ok(None);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn reads_exactly_one_line() {
        let mut input = Cursor::new(b"first\nsecond\n".to_vec());
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("first"));
        assert_eq!(input.position(), 6);
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("second"));
        assert_eq!(read_line(&mut input).unwrap(), None);
    }

    #[test]
    fn blank_line_is_not_end_of_input() {
        let mut input = Cursor::new(b"\nlast".to_vec());
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some(""));
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("last"));
        assert_eq!(read_line(&mut input).unwrap(), None);
    }

    #[test]
    fn carriage_return_is_stripped() {
        let mut input = Cursor::new(b"dos line\r\n".to_vec());
        assert_eq!(read_line(&mut input).unwrap().as_deref(), Some("dos line"));
    }

    #[test]
    fn fd_reader_reads_pipe() {
        let (r, w) = unistd::pipe().unwrap();
        std::fs::File::from(w)
            .write_all(b"through the pipe\n")
            .unwrap();
        let mut reader = FdReader::new(r.as_raw_fd());
        assert_eq!(
            read_line(&mut reader).unwrap().as_deref(),
            Some("through the pipe")
        );
        assert_eq!(read_line(&mut reader).unwrap(), None);
    }
}
