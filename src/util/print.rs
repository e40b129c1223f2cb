use std::fmt;

use libc::c_int;

/// A `fmt::Write` sink straight onto a file descriptor. Formatting through it
/// never touches the allocator, so it is safe to use from inside one.
pub struct RawFd(c_int);

impl RawFd {
    pub const fn stdout() -> Self {
        Self(libc::STDOUT_FILENO)
    }

    pub const fn stderr() -> Self {
        Self(libc::STDERR_FILENO)
    }
}

impl fmt::Write for RawFd {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut buf = s.as_bytes();
        while !buf.is_empty() {
            // SAFETY: `buf` is a live, initialized byte slice for the whole call
            let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
            if n < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(fmt::Error);
            }
            if n == 0 {
                return Err(fmt::Error);
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }
}

/// Report a broken invariant and abort the process, without allocating.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    use fmt::Write;
    let _ = writeln!(RawFd::stderr(), "memtrace: fatal: {args}");
    std::process::abort()
}
