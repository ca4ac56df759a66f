//! Unix daemonization and PID file handling
//!
//! The double fork must happen before the tokio runtime, any socket or the
//! tracing subscriber exists; `main` sequences those phases.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Detach from the controlling terminal via the classic double fork.
///
/// Returns in the grandchild; the intermediate processes `_exit`.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: single-threaded at this point; no runtime, no sockets, no
    // logger sinks exist yet.
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::signal(libc::SIGHUP, libc::SIG_IGN);

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        libc::umask(0);
    }

    std::env::set_current_dir("/")?;
    redirect_stdio()?;
    Ok(())
}

/// Point stdin/stdout/stderr at /dev/null so stray prints cannot hit a
/// closed terminal.
fn redirect_stdio() -> io::Result<()> {
    let devnull = File::options().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    // SAFETY: fd is a freshly opened /dev/null descriptor.
    unsafe {
        if libc::dup2(fd, libc::STDIN_FILENO) < 0
            || libc::dup2(fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(fd, libc::STDERR_FILENO) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Record the daemon's PID for service managers and test cleanup.
pub fn write_pidfile(path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// Best-effort removal at shutdown.
pub fn remove_pidfile(path: &Path) {
    let _ = std::fs::remove_file(path);
}
