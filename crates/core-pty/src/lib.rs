//! Pseudo-terminal backend abstraction and POSIX implementation.
//!
//! The shell talks to the terminal through the [`Pty`] trait so platform
//! differences stay behind one seam. The POSIX backend owns the
//! `openpty(3)` pair: the master side is non-blocking and polled by the
//! cooperative scheduler; the slave side is handed to child processes as
//! their controlling stdio.
//!
//! The "wide terminal" mode (clamping the column count to a large constant
//! so the host PTY never wraps long lines) is a configuration behavior, not
//! a platform fork.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::termios::{LocalFlags, SetArg, Termios, tcgetattr, tcsetattr};
use tracing::{debug, trace};

/// Column count used when wide-terminal mode is on: wide enough that the
/// host PTY never soft-wraps program output.
pub const WIDE_TERMINAL_COLUMNS: u16 = 10000;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// The seam between the shell and the platform terminal.
pub trait Pty {
    /// Change the logical window size.
    fn resize(&mut self, width: u16, height: u16) -> io::Result<()>;

    /// Feed keyboard bytes to the child. Echo is disabled first so typed
    /// input is not rendered twice (the prompt already shows it).
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Pull whatever output bytes are ready without blocking. `Ok(0)` means
    /// nothing is available right now (or the child side is gone).
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// A stdio handle for attaching a spawned child to this terminal.
    fn child_stdio(&self) -> io::Result<Stdio>;
}

pub struct PosixPty {
    master: OwnedFd,
    slave: OwnedFd,
    wide: bool,
}

impl PosixPty {
    /// Open a PTY pair with the given logical size. The master is marked
    /// non-blocking and non-inheritable.
    pub fn create(width: u16, height: u16, wide: bool) -> io::Result<Self> {
        let size = winsize(effective_width(width, wide), height);
        let pair = openpty(&size, None::<&Termios>)?;

        fcntl(pair.master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        fcntl(pair.master.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        debug!(target: "pty", master = pair.master.as_raw_fd(), width, height, wide, "pty created");
        Ok(Self {
            master: pair.master,
            slave: pair.slave,
            wide,
        })
    }

    fn disable_echo(&self) -> nix::Result<()> {
        let mut termios = tcgetattr(&self.slave)?;
        termios.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&self.slave, SetArg::TCSANOW, &termios)
    }
}

impl Pty for PosixPty {
    fn resize(&mut self, width: u16, height: u16) -> io::Result<()> {
        let size = winsize(effective_width(width, self.wide), height);
        // SAFETY: the slave fd is owned and open; TIOCSWINSZ reads the
        // winsize struct for the duration of the call only.
        unsafe { tiocswinsz(self.slave.as_raw_fd(), &size) }?;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        // Disable echo so we can print stdin in a different color.
        let _ = self.disable_echo();
        Ok(nix::unistd::write(&self.master, bytes)?)
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match nix::unistd::read(self.master.as_raw_fd(), buf) {
            Ok(count) => {
                if count > 0 {
                    trace!(target: "pty", count, "pty read");
                }
                Ok(count)
            }
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            // The slave side hung up: no more output will come.
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(errno) => Err(errno.into()),
        }
    }

    fn child_stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::from(File::from(self.slave.try_clone()?)))
    }
}

fn effective_width(width: u16, wide: bool) -> u16 {
    if wide { WIDE_TERMINAL_COLUMNS } else { width }
}

fn winsize(width: u16, height: u16) -> Winsize {
    Winsize {
        ws_row: height,
        ws_col: width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}
