//! Small process-related helpers shared across the workspace.
//!
//! - [`NoWindowExt`] keeps spawned tools from flashing a console window on Windows.
//! - [`ProcessGroupExt`] places a child in its own process group on Unix.
//! - [`kill_tree`] terminates a process together with everything it spawned.

use std::ffi::OsStr;

#[cfg(feature = "tree-kill")]
mod tree;

#[cfg(feature = "tree-kill")]
pub use tree::{descendants_of, kill_tree};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

/// Detach a child into a fresh process group so signals aimed at the
/// capture tree do not reach the supervising process.
///
/// On non-Unix targets this is a no-op.
pub trait ProcessGroupExt {
    fn own_process_group(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl ProcessGroupExt for std::process::Command {
    fn own_process_group(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            self.process_group(0);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl ProcessGroupExt for tokio::process::Command {
    fn own_process_group(&mut self) {
        #[cfg(unix)]
        {
            self.process_group(0);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}
