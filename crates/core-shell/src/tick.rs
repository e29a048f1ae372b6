//! Cooperative program ticking.
//!
//! A tick never blocks: child processes are polled with `try_wait`, builtins
//! resume their state machines and yield on short writes. Downstream
//! termination needs no bookkeeping: when a program finishes its descriptors
//! close, the next program reads EOF, and the pipeline winds down naturally.

use crate::execute::RunningProgram;
use crate::local::{LocalId, Locals};

/// Advance one program by one step. Returns `true` when it finished and
/// `exit_code` was set.
pub fn tick_program(
    program: &mut RunningProgram,
    locals: &mut Locals,
    scope: LocalId,
    exit_code: &mut i32,
) -> bool {
    match program {
        RunningProgram::Process(child) => match child.try_wait() {
            Ok(Some(status)) => {
                *exit_code = status.code().unwrap_or(1);
                true
            }
            Ok(None) => false,
            Err(_) => {
                *exit_code = 1;
                true
            }
        },
        RunningProgram::Builtin(builtin) => builtin.tick(locals, scope, exit_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    #[test]
    fn process_tick_polls_to_completion() {
        let child = Command::new("/bin/sh")
            .args(["-c", "exit 5"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let mut program = RunningProgram::Process(child);
        let (mut locals, root) = Locals::new();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exit_code = -1;
        loop {
            if tick_program(&mut program, &mut locals, root, &mut exit_code) {
                break;
            }
            assert!(Instant::now() < deadline, "child never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(exit_code, 5);
    }
}
