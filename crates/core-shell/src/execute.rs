//! Pipeline construction: parsed programs become running programs.
//!
//! For a pipeline of N programs two pipes bracket the whole line: one feeds
//! keyboard bytes to program 0, one collects tail output for the backlog.
//! stderr of every program is merged into the tail. Middle programs are
//! joined stdout-to-stdin with fresh pipes. Each program is either a
//! builtin (in-process state machine) or a spawned child process.
//!
//! When startup fails partway the already-spawned children are killed and
//! every pipe closes on drop, so nothing leaks out of the error path.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::process::{Child, Command, Stdio};
use std::rc::Rc;

use core_config::Config;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::debug;

use crate::SharedBacklog;
use crate::builtin::{self, RunningBuiltin};
use crate::error::Error;
use crate::io::{CrCarry, ProcessOutput};
use crate::local::{LocalId, Locals};
use crate::parse::{ParsedPipeline, ParsedProgram};
use crate::path::find_in_path;

#[derive(Debug)]
pub enum RunningProgram {
    Process(Child),
    Builtin(RunningBuiltin),
}

/// One running pipeline. `programs` slots turn `None` as they finish so
/// their file descriptors close and EOF propagates downstream.
#[derive(Debug)]
pub struct RunningLine {
    pub id: u64,
    pub scope: LocalId,
    pub programs: Vec<Option<RunningProgram>>,
    /// Write end feeding keyboard bytes to program 0.
    pub input: Option<File>,
    /// Non-blocking read end the scheduler drains into the backlog.
    pub output: Option<File>,
    pub carry: CrCarry,
    /// Exit code of the tail program once it finishes.
    pub exit_code: i32,
}

impl RunningLine {
    pub fn finished(&self) -> bool {
        self.programs.iter().all(Option::is_none)
    }
}

fn make_pipe() -> io::Result<(File, File)> {
    let (read, write) = nix::unistd::pipe()?;
    Ok((File::from(read), File::from(write)))
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Build and start a pipeline: line-in pipe, line-out pipe, then each
/// program position with its stdin/stdout decision.
pub fn start_execute_line(
    locals: &mut Locals,
    scope: LocalId,
    config: &Config,
    line: &ParsedPipeline,
    id: u64,
    backlog: &SharedBacklog,
) -> Result<RunningLine, Error> {
    debug_assert!(!line.programs.is_empty());

    let (line_in_read, line_in_write) = make_pipe()?;
    let (line_out_read, line_out_write) = make_pipe()?;
    set_nonblocking(&line_out_read)?;
    let line_out_write = Rc::new(line_out_write);

    let mut programs: Vec<Option<RunningProgram>> = Vec::with_capacity(line.programs.len());
    if let Err(error) = spawn_programs(
        locals,
        scope,
        config,
        line,
        backlog,
        line_in_read,
        &line_out_write,
        &mut programs,
    ) {
        // Tear down whatever was already started.
        for program in programs.iter_mut().flatten() {
            if let RunningProgram::Process(child) = program {
                let _ = child.kill();
            }
        }
        return Err(error);
    }

    debug!(target: "shell.exec", id, programs = programs.len(), "pipeline started");
    Ok(RunningLine {
        id,
        scope,
        programs,
        input: Some(line_in_write),
        output: Some(line_out_read),
        carry: CrCarry::default(),
        exit_code: 0,
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_programs(
    locals: &mut Locals,
    scope: LocalId,
    config: &Config,
    line: &ParsedPipeline,
    backlog: &SharedBacklog,
    line_in_read: File,
    line_out_write: &Rc<File>,
    programs: &mut Vec<Option<RunningProgram>>,
) -> Result<(), Error> {
    let count = line.programs.len();
    let mut next_stdin = Some(line_in_read);

    for (position, program) in line.programs.iter().enumerate() {
        let ParsedProgram::Command {
            words,
            redirect_in,
            redirect_out,
        } = program
        else {
            return Err(Error::InvalidProgram(
                "only simple commands can join a pipeline".to_string(),
            ));
        };
        if words.is_empty() {
            return Err(Error::InvalidProgram("empty program".to_string()));
        }

        let last = position + 1 == count;

        let mut stdin_file = next_stdin.take().ok_or_else(|| {
            Error::Io(io::Error::other("pipeline stdin already consumed"))
        })?;
        if let Some(path) = redirect_in {
            stdin_file = File::open(resolve(locals, scope, path))?;
        }

        // Middle programs write into the next pipe; the tail writes to the
        // line output (or its redirect target).
        let mut middle_out: Option<File> = None;
        if !last {
            let (read, write) = make_pipe()?;
            next_stdin = Some(read);
            middle_out = Some(write);
        }

        let running = match builtin::lookup(&words[0], config.builtin_level()) {
            Some(kind) => {
                set_nonblocking(&stdin_file)?;
                let stdout = if let Some(out) = middle_out {
                    ProcessOutput::File(Rc::new(out))
                } else if let Some(path) = redirect_out {
                    ProcessOutput::File(Rc::new(File::create(resolve(locals, scope, path))?))
                } else {
                    // Tail builtins append straight to the backlog.
                    ProcessOutput::Backlog(backlog.clone())
                };
                let stderr = ProcessOutput::File(line_out_write.clone());
                RunningProgram::Builtin(RunningBuiltin::new(
                    kind,
                    words.clone(),
                    Some(stdin_file),
                    stdout,
                    stderr,
                    config.builtin_level(),
                ))
            }
            None => {
                let full_path = find_in_path(locals, scope, &words[0])
                    .ok_or_else(|| Error::InvalidProgram(words[0].clone()))?;

                let stdout: Stdio = if let Some(out) = middle_out {
                    Stdio::from(out)
                } else if let Some(path) = redirect_out {
                    Stdio::from(File::create(resolve(locals, scope, path))?)
                } else {
                    Stdio::from(line_out_write.try_clone()?)
                };

                let mut command = Command::new(&full_path);
                command
                    .args(&words[1..])
                    .stdin(Stdio::from(stdin_file))
                    .stdout(stdout)
                    .stderr(Stdio::from(line_out_write.try_clone()?))
                    .env_clear()
                    .envs(locals.exported_env(scope));
                let wd = locals.get_wd(scope);
                if !wd.is_empty() {
                    command.current_dir(wd);
                }

                let child = command.spawn()?;
                debug!(target: "shell.exec", program = %full_path.display(), pid = child.id(), "spawned");
                RunningProgram::Process(child)
            }
        };

        programs.push(Some(running));
    }

    Ok(())
}

fn resolve(locals: &Locals, scope: LocalId, path: &str) -> std::path::PathBuf {
    let target = std::path::Path::new(path);
    let wd = locals.get_wd(scope);
    if target.is_absolute() || wd.is_empty() {
        target.to_path_buf()
    } else {
        std::path::Path::new(wd).join(target)
    }
}
