//! Shell core: scoped environments, command parsing, pipeline execution,
//! and cooperative process ticking.
//!
//! Everything runs on one thread. Each executed command line becomes a
//! [`RunningScript`]: a pseudo-terminal, a foreground pipeline, and a queue
//! of statements still to run. The host loop calls [`Shell::tick_scripts`]
//! once per frame; it pumps PTY and pipe output into the owning backlog,
//! advances every program one step, and starts queued pipelines as their
//! predecessors finish.

pub mod builtin;
pub mod error;
pub mod execute;
pub mod io;
pub mod local;
pub mod parse;
pub mod path;
pub mod tick;

pub use error::{Error, ParseError};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::SystemTime;

use core_backlog::{Backlog, EventKind};
use core_config::Config;
use core_pty::{PosixPty, Pty};
use tracing::{debug, info, warn};

use builtin::BuiltinKind;
use execute::{RunningLine, RunningProgram};
use local::{LocalId, Locals, Relationship};
use parse::{ParseNode, ParsedPipeline, ParsedProgram};

/// Backlogs are shared between the shell (producer) and the renderer
/// (consumer); the last owner dropping the handle releases the storage.
pub type SharedBacklog = Rc<RefCell<Backlog>>;

/// Construct a backlog configured for this shell.
pub fn new_backlog(id: u64, config: &Config) -> SharedBacklog {
    let mut backlog = Backlog::new(id, config.max_length());
    backlog.cr_clears_line = config.file.cr_clears_line;
    Rc::new(RefCell::new(backlog))
}

pub struct RunningScript {
    pub id: u64,
    pub pty: Box<dyn Pty>,
    pub scope: LocalId,
    pub backlog: SharedBacklog,
    pub fg: RunningLine,
    /// Statements waiting behind the foreground pipeline, each with the
    /// frame it should run under.
    pub queue: VecDeque<(ParsedPipeline, LocalId)>,
}

pub struct Shell {
    pub locals: Locals,
    pub root: LocalId,
    pub scripts: Vec<RunningScript>,
    next_script_id: u64,
    pub width: u16,
    pub height: u16,
}

impl Shell {
    pub fn new(width: u16, height: u16) -> Self {
        let (locals, root) = Locals::new();
        Self {
            locals,
            root,
            scripts: Vec::new(),
            next_script_id: 1,
            width,
            height,
        }
    }

    /// Seed the root frame from the host process: every inherited variable
    /// is set and exported, and the current directory starts the wd stack.
    pub fn import_environment(&mut self) {
        for (key, value) in std::env::vars() {
            self.locals.set_var(self.root, &key, &value);
            self.locals.make_env_var(self.root, &key);
        }
        if let Ok(wd) = std::env::current_dir() {
            self.locals.set_wd(self.root, &wd.display().to_string());
        }
    }

    pub fn lookup_script(&mut self, id: u64) -> Option<&mut RunningScript> {
        self.scripts.iter_mut().find(|script| script.id == id)
    }

    /// Parse and start one command line against the given backlog. Returns
    /// `false` when the line failed to parse or start; the failure is
    /// recorded on the backlog and the shell keeps running.
    pub fn run_script(&mut self, config: &Config, backlog: &SharedBacklog, text: &str) -> bool {
        let parsed = match parse::parse_line(&mut self.locals, self.root, text) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(target: "shell.exec", %error, "parse failed");
                record_failure(backlog, &error.to_string());
                return false;
            }
        };

        // Breadcrumbs the renderer anchors on: directory, echoed input,
        // then process output.
        {
            let wd = self.locals.get_wd(self.root).to_string();
            let mut b = backlog.borrow_mut();
            b.push_event(EventKind::StartDirectory);
            b.append_text(wd.as_bytes());
            b.push_event(EventKind::StartInput);
            b.append_text(text.as_bytes());
            b.append_text(b"\n");
            b.push_event(EventKind::StartProcess);
        }

        if parsed.pipelines.is_empty() {
            finalize(backlog, 0);
            return true;
        }

        let wide = cfg!(windows) && config.file.windows_wide_terminal;
        let pty = match PosixPty::create(self.width, self.height, wide) {
            Ok(pty) => Box::new(pty) as Box<dyn Pty>,
            Err(error) => {
                record_failure(backlog, &Error::Io(error).to_string());
                return false;
            }
        };

        let id = self.next_script_id;
        self.next_script_id += 1;

        let mut queue: VecDeque<(ParsedPipeline, LocalId)> = parsed
            .pipelines
            .into_iter()
            .map(|pipeline| (pipeline, self.root))
            .collect();

        match self.start_next_pipeline(config, backlog, &mut queue, id) {
            Ok(Some(fg)) => {
                info!(target: "shell.exec", id, "script started");
                self.scripts.push(RunningScript {
                    id,
                    pty,
                    scope: self.root,
                    backlog: backlog.clone(),
                    fg,
                    queue,
                });
                true
            }
            Ok(None) => {
                // The whole line was definitions or empty subshells.
                finalize(backlog, 0);
                true
            }
            Err(error) => {
                record_failure(backlog, &error.to_string());
                false
            }
        }
    }

    /// Pop queued statements until one yields a running pipeline. Function
    /// definitions register themselves; subshells and function calls expand
    /// into further queued statements under a child frame.
    fn start_next_pipeline(
        &mut self,
        config: &Config,
        backlog: &SharedBacklog,
        queue: &mut VecDeque<(ParsedPipeline, LocalId)>,
        id: u64,
    ) -> Result<Option<RunningLine>, Error> {
        while let Some((pipeline, scope)) = queue.pop_front() {
            if pipeline.programs.len() == 1 {
                match &pipeline.programs[0] {
                    ParsedProgram::FunctionDef { name, source, .. } => {
                        debug!(target: "shell.exec", name = %name, "function defined");
                        self.locals.set_function(
                            scope,
                            name,
                            Rc::new(ParseNode::Source(source.to_string())),
                        );
                        continue;
                    }
                    ParsedProgram::Subshell(inner) => {
                        let child = self.locals.push(scope, Relationship::Subshell);
                        for statement in inner.pipelines.iter().rev() {
                            queue.push_front((statement.clone(), child));
                        }
                        continue;
                    }
                    ParsedProgram::Command { words, .. } if !words.is_empty() => {
                        if let Some(node) = self.locals.get_function(scope, &words[0]) {
                            if let ParseNode::Source(source) = &*node {
                                let child = self.locals.push(scope, Relationship::Function);
                                self.locals.set_args(
                                    child,
                                    words.iter().map(|word| Rc::from(word.as_str())).collect(),
                                );
                                let body = parse::parse_line(&mut self.locals, child, source)?;
                                for statement in body.pipelines.into_iter().rev() {
                                    queue.push_front((statement, child));
                                }
                                continue;
                            }
                        }
                    }
                    _ => {}
                }
            } else {
                // Compound forms must stand alone in their pipeline stage.
                for program in &pipeline.programs {
                    let ParsedProgram::Command { words, .. } = program else {
                        return Err(Error::InvalidProgram(
                            "subshells and function definitions cannot join a pipeline"
                                .to_string(),
                        ));
                    };
                    if let Some(first) = words.first() {
                        if self.locals.get_function(scope, first).is_some() {
                            return Err(Error::InvalidProgram(format!(
                                "function {first} cannot join a pipeline"
                            )));
                        }
                    }
                }
            }

            let fg =
                execute::start_execute_line(&mut self.locals, scope, config, &pipeline, id, backlog)?;
            return Ok(Some(fg));
        }
        Ok(None)
    }

    /// One cooperative scheduler round over every running script.
    pub fn tick_scripts(&mut self, config: &Config) {
        let mut scripts = std::mem::take(&mut self.scripts);
        scripts.retain_mut(|script| self.tick_script(config, script));
        self.scripts = scripts;
    }

    fn tick_script(&mut self, config: &Config, script: &mut RunningScript) -> bool {
        // PTY output feeds the backlog directly.
        let mut buf = [0u8; 4096];
        loop {
            match script.pty.read_nonblocking(&mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    script.backlog.borrow_mut().append_text(&buf[..count]);
                }
                Err(error) => {
                    warn!(target: "shell.tick", %error, "pty read failed");
                    break;
                }
            }
        }

        drain_output(&mut script.fg, &script.backlog);

        // Tick every live program once.
        let count = script.fg.programs.len();
        for position in 0..count {
            let mut outcome = None;
            if let Some(program) = script.fg.programs[position].as_mut() {
                let mut exit_code = 0;
                let finished =
                    tick::tick_program(program, &mut self.locals, script.fg.scope, &mut exit_code);
                if finished {
                    let is_exit = matches!(
                        program,
                        RunningProgram::Builtin(b) if b.kind == BuiltinKind::Exit
                    );
                    outcome = Some((exit_code, is_exit));
                }
            }
            if let Some((exit_code, is_exit)) = outcome {
                if is_exit {
                    script.queue.clear();
                }
                if position + 1 == count {
                    script.fg.exit_code = exit_code;
                }
                // Dropping the program closes its descriptors; downstream
                // reads see EOF.
                script.fg.programs[position] = None;
            }
        }

        if !script.fg.finished() {
            return true;
        }

        // Everything in the foreground pipeline is done: collect the last
        // bytes, then either start the next statement or finish the script.
        drain_output(&mut script.fg, &script.backlog);
        script.fg.input = None;
        let last_exit = script.fg.exit_code;

        match self.start_next_pipeline(config, &script.backlog, &mut script.queue, script.id) {
            Ok(Some(fg)) => {
                script.fg = fg;
                true
            }
            Ok(None) => {
                debug!(target: "shell.tick", id = script.id, exit_code = last_exit, "script finished");
                finalize(&script.backlog, last_exit);
                false
            }
            Err(error) => {
                record_failure(&script.backlog, &error.to_string());
                false
            }
        }
    }

    /// Feed keyboard bytes to the head of the script's foreground pipeline.
    pub fn send_input(&mut self, id: u64, bytes: &[u8]) -> std::io::Result<usize> {
        match self.lookup_script(id) {
            Some(script) => match &script.fg.input {
                Some(input) => {
                    let mut input = input;
                    input.write(bytes)
                }
                None => Ok(0),
            },
            None => Ok(0),
        }
    }

    /// Cancel a script: kill its children, sever builtin outputs (their next
    /// tick finalizes), and mark the backlog cancelled without truncation.
    pub fn cancel_script(&mut self, id: u64) {
        let Some(script) = self.scripts.iter_mut().find(|script| script.id == id) else {
            return;
        };
        script.queue.clear();
        script.fg.input = None;
        for program in script.fg.programs.iter_mut().flatten() {
            match program {
                RunningProgram::Process(child) => {
                    let _ = child.kill();
                }
                RunningProgram::Builtin(builtin) => {
                    builtin.stdin = None;
                    builtin.stdout.close();
                    builtin.stderr.close();
                }
            }
        }
        script.backlog.borrow_mut().cancelled = true;
        info!(target: "shell.exec", id, "script cancelled");
    }
}

/// Pull pending pipeline output into the backlog, CRLF-normalized. Once the
/// read end reports EOF the descriptor is dropped.
fn drain_output(fg: &mut RunningLine, backlog: &SharedBacklog) {
    let Some(output) = fg.output.as_mut() else {
        return;
    };
    let mut buf = [0u8; 4096];
    let mut eof = false;
    loop {
        match output.read(&mut buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(count) => {
                let mut normalized = Vec::with_capacity(count + 1);
                fg.carry.normalize(&buf[..count], &mut normalized);
                backlog.borrow_mut().append_text(&normalized);
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => {
                eof = true;
                break;
            }
        }
    }
    if eof {
        let mut tail = Vec::new();
        fg.carry.finish(&mut tail);
        if !tail.is_empty() {
            backlog.borrow_mut().append_text(&tail);
        }
        fg.output = None;
    }
}

fn finalize(backlog: &SharedBacklog, exit_code: i32) {
    let mut b = backlog.borrow_mut();
    b.exit_code = exit_code;
    b.done = true;
    b.end = Some(SystemTime::now());
}

fn record_failure(backlog: &SharedBacklog, message: &str) {
    let mut b = backlog.borrow_mut();
    b.append_text(format!("tesh: {message}\n").as_bytes());
    b.exit_code = 1;
    b.done = true;
    b.end = Some(SystemTime::now());
}
