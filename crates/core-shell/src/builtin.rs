//! Builtin programs as resumable state machines.
//!
//! A builtin is ticked by the cooperative scheduler like any other program:
//! each tick makes whatever progress the output will accept and yields.
//! `echo` keeps an `(outer, inner)` position into its argument list; `cat`
//! keeps the open source and its pending buffer slice. One-shot builtins
//! that produce text (`pwd`, `which`, `ls`, alias listing) prepare their
//! output once and then drain it through the shared [`BuiltinState::Dump`]
//! machinery, so a full pipe never blocks the scheduler round.
//!
//! Which names are builtin depends on the configured level: 0 is the bare
//! minimum the shell needs, 1 adds cheap conveniences, 2 shadows common
//! external tools.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::io::ProcessOutput;
use crate::local::{LocalId, Locals};
use crate::parse::ParseNode;
use crate::path::find_in_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Exit,
    Cd,
    Export,
    Unset,
    Alias,
    Echo,
    Pwd,
    Which,
    True,
    False,
    Cat,
    Ls,
}

const LEVEL_0: &[(&str, BuiltinKind)] = &[
    ("exit", BuiltinKind::Exit),
    ("cd", BuiltinKind::Cd),
    ("export", BuiltinKind::Export),
    ("unset", BuiltinKind::Unset),
    ("alias", BuiltinKind::Alias),
];

const LEVEL_1: &[(&str, BuiltinKind)] = &[
    ("echo", BuiltinKind::Echo),
    ("pwd", BuiltinKind::Pwd),
    ("which", BuiltinKind::Which),
    ("true", BuiltinKind::True),
    ("false", BuiltinKind::False),
];

const LEVEL_2: &[(&str, BuiltinKind)] = &[("cat", BuiltinKind::Cat), ("ls", BuiltinKind::Ls)];

/// Resolve a program word against the builtin tables at or below
/// `builtin_level`.
pub fn lookup(name: &str, builtin_level: u8) -> Option<BuiltinKind> {
    let levels: [&[(&str, BuiltinKind)]; 3] = [LEVEL_0, LEVEL_1, LEVEL_2];
    for level in levels.iter().take(builtin_level as usize + 1) {
        for (candidate, kind) in *level {
            if *candidate == name {
                return Some(*kind);
            }
        }
    }
    None
}

#[derive(Debug)]
pub struct CatState {
    next_arg: usize,
    file: Option<File>,
    reading_stdin: bool,
    buffer: Box<[u8; 4096]>,
    offset: usize,
    len: usize,
    exit: i32,
}

#[derive(Debug)]
pub struct DumpState {
    buffer: Vec<u8>,
    offset: usize,
    exit: i32,
}

#[derive(Debug)]
pub enum BuiltinState {
    /// Not started yet; the first tick runs the builtin.
    Simple,
    Echo { outer: usize, inner: usize },
    Cat(CatState),
    /// Draining prepared output.
    Dump(DumpState),
}

#[derive(Debug)]
pub struct RunningBuiltin {
    pub kind: BuiltinKind,
    /// argv, including the program word.
    pub args: Vec<String>,
    pub stdin: Option<File>,
    pub stdout: ProcessOutput,
    pub stderr: ProcessOutput,
    builtin_level: u8,
    state: BuiltinState,
}

impl RunningBuiltin {
    pub fn new(
        kind: BuiltinKind,
        args: Vec<String>,
        stdin: Option<File>,
        stdout: ProcessOutput,
        stderr: ProcessOutput,
        builtin_level: u8,
    ) -> Self {
        let state = match kind {
            BuiltinKind::Echo => BuiltinState::Echo { outer: 0, inner: 0 },
            BuiltinKind::Cat => BuiltinState::Cat(CatState {
                next_arg: 1,
                file: None,
                reading_stdin: false,
                buffer: Box::new([0u8; 4096]),
                offset: 0,
                len: 0,
                exit: 0,
            }),
            _ => BuiltinState::Simple,
        };
        Self {
            kind,
            args,
            stdin,
            stdout,
            stderr,
            builtin_level,
            state,
        }
    }

    /// One cooperative step. Returns `true` when the builtin has finished
    /// and `exit_code` is set.
    pub fn tick(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        match self.state {
            BuiltinState::Echo { .. } => self.tick_echo(exit_code),
            BuiltinState::Cat { .. } => self.tick_cat(locals, scope, exit_code),
            BuiltinState::Dump { .. } => self.tick_dump(exit_code),
            BuiltinState::Simple => self.tick_simple(locals, scope, exit_code),
        }
    }

    fn tick_simple(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        match self.kind {
            BuiltinKind::Exit => {
                *exit_code = self
                    .args
                    .get(1)
                    .and_then(|arg| arg.parse().ok())
                    .unwrap_or(0);
                true
            }
            BuiltinKind::True => {
                *exit_code = 0;
                true
            }
            BuiltinKind::False => {
                *exit_code = 1;
                true
            }
            BuiltinKind::Cd => self.run_cd(locals, scope, exit_code),
            BuiltinKind::Export => {
                for arg in &self.args[1..] {
                    match arg.split_once('=') {
                        Some((key, value)) => {
                            locals.set_var(scope, key, value);
                            locals.make_env_var(scope, key);
                        }
                        None => locals.make_env_var(scope, arg),
                    }
                }
                *exit_code = 0;
                true
            }
            BuiltinKind::Unset => {
                for arg in &self.args[1..] {
                    locals.unset_var(scope, arg);
                }
                *exit_code = 0;
                true
            }
            BuiltinKind::Alias => self.run_alias(locals, scope, exit_code),
            BuiltinKind::Pwd => {
                let mut buffer = locals.get_wd(scope).as_bytes().to_vec();
                buffer.push(b'\n');
                self.state = BuiltinState::Dump(DumpState {
                    buffer,
                    offset: 0,
                    exit: 0,
                });
                self.tick_dump(exit_code)
            }
            BuiltinKind::Which => self.run_which(locals, scope, exit_code),
            BuiltinKind::Ls => self.run_ls(locals, scope, exit_code),
            BuiltinKind::Echo | BuiltinKind::Cat => {
                unreachable!("echo/cat start in their own states")
            }
        }
    }

    /// Write as much of `args[outer][inner..]` as the output accepts, then a
    /// space separator, then the terminating newline; yield whenever a write
    /// comes back short.
    fn tick_echo(&mut self, exit_code: &mut i32) -> bool {
        let BuiltinState::Echo { outer, inner } = &mut self.state else {
            unreachable!("state checked by tick");
        };

        let args = &self.args[1..];
        let mut result: io::Result<usize> = Ok(1);

        while *outer < args.len() {
            let arg = args[*outer].as_bytes();
            if *inner != arg.len() {
                result = self.stdout.write(&arg[*inner..]);
                let written = match &result {
                    Ok(count) if *count > 0 => *count,
                    _ => break,
                };
                *inner += written;
                if *inner != arg.len() {
                    break;
                }
            }

            if *outer + 1 < args.len() {
                result = self.stdout.write(b" ");
                match &result {
                    Ok(count) if *count > 0 => *inner = 0,
                    _ => break,
                }
            }
            *outer += 1;
        }

        if *outer == args.len() {
            result = self.stdout.write(b"\n");
        }

        match result {
            Ok(count) if count > 0 => {
                debug_assert_eq!(*outer, args.len());
                *exit_code = 0;
                true
            }
            Ok(_) => false,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => {
                // Output is gone; finalize like an EOF, not an error.
                *exit_code = 0;
                true
            }
        }
    }

    /// Flush pending buffer bytes, then refill from the current source: the
    /// named files in order, or stdin when no files were given.
    fn tick_cat(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        let wd = locals.get_wd(scope).to_string();
        let BuiltinState::Cat(state) = &mut self.state else {
            unreachable!("state checked by tick");
        };

        loop {
            if state.offset < state.len {
                match self.stdout.write(&state.buffer[state.offset..state.len]) {
                    Ok(count) if count > 0 => {
                        state.offset += count;
                        continue;
                    }
                    Ok(_) => return false,
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(_) => {
                        *exit_code = state.exit;
                        return true;
                    }
                }
            }

            if state.file.is_none() && !state.reading_stdin {
                if self.args.len() == 1 {
                    state.reading_stdin = true;
                } else if state.next_arg < self.args.len() {
                    let arg = &self.args[state.next_arg];
                    state.next_arg += 1;
                    let path = resolve_path(&wd, arg);
                    match File::open(&path) {
                        Ok(file) => state.file = Some(file),
                        Err(error) => {
                            let message = format!("cat: {arg}: {error}\n");
                            let _ = self.stderr.write(message.as_bytes());
                            state.exit = 1;
                        }
                    }
                    continue;
                } else {
                    *exit_code = state.exit;
                    return true;
                }
            }

            let read_result = if let Some(file) = &mut state.file {
                file.read(&mut state.buffer[..])
            } else if let Some(stdin) = &mut self.stdin {
                stdin.read(&mut state.buffer[..])
            } else {
                Ok(0)
            };

            match read_result {
                Ok(0) => {
                    if state.reading_stdin {
                        *exit_code = state.exit;
                        return true;
                    }
                    state.file = None;
                }
                Ok(count) => {
                    state.offset = 0;
                    state.len = count;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
                Err(error) => {
                    let message = format!("cat: {error}\n");
                    let _ = self.stderr.write(message.as_bytes());
                    state.exit = 1;
                    if state.reading_stdin {
                        *exit_code = state.exit;
                        return true;
                    }
                    state.file = None;
                }
            }
        }
    }

    fn tick_dump(&mut self, exit_code: &mut i32) -> bool {
        let BuiltinState::Dump(state) = &mut self.state else {
            unreachable!("state checked by tick");
        };

        while state.offset < state.buffer.len() {
            match self.stdout.write(&state.buffer[state.offset..]) {
                Ok(count) if count > 0 => state.offset += count,
                Ok(_) => return false,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => break,
            }
        }

        *exit_code = state.exit;
        true
    }

    fn run_cd(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        let target = match self.args.get(1) {
            Some(arg) => arg.clone(),
            None => locals
                .get_var(scope, "HOME")
                .map(|home| home.to_string())
                .unwrap_or_default(),
        };
        if target.is_empty() {
            let _ = self.stderr.write(b"cd: no directory\n");
            *exit_code = 1;
            return true;
        }

        let wd = locals.get_wd(scope).to_string();
        let path = resolve_path(&wd, &target);
        match path.canonicalize() {
            Ok(canonical) if canonical.is_dir() => {
                debug!(target: "shell.builtin", wd = %canonical.display(), "cd");
                locals.set_wd(scope, &canonical.display().to_string());
                *exit_code = 0;
            }
            _ => {
                let message = format!("cd: {target}: invalid path\n");
                let _ = self.stderr.write(message.as_bytes());
                *exit_code = 1;
            }
        }
        true
    }

    fn run_alias(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        if self.args.len() == 1 {
            let mut buffer = Vec::new();
            for (name, node) in locals.aliases(scope) {
                if let ParseNode::Words(words) = &*node {
                    buffer.extend_from_slice(
                        format!("alias {name}='{}'\n", words.join(" ")).as_bytes(),
                    );
                }
            }
            self.state = BuiltinState::Dump(DumpState {
                buffer,
                offset: 0,
                exit: 0,
            });
            return self.tick_dump(exit_code);
        }

        for arg in &self.args[1..] {
            match arg.split_once('=') {
                Some((name, value)) => {
                    let words: Vec<String> =
                        value.split_whitespace().map(str::to_string).collect();
                    locals.set_alias(scope, name, Rc::new(ParseNode::Words(words)));
                }
                None => {
                    let message = format!("alias: {arg}: expected name=value\n");
                    let _ = self.stderr.write(message.as_bytes());
                    *exit_code = 1;
                    return true;
                }
            }
        }
        *exit_code = 0;
        true
    }

    fn run_which(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        let mut buffer = Vec::new();
        let mut exit = 0;
        for arg in &self.args[1..] {
            if lookup(arg, self.builtin_level).is_some() {
                buffer.extend_from_slice(format!("{arg}: shell builtin\n").as_bytes());
            } else if let Some(path) = find_in_path(locals, scope, arg) {
                buffer.extend_from_slice(format!("{}\n", path.display()).as_bytes());
            } else {
                buffer.extend_from_slice(format!("{arg} not found\n").as_bytes());
                exit = 1;
            }
        }
        self.state = BuiltinState::Dump(DumpState {
            buffer,
            offset: 0,
            exit,
        });
        self.tick_dump(exit_code)
    }

    fn run_ls(&mut self, locals: &mut Locals, scope: LocalId, exit_code: &mut i32) -> bool {
        let wd = locals.get_wd(scope).to_string();
        let target = self.args.get(1).cloned().unwrap_or_else(|| ".".to_string());
        let path = resolve_path(&wd, &target);

        match std::fs::read_dir(&path) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                let mut buffer = Vec::new();
                for name in names {
                    buffer.extend_from_slice(name.as_bytes());
                    buffer.push(b'\n');
                }
                self.state = BuiltinState::Dump(DumpState {
                    buffer,
                    offset: 0,
                    exit: 0,
                });
                self.tick_dump(exit_code)
            }
            Err(error) => {
                let message = format!("ls: {target}: {error}\n");
                let _ = self.stderr.write(message.as_bytes());
                *exit_code = 1;
                true
            }
        }
    }
}

fn resolve_path(wd: &str, target: &str) -> PathBuf {
    let target_path = Path::new(target);
    if target_path.is_absolute() || wd.is_empty() {
        target_path.to_path_buf()
    } else {
        Path::new(wd).join(target_path)
    }
}
