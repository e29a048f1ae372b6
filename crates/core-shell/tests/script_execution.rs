//! End-to-end script execution through the cooperative scheduler.

use std::time::{Duration, Instant};

use core_backlog::EventKind;
use core_config::{Config, ConfigFile};
use core_shell::{Shell, SharedBacklog, new_backlog};

fn config() -> Config {
    let file = ConfigFile {
        builtin_level: 2,
        ..ConfigFile::default()
    };
    Config::from_file(file)
}

fn shell() -> Shell {
    Shell::new(100, 100)
}

/// Run one command line to completion; panics if it never finishes.
fn run(shell: &mut Shell, config: &Config, text: &str) -> SharedBacklog {
    let backlog = new_backlog(0, config);
    shell.run_script(config, &backlog, text);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !shell.scripts.is_empty() {
        shell.tick_scripts(config);
        assert!(Instant::now() < deadline, "script did not finish: {text}");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(backlog.borrow().done);
    backlog
}

fn text_of(backlog: &SharedBacklog) -> String {
    String::from_utf8_lossy(&backlog.borrow().to_vec()).into_owned()
}

#[test]
fn echo_hi_lands_in_backlog() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "echo hi");
    assert!(text_of(&backlog).ends_with("hi\n"));
    assert_eq!(backlog.borrow().exit_code, 0);

    // The breadcrumb events bracket directory, echoed input, and output.
    let events = &backlog.borrow().events;
    assert!(events.iter().any(|e| e.kind == EventKind::StartDirectory));
    assert!(events.iter().any(|e| e.kind == EventKind::StartInput));
    assert!(events.iter().any(|e| e.kind == EventKind::StartProcess));
}

#[test]
fn pipeline_feeds_builtin_to_builtin() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "echo hello there | cat");
    assert!(text_of(&backlog).ends_with("hello there\n"));
    assert_eq!(backlog.borrow().exit_code, 0);
}

#[test]
fn statements_run_in_order() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "echo first; echo second");
    let text = text_of(&backlog);
    let first = text.find("first\n").expect("first statement output");
    let second = text.find("second\n").expect("second statement output");
    assert!(first < second);
}

#[test]
fn parse_failure_is_recorded_not_fatal() {
    let config = config();
    let mut shell = shell();
    let backlog = new_backlog(0, &config);
    assert!(!shell.run_script(&config, &backlog, "echo 'unterminated"));
    assert!(shell.scripts.is_empty());
    {
        let b = backlog.borrow();
        assert!(b.done);
        assert_eq!(b.exit_code, 1);
    }
    assert!(text_of(&backlog).contains("unterminated string"));

    // The shell keeps working afterwards.
    let backlog = run(&mut shell, &config, "echo still alive");
    assert!(text_of(&backlog).ends_with("still alive\n"));
}

#[test]
fn exit_codes_propagate() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "false");
    assert_eq!(backlog.borrow().exit_code, 1);

    let backlog = run(&mut shell, &config, "exit 4");
    assert_eq!(backlog.borrow().exit_code, 4);
}

#[test]
fn exit_skips_queued_statements() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "exit 3; echo after");
    assert_eq!(backlog.borrow().exit_code, 3);
    assert!(!text_of(&backlog).contains("after\n"));
}

#[test]
fn exported_variables_expand_in_later_scripts() {
    let config = config();
    let mut shell = shell();
    run(&mut shell, &config, "export GREETING=hello");
    let backlog = run(&mut shell, &config, "echo $GREETING world");
    assert!(text_of(&backlog).ends_with("hello world\n"));
}

#[test]
fn functions_receive_positional_arguments() {
    let config = config();
    let mut shell = shell();
    run(&mut shell, &config, "greet() { echo hi $1 }");
    let backlog = run(&mut shell, &config, "greet bob");
    assert!(text_of(&backlog).ends_with("hi bob\n"));
}

#[test]
fn function_runs_while_its_alias_is_suppressed() {
    let config = config();
    let mut shell = shell();
    run(&mut shell, &config, "greet() { echo from function }");
    run(&mut shell, &config, "alias greet='greet loudly'");

    // Expanding `greet` blocks the alias for the nested lookup, which then
    // resolves the function of the same name; the alias applies once and
    // the function receives the alias-provided argument.
    let backlog = run(&mut shell, &config, "greet");
    assert!(text_of(&backlog).ends_with("from function\n"));
    assert_eq!(backlog.borrow().exit_code, 0);
}

#[test]
fn subshell_statements_run_under_child_frame() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "(echo inner); echo outer");
    let text = text_of(&backlog);
    let inner = text.find("inner\n").expect("subshell output");
    let outer = text.find("outer\n").expect("outer output");
    assert!(inner < outer);

    // cd inside a subshell does not leak into the root frame.
    let dir = tempfile::tempdir().unwrap();
    let before = shell.locals.get_wd(shell.root).to_string();
    run(
        &mut shell,
        &config,
        &format!("(cd {})", dir.path().display()),
    );
    assert_eq!(shell.locals.get_wd(shell.root), before);
}

#[test]
fn external_processes_run_and_report_exit() {
    let config = config();
    let mut shell = shell();
    let backlog = run(&mut shell, &config, "/bin/echo external");
    assert!(text_of(&backlog).ends_with("external\n"));

    shell.locals.set_var(shell.root, "PATH", "/bin:/usr/bin");
    shell.locals.make_env_var(shell.root, "PATH");
    let backlog = run(&mut shell, &config, "sh -c 'exit 7'");
    assert_eq!(backlog.borrow().exit_code, 7);
}

#[test]
fn unknown_program_reports_invalid() {
    let config = config();
    let mut shell = shell();
    let backlog = new_backlog(0, &config);
    assert!(!shell.run_script(&config, &backlog, "definitely-not-here"));
    assert_eq!(backlog.borrow().exit_code, 1);
    assert!(text_of(&backlog).contains("invalid program"));
}

#[test]
fn output_redirection_writes_file() {
    let config = config();
    let mut shell = shell();
    let dir = tempfile::tempdir().unwrap();
    shell
        .locals
        .set_wd(shell.root, &dir.path().display().to_string());

    run(&mut shell, &config, "echo data > out.txt");
    let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(written, "data\n");

    let backlog = run(&mut shell, &config, "cat < out.txt");
    assert!(text_of(&backlog).ends_with("data\n"));
}

#[test]
fn cancel_kills_children_and_marks_backlog() {
    let config = config();
    let mut shell = shell();
    let backlog = new_backlog(0, &config);
    assert!(shell.run_script(&config, &backlog, "/bin/sh -c 'while true; do :; done'"));
    let id = shell.scripts[0].id;

    shell.tick_scripts(&config);
    shell.cancel_script(id);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !shell.scripts.is_empty() {
        shell.tick_scripts(&config);
        assert!(Instant::now() < deadline, "cancelled script did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }

    let b = backlog.borrow();
    assert!(b.cancelled);
    assert!(b.done);
    assert_ne!(b.exit_code, 0);
}

#[test]
fn keyboard_input_reaches_head_program() {
    let config = config();
    let mut shell = shell();
    let backlog = new_backlog(0, &config);
    assert!(shell.run_script(&config, &backlog, "cat"));
    let id = shell.scripts[0].id;

    shell.send_input(id, b"typed line\n").unwrap();
    for _ in 0..20 {
        shell.tick_scripts(&config);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(text_of(&backlog).ends_with("typed line\n"));

    // Closing stdin lets cat finish.
    shell.cancel_script(id);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !shell.scripts.is_empty() {
        shell.tick_scripts(&config);
        assert!(Instant::now() < deadline, "cat did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
}
