//! Command-line parsing: words, expansion, pipelines.
//!
//! The contract the rest of the shell depends on: a line parses to a list of
//! pipelines; each pipeline is a list of programs; each program is a list of
//! word tokens with variable and alias expansion already applied. Blank
//! input parses to an empty line (a no-op, not an error).
//!
//! Grammar beyond simple pipelines: quoting (`'..'`, `".."`), `$NAME` /
//! `${NAME}` / positional expansion, `;` and newline statement separation,
//! `#` comments, `>` / `<` redirection, `( .. )` subshell statements, and
//! `name() { .. }` function definitions. Control constructs (`if`, loops)
//! are out of scope.

use std::rc::Rc;

use crate::error::ParseError;
use crate::local::{AliasOrFunction, LocalId, Locals};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedLine {
    pub pipelines: Vec<ParsedPipeline>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedPipeline {
    pub programs: Vec<ParsedProgram>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedProgram {
    Command {
        words: Vec<String>,
        redirect_in: Option<String>,
        redirect_out: Option<String>,
    },
    Subshell(ParsedLine),
    FunctionDef {
        name: String,
        /// Parsed at definition time to validate the declaration.
        body: Rc<ParsedLine>,
        /// Raw body text, re-parsed at invocation so positional arguments
        /// expand against the call's frame.
        source: Rc<str>,
    },
}

/// A stored parse tree node: alias values keep their replacement words,
/// function values keep their body source.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseNode {
    Words(Vec<String>),
    Source(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Eof,
    Paren,
    Brace,
}

#[derive(Debug, Default)]
struct PendingProgram {
    words: Vec<String>,
    redirect_in: Option<String>,
    redirect_out: Option<String>,
}

pub fn parse_line(
    locals: &mut Locals,
    scope: LocalId,
    text: &str,
) -> Result<ParsedLine, ParseError> {
    let mut parser = Parser {
        bytes: text.as_bytes(),
        index: 0,
        locals,
        scope,
    };
    parser.parse_statements(Terminator::Eof)
}

struct Parser<'a> {
    bytes: &'a [u8],
    index: usize,
    /// Mutable for the duration of alias expansion: the name being expanded
    /// is blocked on the frame so nested lookups cannot recurse into it.
    locals: &'a mut Locals,
    scope: LocalId,
}

fn is_blank(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

fn is_word_terminator(byte: u8) -> bool {
    is_blank(byte) || matches!(byte, b'|' | b';' | b'\n' | b'(' | b')' | b'>' | b'<')
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn bump(&mut self) {
        self.index += 1;
    }

    fn skip_blanks(&mut self) {
        while let Some(byte) = self.peek() {
            if !is_blank(byte) {
                break;
            }
            self.bump();
        }
    }

    fn parse_statements(&mut self, terminator: Terminator) -> Result<ParsedLine, ParseError> {
        let mut line = ParsedLine::default();
        let mut pipeline = ParsedPipeline::default();
        let mut program: Option<PendingProgram> = None;
        // The last program of the pipeline is already pushed (subshell or
        // function definition); a further bare word is an error.
        let mut program_closed = false;
        // A pipe was seen and the next program has not started yet.
        let mut pipe_pending = false;

        macro_rules! finish_statement {
            () => {{
                if let Some(pending) = program.take() {
                    pipeline.programs.push(self.finish_program(pending)?);
                } else if pipe_pending {
                    return Err(ParseError::UnterminatedProgram);
                }
                if !pipeline.programs.is_empty() {
                    line.pipelines.push(std::mem::take(&mut pipeline));
                }
                program_closed = false;
                pipe_pending = false;
            }};
        }

        loop {
            self.skip_blanks();
            match self.peek() {
                None => {
                    match terminator {
                        Terminator::Eof => {}
                        Terminator::Paren => return Err(ParseError::UnterminatedParen),
                        Terminator::Brace => {
                            return Err(ParseError::UnterminatedFunctionDeclaration);
                        }
                    }
                    finish_statement!();
                    return Ok(line);
                }

                Some(b'#') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }

                Some(b';') | Some(b'\n') => {
                    self.bump();
                    finish_statement!();
                }

                Some(b')') => {
                    if terminator == Terminator::Paren {
                        self.bump();
                        finish_statement!();
                        return Ok(line);
                    }
                    return Err(ParseError::StrayCloseParen);
                }

                Some(b'}') if terminator == Terminator::Brace => {
                    self.bump();
                    finish_statement!();
                    return Ok(line);
                }

                Some(b'|') => {
                    self.bump();
                    if let Some(pending) = program.take() {
                        pipeline.programs.push(self.finish_program(pending)?);
                    } else if !program_closed {
                        return Err(ParseError::EmptyProgram);
                    }
                    program_closed = false;
                    pipe_pending = true;
                }

                Some(b'(') => {
                    // `name() { .. }` — a function definition, if exactly one
                    // plain word is pending.
                    if let Some(mut pending) = program.take_if(|pending| {
                        pending.words.len() == 1
                            && pending.redirect_in.is_none()
                            && pending.redirect_out.is_none()
                    }) {
                        if let Some(name) = pending.words.pop() {
                            pipeline.programs.push(self.parse_function_def(name)?);
                            program_closed = true;
                            continue;
                        }
                    }
                    if program.is_some() || program_closed {
                        return Err(ParseError::ExpectedEndOfStatement);
                    }
                    self.bump();
                    let inner = self.parse_statements(Terminator::Paren)?;
                    pipeline.programs.push(ParsedProgram::Subshell(inner));
                    program_closed = true;
                }

                Some(b'>') => {
                    self.bump();
                    let target = self.parse_redirect_target()?;
                    program
                        .get_or_insert_with(PendingProgram::default)
                        .redirect_out = Some(target);
                }

                Some(b'<') => {
                    self.bump();
                    let target = self.parse_redirect_target()?;
                    program
                        .get_or_insert_with(PendingProgram::default)
                        .redirect_in = Some(target);
                }

                Some(_) => {
                    if program_closed {
                        return Err(ParseError::ExpectedEndOfStatement);
                    }
                    if let Some(word) = self.parse_word()? {
                        program
                            .get_or_insert_with(PendingProgram::default)
                            .words
                            .push(word);
                        pipe_pending = false;
                    }
                }
            }
        }
    }

    fn parse_redirect_target(&mut self) -> Result<String, ParseError> {
        self.skip_blanks();
        match self.parse_word()? {
            Some(word) => Ok(word),
            None => Err(ParseError::NothingToIndirect),
        }
    }

    /// `name() { body }` with the name already consumed; cursor on `(`.
    fn parse_function_def(&mut self, name: String) -> Result<ParsedProgram, ParseError> {
        self.bump(); // '('
        self.skip_blanks();
        if self.peek() != Some(b')') {
            return Err(ParseError::UnterminatedFunctionDeclaration);
        }
        self.bump();
        self.skip_blanks();
        if self.peek() != Some(b'{') {
            return Err(ParseError::UnterminatedFunctionDeclaration);
        }
        self.bump();
        let body_start = self.index;
        let body = self.parse_statements(Terminator::Brace)?;
        let body_end = self.index - 1; // just before the closing '}'
        let source = String::from_utf8_lossy(&self.bytes[body_start..body_end]).into_owned();
        Ok(ParsedProgram::FunctionDef {
            name,
            body: Rc::new(body),
            source: Rc::from(source),
        })
    }

    /// Parse one word with quoting and `$` expansion. Returns `None` when the
    /// cursor sits on a token instead of word content.
    fn parse_word(&mut self) -> Result<Option<String>, ParseError> {
        let mut word: Vec<u8> = Vec::new();
        let mut any = false;

        loop {
            match self.peek() {
                None => break,
                Some(byte) if is_word_terminator(byte) => break,

                Some(b'\'') => {
                    any = true;
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return Err(ParseError::UnterminatedString),
                            Some(b'\'') => {
                                self.bump();
                                break;
                            }
                            Some(byte) => {
                                word.push(byte);
                                self.bump();
                            }
                        }
                    }
                }

                Some(b'"') => {
                    any = true;
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return Err(ParseError::UnterminatedString),
                            Some(b'"') => {
                                self.bump();
                                break;
                            }
                            Some(b'$') => self.expand_dollar(&mut word)?,
                            Some(b'\\') => {
                                self.bump();
                                match self.peek() {
                                    Some(byte) => {
                                        word.push(byte);
                                        self.bump();
                                    }
                                    None => return Err(ParseError::UnterminatedString),
                                }
                            }
                            Some(byte) => {
                                word.push(byte);
                                self.bump();
                            }
                        }
                    }
                }

                Some(b'$') => {
                    any = true;
                    self.expand_dollar(&mut word)?;
                }

                Some(b'\\') => {
                    any = true;
                    self.bump();
                    if let Some(byte) = self.peek() {
                        word.push(byte);
                        self.bump();
                    }
                }

                Some(byte) => {
                    any = true;
                    word.push(byte);
                    self.bump();
                }
            }
        }

        if any {
            Ok(Some(String::from_utf8_lossy(&word).into_owned()))
        } else {
            Ok(None)
        }
    }

    /// Expand `$NAME`, `${NAME}`, `$0`..`$9`, `$#`, `$@`. A lone `$` stays
    /// literal. Expanded content is not re-split into words.
    fn expand_dollar(&mut self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        self.bump(); // '$'
        match self.peek() {
            Some(b'{') => {
                self.bump();
                let mut name: Vec<u8> = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(ParseError::UnterminatedVariable),
                        Some(b'}') => {
                            self.bump();
                            break;
                        }
                        Some(byte) => {
                            name.push(byte);
                            self.bump();
                        }
                    }
                }
                self.push_var(&String::from_utf8_lossy(&name), out);
            }
            Some(byte) if byte == b'_' || byte.is_ascii_alphabetic() => {
                let mut name: Vec<u8> = Vec::new();
                while let Some(byte) = self.peek() {
                    if byte == b'_' || byte.is_ascii_alphanumeric() {
                        name.push(byte);
                        self.bump();
                    } else {
                        break;
                    }
                }
                self.push_var(&String::from_utf8_lossy(&name), out);
            }
            Some(byte) if byte.is_ascii_digit() => {
                self.bump();
                let n = (byte - b'0') as usize;
                if let Some(arg) = self.locals.args(self.scope).get(n) {
                    out.extend_from_slice(arg.as_bytes());
                }
            }
            Some(b'#') => {
                self.bump();
                let count = self.locals.args(self.scope).len().saturating_sub(1);
                out.extend_from_slice(count.to_string().as_bytes());
            }
            Some(b'@') => {
                self.bump();
                let args = self.locals.args(self.scope);
                for (i, arg) in args.iter().skip(1).enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    out.extend_from_slice(arg.as_bytes());
                }
            }
            _ => out.push(b'$'),
        }
        Ok(())
    }

    fn push_var(&self, name: &str, out: &mut Vec<u8>) {
        if let Some(value) = self.locals.get_var(self.scope, name) {
            out.extend_from_slice(value.as_bytes());
        }
    }

    /// Close a pending program: expand the leading alias, repeatedly. While
    /// `foo` is being expanded the frame's blocked alias suppresses `foo`
    /// from further alias lookup (a function of the same name still
    /// resolves), so a self-referential alias expands exactly once. A local
    /// seen set additionally stops multi-name cycles, which outrun the
    /// single blocked slot.
    fn finish_program(&mut self, pending: PendingProgram) -> Result<ParsedProgram, ParseError> {
        let PendingProgram {
            mut words,
            redirect_in,
            redirect_out,
        } = pending;

        if words.is_empty() {
            // Redirects with no program to indirect.
            return Err(ParseError::NothingToIndirect);
        }

        let mut seen: Vec<String> = Vec::new();
        while let Some(first) = words.first().cloned() {
            let Some(AliasOrFunction::Alias(node)) =
                self.locals.get_alias_or_function(self.scope, &first, &first)
            else {
                break;
            };
            let ParseNode::Words(alias_words) = &*node else {
                break;
            };
            if seen.iter().any(|name| *name == first) {
                break;
            }
            let rest = words.split_off(1);
            words = alias_words.clone();
            words.extend(rest);
            seen.push(first.clone());
            self.locals.set_blocked_alias(self.scope, Some(&first));
        }
        self.locals.set_blocked_alias(self.scope, None);

        Ok(ParsedProgram::Command {
            words,
            redirect_in,
            redirect_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::Relationship;

    fn parse(text: &str) -> Result<ParsedLine, ParseError> {
        let (mut locals, root) = Locals::new();
        parse_line(&mut locals, root, text)
    }

    fn command_words(program: &ParsedProgram) -> &Vec<String> {
        match program {
            ParsedProgram::Command { words, .. } => words,
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn empty_line() {
        let line = parse("").unwrap();
        assert!(line.pipelines.is_empty());
        let line = parse("   \n  ; ").unwrap();
        assert!(line.pipelines.is_empty());
    }

    #[test]
    fn one_word() {
        let line = parse("abc").unwrap();
        assert_eq!(line.pipelines.len(), 1);
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["abc".to_string()]
        );
    }

    #[test]
    fn two_words_with_whitespace() {
        let line = parse("   abc   def   ").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["abc".to_string(), "def".to_string()]
        );
    }

    #[test]
    fn pipelines_split_programs() {
        let line = parse("a b|c d").unwrap();
        assert_eq!(line.pipelines.len(), 1);
        let programs = &line.pipelines[0].programs;
        assert_eq!(programs.len(), 2);
        assert_eq!(command_words(&programs[0]), &["a", "b"]);
        assert_eq!(command_words(&programs[1]), &["c", "d"]);
    }

    #[test]
    fn semicolons_split_pipelines() {
        let line = parse("a; b | c\nd").unwrap();
        assert_eq!(line.pipelines.len(), 3);
        assert_eq!(line.pipelines[1].programs.len(), 2);
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let line = parse("a # b | c\nd").unwrap();
        assert_eq!(line.pipelines.len(), 2);
        assert_eq!(command_words(&line.pipelines[0].programs[0]), &["a"]);
        assert_eq!(command_words(&line.pipelines[1].programs[0]), &["d"]);
    }

    #[test]
    fn quoting() {
        let line = parse("echo 'a b' \"c d\" e'f'g").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["echo", "a b", "c d", "efg"]
        );
    }

    #[test]
    fn unterminated_quotes() {
        assert_eq!(parse("echo 'abc"), Err(ParseError::UnterminatedString));
        assert_eq!(parse("echo \"abc"), Err(ParseError::UnterminatedString));
    }

    #[test]
    fn variable_expansion() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "NAME", "world");
        let line = parse_line(&mut locals, root, "echo $NAME ${NAME}! \"hi $NAME\"").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["echo", "world", "world!", "hi world"]
        );
    }

    #[test]
    fn unset_variable_expands_empty() {
        let line = parse("echo a${MISSING}b").unwrap();
        assert_eq!(command_words(&line.pipelines[0].programs[0]), &["echo", "ab"]);
    }

    #[test]
    fn single_quotes_suppress_expansion() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "X", "v");
        let line = parse_line(&mut locals, root, "echo '$X'").unwrap();
        assert_eq!(command_words(&line.pipelines[0].programs[0]), &["echo", "$X"]);
    }

    #[test]
    fn unterminated_variable() {
        assert_eq!(parse("echo ${NAME"), Err(ParseError::UnterminatedVariable));
    }

    #[test]
    fn positional_arguments() {
        let (mut locals, root) = Locals::new();
        let scope = locals.push(root, Relationship::ArgsOnly);
        locals.set_args(
            scope,
            vec!["f".into(), "one".into(), "two".into()],
        );
        let line = parse_line(&mut locals, scope, "echo $1 $# $@").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["echo", "one", "2", "one two"]
        );
    }

    #[test]
    fn alias_expansion_prepends_words() {
        let (mut locals, root) = Locals::new();
        locals.set_alias(
            root,
            "ll",
            Rc::new(ParseNode::Words(vec!["ls".into(), "-l".into()])),
        );
        let line = parse_line(&mut locals, root, "ll /tmp").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["ls", "-l", "/tmp"]
        );
    }

    #[test]
    fn self_referential_alias_terminates() {
        let (mut locals, root) = Locals::new();
        locals.set_alias(
            root,
            "ls",
            Rc::new(ParseNode::Words(vec!["ls".into(), "--color".into()])),
        );
        let line = parse_line(&mut locals, root, "ls").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["ls", "--color"]
        );
    }

    #[test]
    fn mutual_alias_cycle_terminates() {
        let (mut locals, root) = Locals::new();
        locals.set_alias(root, "a", Rc::new(ParseNode::Words(vec!["b".into()])));
        locals.set_alias(root, "b", Rc::new(ParseNode::Words(vec!["a".into()])));
        let line = parse_line(&mut locals, root, "a").unwrap();
        assert_eq!(command_words(&line.pipelines[0].programs[0]), &["a"]);
    }

    #[test]
    fn blocked_alias_falls_through_to_function() {
        // Expanding `greet` once blocks its alias; the re-query of the new
        // first word finds the function of the same name and stops.
        let (mut locals, root) = Locals::new();
        locals.set_alias(
            root,
            "greet",
            Rc::new(ParseNode::Words(vec!["greet".into(), "loudly".into()])),
        );
        locals.set_function(root, "greet", Rc::new(ParseNode::Source("echo hi".into())));
        let line = parse_line(&mut locals, root, "greet").unwrap();
        assert_eq!(
            command_words(&line.pipelines[0].programs[0]),
            &["greet", "loudly"]
        );
    }

    #[test]
    fn redirections() {
        let line = parse("sort < in.txt > out.txt more").unwrap();
        match &line.pipelines[0].programs[0] {
            ParsedProgram::Command {
                words,
                redirect_in,
                redirect_out,
            } => {
                assert_eq!(words, &["sort", "more"]);
                assert_eq!(redirect_in.as_deref(), Some("in.txt"));
                assert_eq!(redirect_out.as_deref(), Some("out.txt"));
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn redirect_without_target() {
        assert_eq!(parse("echo hi >"), Err(ParseError::NothingToIndirect));
        assert_eq!(parse("> out.txt"), Err(ParseError::NothingToIndirect));
    }

    #[test]
    fn pipe_errors() {
        assert_eq!(parse("a |"), Err(ParseError::UnterminatedProgram));
        assert_eq!(parse("| a"), Err(ParseError::EmptyProgram));
        assert_eq!(parse("a | | b"), Err(ParseError::EmptyProgram));
    }

    #[test]
    fn subshell_statement() {
        let line = parse("(a; b)").unwrap();
        assert_eq!(line.pipelines.len(), 1);
        match &line.pipelines[0].programs[0] {
            ParsedProgram::Subshell(inner) => assert_eq!(inner.pipelines.len(), 2),
            other => panic!("expected subshell, got {other:?}"),
        }
    }

    #[test]
    fn paren_errors() {
        assert_eq!(parse("(a"), Err(ParseError::UnterminatedParen));
        assert_eq!(parse("a)"), Err(ParseError::StrayCloseParen));
        assert_eq!(parse("(a) b"), Err(ParseError::ExpectedEndOfStatement));
    }

    #[test]
    fn function_definition() {
        let line = parse("greet() { echo hi; echo there }").unwrap();
        match &line.pipelines[0].programs[0] {
            ParsedProgram::FunctionDef { name, body, source } => {
                assert_eq!(name, "greet");
                assert_eq!(body.pipelines.len(), 2);
                assert_eq!(&**source, " echo hi; echo there ");
            }
            other => panic!("expected function def, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_function_declaration() {
        assert_eq!(
            parse("f() { echo hi"),
            Err(ParseError::UnterminatedFunctionDeclaration)
        );
        assert_eq!(
            parse("f() echo"),
            Err(ParseError::UnterminatedFunctionDeclaration)
        );
    }

    #[test]
    fn dollar_literals() {
        let line = parse("echo $ a$").unwrap();
        assert_eq!(command_words(&line.pipelines[0].programs[0]), &["echo", "$", "a$"]);
    }
}
