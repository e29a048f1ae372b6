//! Lexically scoped shell environments.
//!
//! A `Local` is one frame of a parent-linked chain: variables, aliases,
//! functions, explicit unset masks, and the working-directory stack. Frames
//! live in an arena ([`Locals`]) and point at their parent by id, so child
//! frames never hold references into their ancestors.
//!
//! `ArgsOnly` frames exist to inject positional arguments without opening a
//! new variable scope: variable reads skip them entirely and variable writes
//! seek the first non-`ArgsOnly` ancestor.

use std::rc::Rc;

use crate::parse::ParseNode;

pub type RcStr = Rc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    ArgsOnly,
    Subshell,
    Function,
}

/// Maximum retained working directories per frame; the oldest falls off.
pub const WORKING_DIRECTORY_CAP: usize = 128;

#[derive(Debug, Default)]
struct Frame {
    parent: Option<LocalId>,
    relationship: Option<Relationship>,
    /// Positional arguments, present on ArgsOnly / Function frames.
    args: Option<Vec<RcStr>>,

    variable_names: Vec<RcStr>,
    variable_values: Vec<RcStr>,
    /// Keys explicitly masked from ancestor lookups.
    unset_vars: Vec<RcStr>,
    /// Keys promoted into the environment of spawned children.
    exported_vars: Vec<RcStr>,

    alias_names: Vec<String>,
    alias_values: Vec<Rc<ParseNode>>,
    function_names: Vec<String>,
    function_values: Vec<Rc<ParseNode>>,

    /// Top is the current working directory; older entries serve
    /// "old wd N" queries.
    working_directories: Vec<String>,

    /// Alias name suppressed during its own expansion.
    blocked_alias: Option<String>,
}

/// Result of the combined alias/function lookup.
#[derive(Debug, Clone)]
pub enum AliasOrFunction {
    Alias(Rc<ParseNode>),
    Function(Rc<ParseNode>),
}

/// On platforms with case-insensitive environments the PATH variable is
/// spelled `Path`; lookups and writes agree on the canonical key.
fn canonical_var(key: &str) -> &str {
    if cfg!(windows) && key == "PATH" {
        "Path"
    } else {
        key
    }
}

#[derive(Debug, Default)]
pub struct Locals {
    frames: Vec<Frame>,
}

impl Locals {
    /// Create the arena with its root frame.
    pub fn new() -> (Self, LocalId) {
        let mut locals = Self { frames: Vec::new() };
        let root = LocalId(locals.frames.len());
        locals.frames.push(Frame::default());
        (locals, root)
    }

    /// Push a child frame. Returns its id; frames are dropped with the arena.
    pub fn push(&mut self, parent: LocalId, relationship: Relationship) -> LocalId {
        let id = LocalId(self.frames.len());
        self.frames.push(Frame {
            parent: Some(parent),
            relationship: Some(relationship),
            ..Frame::default()
        });
        id
    }

    pub fn set_args(&mut self, scope: LocalId, args: Vec<RcStr>) {
        self.frames[scope.0].args = Some(args);
    }

    /// Positional arguments visible from `scope`: the nearest frame carrying
    /// an argument vector.
    pub fn args(&self, scope: LocalId) -> &[RcStr] {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            if let Some(args) = &frame.args {
                return args;
            }
            current = frame.parent;
        }
        &[]
    }

    fn is_args_only(&self, id: LocalId) -> bool {
        self.frames[id.0].relationship == Some(Relationship::ArgsOnly)
    }

    /// Variable writers ignore ArgsOnly frames.
    fn writable_scope(&self, mut scope: LocalId) -> LocalId {
        while self.is_args_only(scope) {
            match self.frames[scope.0].parent {
                Some(parent) => scope = parent,
                None => break,
            }
        }
        scope
    }

    ///////////////////////////////////////////////////////////////////////
    // Variables
    ///////////////////////////////////////////////////////////////////////

    pub fn get_var(&self, scope: LocalId, key: &str) -> Option<RcStr> {
        let key = canonical_var(key);
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            current = frame.parent;
            if frame.relationship == Some(Relationship::ArgsOnly) {
                continue;
            }

            for (name, value) in frame.variable_names.iter().zip(&frame.variable_values) {
                if &**name == key {
                    return Some(value.clone());
                }
            }

            // Unset variables fail to look up even if an ancestor has them.
            for unset in &frame.unset_vars {
                if &**unset == key {
                    return None;
                }
            }
        }
        None
    }

    pub fn set_var(&mut self, scope: LocalId, key: &str, value: &str) {
        let scope = self.writable_scope(scope);
        let key = canonical_var(key);
        let frame = &mut self.frames[scope.0];

        // Setting a variable clears the unset mask.
        frame.unset_vars.retain(|unset| &**unset != key);

        for (name, slot) in frame.variable_names.iter().zip(&mut frame.variable_values) {
            if &**name == key {
                *slot = Rc::from(value);
                return;
            }
        }

        frame.variable_names.push(Rc::from(key));
        frame.variable_values.push(Rc::from(value));
    }

    pub fn unset_var(&mut self, scope: LocalId, key: &str) {
        let scope = self.writable_scope(scope);
        let key = canonical_var(key);
        let frame = &mut self.frames[scope.0];

        if let Some(i) = frame.variable_names.iter().position(|name| &**name == key) {
            frame.variable_names.remove(i);
            frame.variable_values.remove(i);
        }
        if let Some(i) = frame.exported_vars.iter().position(|name| &**name == key) {
            frame.exported_vars.remove(i);
        }

        // In a forked scope the key must be explicitly masked so lookups do
        // not continue up the chain.
        if frame.parent.is_some() && !frame.unset_vars.iter().any(|unset| &**unset == key) {
            frame.unset_vars.push(Rc::from(key));
        }
    }

    /// Promote `key` into the environment of spawned children.
    pub fn make_env_var(&mut self, scope: LocalId, key: &str) {
        let scope = self.writable_scope(scope);
        let key = canonical_var(key);
        let frame = &mut self.frames[scope.0];
        if !frame.exported_vars.iter().any(|name| &**name == key) {
            frame.exported_vars.push(Rc::from(key));
        }
    }

    /// The exported environment visible from `scope`: every exported key in
    /// the chain resolved through the normal variable lookup.
    pub fn exported_env(&self, scope: LocalId) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            current = frame.parent;
            for key in &frame.exported_vars {
                if env.iter().any(|(name, _)| name == &**key) {
                    continue;
                }
                if let Some(value) = self.get_var(scope, key) {
                    env.push((key.to_string(), value.to_string()));
                }
            }
        }
        env
    }

    ///////////////////////////////////////////////////////////////////////
    // Working directories
    ///////////////////////////////////////////////////////////////////////

    pub fn get_wd(&self, scope: LocalId) -> &str {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            if let Some(wd) = frame.working_directories.last() {
                return wd;
            }
            current = frame.parent;
        }
        ""
    }

    /// The `num`-th previous working directory, counting back through the
    /// chain. `num == 0` is the current directory.
    pub fn get_old_wd(&self, scope: LocalId, mut num: usize) -> Option<&str> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            current = frame.parent;
            if num >= frame.working_directories.len() {
                num -= frame.working_directories.len();
            } else {
                let index = frame.working_directories.len() - num - 1;
                return Some(&frame.working_directories[index]);
            }
        }
        None
    }

    pub fn set_wd(&mut self, scope: LocalId, value: &str) {
        let scope = self.writable_scope(scope);
        let frame = &mut self.frames[scope.0];
        if frame.working_directories.len() >= WORKING_DIRECTORY_CAP {
            frame.working_directories.remove(0);
        }
        frame.working_directories.push(value.to_string());
    }

    ///////////////////////////////////////////////////////////////////////
    // Aliases and functions
    ///////////////////////////////////////////////////////////////////////

    /// Block `name` from alias lookup while it is being expanded, so an
    /// alias whose value mentions itself cannot recurse.
    pub fn set_blocked_alias(&mut self, scope: LocalId, name: Option<&str>) {
        self.frames[scope.0].blocked_alias = name.map(str::to_string);
    }

    fn alias_blocked(&self, scope: LocalId, name: &str) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            if frame.blocked_alias.as_deref() == Some(name) {
                return true;
            }
            current = frame.parent;
        }
        false
    }

    /// Combined lookup used when resolving the first word of a program.
    /// Function hits still succeed while the alias of the same name is
    /// blocked for anti-recursion.
    pub fn get_alias_or_function(
        &self,
        scope: LocalId,
        alias_key: &str,
        function_key: &str,
    ) -> Option<AliasOrFunction> {
        let allow_alias = !self.alias_blocked(scope, alias_key);

        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            current = frame.parent;

            if allow_alias {
                for (name, value) in frame.alias_names.iter().zip(&frame.alias_values) {
                    if name == alias_key {
                        return Some(AliasOrFunction::Alias(value.clone()));
                    }
                }
            }
            for (name, value) in frame.function_names.iter().zip(&frame.function_values) {
                if name == function_key {
                    return Some(AliasOrFunction::Function(value.clone()));
                }
            }
        }
        None
    }

    pub fn get_function(&self, scope: LocalId, name: &str) -> Option<Rc<ParseNode>> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            current = frame.parent;
            for (candidate, value) in frame.function_names.iter().zip(&frame.function_values) {
                if candidate == name {
                    return Some(value.clone());
                }
            }
        }
        None
    }

    pub fn set_alias(&mut self, scope: LocalId, key: &str, node: Rc<ParseNode>) {
        let scope = self.writable_scope(scope);
        let frame = &mut self.frames[scope.0];
        for (name, slot) in frame.alias_names.iter().zip(&mut frame.alias_values) {
            if name == key {
                *slot = node;
                return;
            }
        }
        frame.alias_names.push(key.to_string());
        frame.alias_values.push(node);
    }

    pub fn set_function(&mut self, scope: LocalId, key: &str, node: Rc<ParseNode>) {
        let scope = self.writable_scope(scope);
        let frame = &mut self.frames[scope.0];
        for (name, slot) in frame.function_names.iter().zip(&mut frame.function_values) {
            if name == key {
                *slot = node;
                return;
            }
        }
        frame.function_names.push(key.to_string());
        frame.function_values.push(node);
    }

    /// All visible aliases, nearest frame first. Shadowed names appear once.
    pub fn aliases(&self, scope: LocalId) -> Vec<(String, Rc<ParseNode>)> {
        let mut out: Vec<(String, Rc<ParseNode>)> = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let frame = &self.frames[id.0];
            current = frame.parent;
            for (name, value) in frame.alias_names.iter().zip(&frame.alias_values) {
                if !out.iter().any(|(seen, _)| seen == name) {
                    out.push((name.clone(), value.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(node: &[&str]) -> Rc<ParseNode> {
        Rc::new(ParseNode::Words(
            node.iter().map(|word| word.to_string()).collect(),
        ))
    }

    #[test]
    fn set_then_get() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "X", "1");
        assert_eq!(locals.get_var(root, "X").as_deref(), Some("1"));
        locals.set_var(root, "X", "2");
        assert_eq!(locals.get_var(root, "X").as_deref(), Some("2"));
    }

    #[test]
    fn child_sees_parent_until_unset() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "X", "1");
        let child = locals.push(root, Relationship::Subshell);
        assert_eq!(locals.get_var(child, "X").as_deref(), Some("1"));

        locals.unset_var(child, "X");
        assert_eq!(locals.get_var(child, "X"), None);
        // The parent still has its value.
        assert_eq!(locals.get_var(root, "X").as_deref(), Some("1"));
    }

    #[test]
    fn set_after_unset_clears_mask() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "X", "1");
        let child = locals.push(root, Relationship::Subshell);
        locals.unset_var(child, "X");
        locals.set_var(child, "X", "2");
        assert_eq!(locals.get_var(child, "X").as_deref(), Some("2"));
    }

    #[test]
    fn args_only_frames_are_transparent_to_variables() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "X", "1");
        let args = locals.push(root, Relationship::ArgsOnly);
        locals.set_args(args, vec![Rc::from("f"), Rc::from("a")]);

        // Reads pass through.
        assert_eq!(locals.get_var(args, "X").as_deref(), Some("1"));
        // Writes land on the first non-ArgsOnly ancestor.
        locals.set_var(args, "Y", "2");
        assert_eq!(locals.get_var(root, "Y").as_deref(), Some("2"));
        // Positional arguments resolve from the nearest carrying frame.
        assert_eq!(&*locals.args(args)[1], "a");
    }

    #[test]
    fn working_directory_stack() {
        let (mut locals, root) = Locals::new();
        assert_eq!(locals.get_wd(root), "");
        locals.set_wd(root, "/a");
        locals.set_wd(root, "/b");
        assert_eq!(locals.get_wd(root), "/b");
        assert_eq!(locals.get_old_wd(root, 0), Some("/b"));
        assert_eq!(locals.get_old_wd(root, 1), Some("/a"));
        assert_eq!(locals.get_old_wd(root, 2), None);
    }

    #[test]
    fn working_directory_stack_evicts_oldest() {
        let (mut locals, root) = Locals::new();
        for i in 0..WORKING_DIRECTORY_CAP + 10 {
            locals.set_wd(root, &format!("/{i}"));
        }
        assert_eq!(locals.get_wd(root), "/137");
        // The oldest ten were evicted.
        assert_eq!(
            locals.get_old_wd(root, WORKING_DIRECTORY_CAP - 1),
            Some("/10")
        );
        assert_eq!(locals.get_old_wd(root, WORKING_DIRECTORY_CAP), None);
    }

    #[test]
    fn old_wd_walks_the_chain() {
        let (mut locals, root) = Locals::new();
        locals.set_wd(root, "/old");
        let child = locals.push(root, Relationship::Function);
        locals.set_wd(child, "/new");
        assert_eq!(locals.get_wd(child), "/new");
        assert_eq!(locals.get_old_wd(child, 1), Some("/old"));
    }

    #[test]
    fn alias_lookup_respects_block() {
        let (mut locals, root) = Locals::new();
        locals.set_alias(root, "ls", words(&["ls", "--color"]));
        assert!(matches!(
            locals.get_alias_or_function(root, "ls", "ls"),
            Some(AliasOrFunction::Alias(_))
        ));

        let expansion = locals.push(root, Relationship::ArgsOnly);
        locals.set_blocked_alias(expansion, Some("ls"));
        assert!(locals.get_alias_or_function(expansion, "ls", "ls").is_none());

        // A function of the same name still resolves while the alias is
        // blocked.
        locals.set_function(root, "ls", words(&["unused"]));
        assert!(matches!(
            locals.get_alias_or_function(expansion, "ls", "ls"),
            Some(AliasOrFunction::Function(_))
        ));
    }

    #[test]
    fn exported_env_resolves_through_chain() {
        let (mut locals, root) = Locals::new();
        locals.set_var(root, "A", "1");
        locals.set_var(root, "B", "2");
        locals.make_env_var(root, "A");
        let child = locals.push(root, Relationship::Subshell);
        locals.set_var(child, "A", "override");
        let env = locals.exported_env(child);
        assert_eq!(env, vec![("A".to_string(), "override".to_string())]);
    }

    #[test]
    fn function_shadowing_nearest_wins() {
        let (mut locals, root) = Locals::new();
        locals.set_function(root, "f", words(&["outer"]));
        let child = locals.push(root, Relationship::Function);
        locals.set_function(child, "f", words(&["inner"]));
        let node = locals.get_function(child, "f").unwrap();
        assert_eq!(*node, ParseNode::Words(vec!["inner".to_string()]));
    }
}
