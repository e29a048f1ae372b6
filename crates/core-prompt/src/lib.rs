//! Prompt state: an editable line buffer under a replayable undo history.
//!
//! Every mutation is recorded as an [`Edit`] before it is applied, so the
//! buffer and cursor at any moment equal the replay of `edit_history[..
//! edit_index]`. Undo walks backward inverting edits, redo walks forward
//! reapplying them, and combo markers group a run of edits into one atomic
//! undo step. Pushing a new edit discards the redo branch.
//!
//! Edit values are shared immutable strings (`Rc<str>`): an undo and the
//! history entry reference the same bytes without copying.

use std::rc::Rc;

use tracing::trace;

/// Where the cursor lands when an edit is applied (or replayed by redo), and
/// how it is restored by undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPolicy {
    /// The edit leaves the cursor alone.
    Indep,
    /// Cursor ends up past the affected text going forward, before it going
    /// backward.
    Before,
    /// Cursor ends up at the edit position in both directions.
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub cursor: CursorPolicy,
    pub position: usize,
    pub value: Rc<str>,
}

/// One entry of the undo history. Combo markers carry no text; they bracket
/// a group of edits that undo and redo as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    ComboStart,
    ComboEnd,
    Insert(TextEdit),
    Remove(TextEdit),
}

/// Completion popup state queried by the renderer.
#[derive(Debug, Default)]
pub struct Completion {
    pub active: bool,
    pub prefix_length: usize,
    pub results: Vec<Rc<str>>,
    pub current: usize,
}

/// The prompt: text, cursor, undo history, and the command history the
/// renderer pages through.
#[derive(Debug, Default)]
pub struct Prompt {
    pub prefix: String,
    pub text: String,
    pub cursor: usize,

    edit_history: Vec<Edit>,
    edit_index: usize,
    combo_depth: usize,

    /// Script this prompt is attached to, when input goes to its stdin.
    pub process_id: Option<u64>,

    pub history_counter: usize,
    pub history: Vec<Rc<str>>,
    /// Lines typed while a program was reading stdin, kept separately.
    pub stdin_history: Vec<Rc<str>>,
    pub history_searching: bool,

    pub completion: Completion,
}

impl Prompt {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Self::default()
        }
    }

    pub fn edit_index(&self) -> usize {
        self.edit_index
    }

    pub fn edit_count(&self) -> usize {
        self.edit_history.len()
    }

    /// The history list a lookup should page through: the stdin history while
    /// a script is reading input, the command history otherwise.
    pub fn history_list(&self, script: bool) -> &[Rc<str>] {
        if script {
            &self.stdin_history
        } else {
            &self.history
        }
    }

    pub fn push_history(&mut self, script: bool, line: &str) {
        let list = if script {
            &mut self.stdin_history
        } else {
            &mut self.history
        };
        list.push(Rc::from(line));
    }

    ///////////////////////////////////////////////////////////////////////
    // Walk the undo tree.
    ///////////////////////////////////////////////////////////////////////

    pub fn clear_undo_tree(&mut self) {
        self.edit_history.clear();
        self.edit_index = 0;
        self.combo_depth = 0;
    }

    pub fn undo(&mut self) -> bool {
        if self.edit_index == 0 {
            return false;
        }

        let mut depth = 0usize;
        loop {
            // Everything here is reversed because we are going backwards.
            self.edit_index -= 1;
            let edit = self.edit_history[self.edit_index].clone();
            match edit {
                Edit::ComboStart => {
                    debug_assert!(depth > 0);
                    depth -= 1;
                }
                Edit::ComboEnd => depth += 1,
                Edit::Remove(edit) => {
                    // Undo remove = actually insert.
                    self.text.insert_str(edit.position, &edit.value);
                    match edit.cursor {
                        CursorPolicy::Before => self.cursor = edit.position + edit.value.len(),
                        CursorPolicy::After => self.cursor = edit.position,
                        CursorPolicy::Indep => {}
                    }
                }
                Edit::Insert(edit) => {
                    // Undo insert = actually remove.
                    self.text
                        .replace_range(edit.position..edit.position + edit.value.len(), "");
                    match edit.cursor {
                        CursorPolicy::Before | CursorPolicy::After => self.cursor = edit.position,
                        CursorPolicy::Indep => {}
                    }
                }
            }

            if depth == 0 {
                break;
            }
        }

        trace!(target: "prompt.undo", edit_index = self.edit_index, "undo");
        true
    }

    pub fn redo(&mut self) -> bool {
        if self.edit_index == self.edit_history.len() {
            return false;
        }

        let mut depth = 0usize;
        loop {
            let edit = self.edit_history[self.edit_index].clone();
            self.edit_index += 1;
            match edit {
                Edit::ComboStart => depth += 1,
                Edit::ComboEnd => {
                    debug_assert!(depth > 0);
                    depth -= 1;
                }
                Edit::Remove(edit) => {
                    // Redo remove = actually remove.
                    self.text
                        .replace_range(edit.position..edit.position + edit.value.len(), "");
                    match edit.cursor {
                        CursorPolicy::Before | CursorPolicy::After => self.cursor = edit.position,
                        CursorPolicy::Indep => {}
                    }
                }
                Edit::Insert(edit) => {
                    // Redo insert = actually insert.
                    self.text.insert_str(edit.position, &edit.value);
                    match edit.cursor {
                        CursorPolicy::Before => self.cursor = edit.position + edit.value.len(),
                        CursorPolicy::After => self.cursor = edit.position,
                        CursorPolicy::Indep => {}
                    }
                }
            }

            if depth == 0 {
                break;
            }
        }

        trace!(target: "prompt.undo", edit_index = self.edit_index, "redo");
        true
    }

    ///////////////////////////////////////////////////////////////////////
    // Combine multiple edits into one undo node.
    ///////////////////////////////////////////////////////////////////////

    pub fn start_combo(&mut self) {
        self.combo_depth += 1;
        self.push_edit(Edit::ComboStart);
    }

    pub fn end_combo(&mut self) {
        debug_assert!(self.combo_depth > 0);
        self.combo_depth = self.combo_depth.saturating_sub(1);
        self.push_edit(Edit::ComboEnd);
    }

    ///////////////////////////////////////////////////////////////////////
    // Push an edit.
    ///////////////////////////////////////////////////////////////////////

    /// Pushing discards any redo branch past `edit_index`.
    fn push_edit(&mut self, edit: Edit) {
        self.edit_history.truncate(self.edit_index);
        self.edit_history.push(edit);
        self.edit_index += 1;
    }

    pub fn insert(&mut self, position: usize, text: &str) {
        self.push_edit(Edit::Insert(TextEdit {
            cursor: CursorPolicy::Indep,
            position,
            value: Rc::from(text),
        }));
        self.text.insert_str(position, text);
    }

    pub fn insert_before(&mut self, position: usize, text: &str) {
        self.push_edit(Edit::Insert(TextEdit {
            cursor: CursorPolicy::Before,
            position,
            value: Rc::from(text),
        }));
        self.text.insert_str(position, text);
        self.cursor = position + text.len();
    }

    pub fn insert_after(&mut self, position: usize, text: &str) {
        self.push_edit(Edit::Insert(TextEdit {
            cursor: CursorPolicy::After,
            position,
            value: Rc::from(text),
        }));
        self.text.insert_str(position, text);
        self.cursor = position;
    }

    pub fn remove(&mut self, start: usize, end: usize) {
        self.push_edit(Edit::Remove(TextEdit {
            cursor: CursorPolicy::Indep,
            position: start,
            value: Rc::from(&self.text[start..end]),
        }));
        self.text.replace_range(start..end, "");
    }

    pub fn remove_before(&mut self, start: usize, end: usize) {
        self.push_edit(Edit::Remove(TextEdit {
            cursor: CursorPolicy::Before,
            position: start,
            value: Rc::from(&self.text[start..end]),
        }));
        self.text.replace_range(start..end, "");
        self.cursor = start;
    }

    pub fn remove_after(&mut self, start: usize, end: usize) {
        self.push_edit(Edit::Remove(TextEdit {
            cursor: CursorPolicy::After,
            position: start,
            value: Rc::from(&self.text[start..end]),
        }));
        self.text.replace_range(start..end, "");
        self.cursor = start;
    }
}
