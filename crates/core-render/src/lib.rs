//! Read-only render contract over backlog and prompt state.
//!
//! The graphical frontend (window, fonts, blitting) lives outside the core;
//! this crate is the interface it consumes. Nothing here mutates core
//! state: a renderer walks backlog bytes as styled spans, measures them in
//! terminal cells, and queries the prompt and shell for the line being
//! edited and the directory to display.

use std::ops::Range;

use core_backlog::{Backlog, EventKind, rendition};
use core_config::Config;
use core_prompt::Prompt;
use core_shell::Shell;
use core_unicode::{cell_width, utf8_code_point, utf8_width};

/// A run of backlog bytes sharing one rendition and hyperlink state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub range: Range<u64>,
    pub rendition: u64,
    /// Arena range of the active hyperlink URL, if any.
    pub hyperlink: Option<Range<usize>>,
}

/// Iterate the visible part of a backlog (`[0, render_length)`) as spans,
/// switching state at event boundaries.
pub fn spans(backlog: &Backlog) -> SpanIter<'_> {
    SpanIter {
        backlog,
        index: 0,
        event_index: 0,
        rendition: rendition::reset(),
        hyperlink: None,
        limit: backlog.render_length(),
    }
}

pub struct SpanIter<'a> {
    backlog: &'a Backlog,
    index: u64,
    event_index: usize,
    rendition: u64,
    hyperlink: Option<Range<usize>>,
    limit: u64,
}

impl SpanIter<'_> {
    fn apply_events_at(&mut self, index: u64) {
        while let Some(event) = self.backlog.events.get(self.event_index) {
            if event.index > index {
                break;
            }
            match &event.kind {
                EventKind::SetGraphicRendition(word) => self.rendition = *word,
                EventKind::StartHyperlink(url) => self.hyperlink = Some(url.clone()),
                EventKind::EndHyperlink => self.hyperlink = None,
                EventKind::StartInput | EventKind::StartProcess | EventKind::StartDirectory => {}
            }
            self.event_index += 1;
        }
    }

    fn next_boundary(&self, from: u64) -> u64 {
        for event in &self.backlog.events[self.event_index..] {
            if event.index > from {
                return event.index.min(self.limit);
            }
        }
        self.limit
    }
}

impl Iterator for SpanIter<'_> {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.index >= self.limit {
            return None;
        }
        self.apply_events_at(self.index);
        let end = self.next_boundary(self.index);
        let span = Span {
            range: self.index..end,
            rendition: self.rendition,
            hyperlink: self.hyperlink.clone(),
        };
        self.index = end;
        Some(span)
    }
}

/// Byte range of line `number` within the visible stream.
pub fn line_range(backlog: &Backlog, number: usize) -> Range<u64> {
    let start = if number == 0 {
        0
    } else {
        backlog.lines.get(number - 1).copied().unwrap_or(0)
    };
    let end = backlog
        .lines
        .get(number)
        .copied()
        .unwrap_or_else(|| backlog.render_length());
    start..end
}

/// Width in terminal cells of a visible byte range, decoding UTF-8 and
/// expanding tabs to the configured width.
pub fn range_cells(backlog: &Backlog, range: Range<u64>, tab_width: u32) -> usize {
    let mut cells = 0usize;
    let mut index = range.start;
    while index < range.end {
        let lead = backlog.get(index);
        if lead == b'\t' {
            let tab = tab_width.max(1) as usize;
            cells = (cells / tab + 1) * tab;
            index += 1;
            continue;
        }
        if lead == b'\n' {
            index += 1;
            continue;
        }
        let len = (utf8_width(lead) as u64).min(range.end - index);
        let mut sequence = [0u8; 4];
        for (offset, slot) in sequence.iter_mut().enumerate().take(len as usize) {
            *slot = backlog.get(index + offset as u64);
        }
        cells += cell_width(utf8_code_point(&sequence[..len as usize]));
        index += len;
    }
    cells
}

/// The line being edited: prefix then buffer.
pub fn prompt_display(prompt: &Prompt) -> String {
    format!("{}{}", prompt.prefix, prompt.text)
}

/// Cursor position in cells, counting the prefix.
pub fn prompt_cursor_cell(prompt: &Prompt) -> usize {
    str_cells(&prompt.prefix) + str_cells(&prompt.text[..prompt.cursor])
}

fn str_cells(text: &str) -> usize {
    text.chars().map(|ch| cell_width(ch as u32)).sum()
}

/// The directory shown next to the prompt, queried through the shell's
/// environment chain.
pub fn working_directory(shell: &Shell) -> &str {
    shell.locals.get_wd(shell.root)
}

/// Semantic color slot for a backlog's status marker.
pub fn info_color_slot(backlog: &Backlog, config: &Config) -> u8 {
    if !backlog.done {
        config.file.colors.info_running_fg
    } else if backlog.exit_code == 0 && !backlog.cancelled {
        config.file.colors.info_success_fg
    } else {
        config.file.colors.info_failure_fg
    }
}
