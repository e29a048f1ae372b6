//! Append-only chunked byte store with incremental escape-sequence parsing.
//!
//! Each executed command line owns one `Backlog`. Process output is fed in
//! through [`Backlog::append_text`], which strips and interprets the control
//! sequences we care about (CR handling, SGR color changes, OSC hyperlinks
//! and window titles) while recording line starts and rendition events so the
//! renderer can walk the stream by `(chunk, offset)` without re-parsing.
//!
//! Storage is a vector of fixed 4096-byte chunks addressed by `index >> 12` /
//! `index & 0xfff`. A sequence split across reads is carried in
//! `escape_backlog` until enough bytes arrive to finish it.

use std::ops::Range;
use std::time::SystemTime;

mod escape;
pub mod rendition;

/// Size of one storage chunk. Must stay in sync with the index split below.
pub const BACKLOG_BUFFER_SIZE: usize = 4096;

#[inline]
fn outer_index(index: u64) -> usize {
    (index >> 12) as usize
}

#[inline]
fn inner_index(index: u64) -> usize {
    (index & 0xfff) as usize
}

/// A parsed event anchored at a byte index of the logical stream.
///
/// Indices are non-decreasing in emission order and attach *before* the byte
/// they describe. Hyperlink URLs live in the backlog's arena; the event only
/// carries the byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    StartInput,
    StartProcess,
    StartDirectory,
    SetGraphicRendition(u64),
    StartHyperlink(Range<usize>),
    EndHyperlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub index: u64,
    pub kind: EventKind,
}

#[derive(Debug)]
pub struct Backlog {
    pub id: u64,
    buffers: Vec<Box<[u8; BACKLOG_BUFFER_SIZE]>>,
    /// Logical byte count. Always `<= max_length`.
    pub length: u64,
    max_length: u64,
    /// Byte index just past each `'\n'` in the logical stream.
    pub lines: Vec<u64>,
    pub events: Vec<Event>,
    /// Partially received escape sequence carried across `append_text` calls.
    escape_backlog: Vec<u8>,
    pub graphics_rendition: u64,
    inside_hyperlink: bool,
    /// Bump storage owning hyperlink URLs referenced by events.
    arena: Vec<u8>,
    /// A bare CR truncates back to the line start. Not strict VT (the cursor
    /// should only move), but matches how overwrite-style progress output is
    /// used in practice.
    pub cr_clears_line: bool,

    // Lifecycle fields consumed by the renderer.
    pub done: bool,
    pub cancelled: bool,
    pub exit_code: i32,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
    pub render_collapsed: bool,
}

impl Backlog {
    pub fn new(id: u64, max_length: u64) -> Self {
        Self {
            id,
            buffers: Vec::new(),
            length: 0,
            max_length,
            lines: Vec::new(),
            events: Vec::new(),
            escape_backlog: Vec::new(),
            graphics_rendition: rendition::reset(),
            inside_hyperlink: false,
            arena: Vec::new(),
            cr_clears_line: true,
            done: false,
            cancelled: false,
            exit_code: 0,
            start: SystemTime::now(),
            end: None,
            render_collapsed: false,
        }
    }

    /// Constant-time random read of the logical stream.
    pub fn get(&self, index: u64) -> u8 {
        debug_assert!(index < self.length);
        self.buffers[outer_index(index)][inner_index(index)]
    }

    /// Bytes shown by the renderer: the first line only while collapsed.
    pub fn render_length(&self) -> u64 {
        if self.render_collapsed && !self.lines.is_empty() {
            self.lines[0]
        } else {
            self.length
        }
    }

    /// Resolve a hyperlink event payload to the URL bytes it points at.
    pub fn hyperlink(&self, range: &Range<usize>) -> &[u8] {
        &self.arena[range.clone()]
    }

    /// Copy of the logical stream `[0, length)`. Renderer and test helper.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        for i in 0..self.length {
            out.push(self.get(i));
        }
        out
    }

    /// Record an event at the current write cursor.
    pub fn push_event(&mut self, kind: EventKind) {
        self.events.push(Event {
            index: self.length,
            kind,
        });
    }

    fn set_graphics_rendition(&mut self, graphics_rendition: u64) {
        self.push_event(EventKind::SetGraphicRendition(graphics_rendition));
        self.graphics_rendition = graphics_rendition;
    }

    /// Append plain bytes through the chunk writer, clamped at `max_length`.
    /// Returns the number of bytes stored. Records a line start for every
    /// newline passed.
    fn append_chunk(&mut self, text: &[u8]) -> u64 {
        if self.length >= self.max_length {
            return 0;
        }
        let budget = usize::try_from(self.max_length - self.length).unwrap_or(usize::MAX);
        let text = if text.len() > budget {
            &text[..budget]
        } else {
            text
        };

        let mut written = 0usize;
        while written < text.len() {
            let outer = outer_index(self.length);
            let inner = inner_index(self.length);
            if self.buffers.len() <= outer {
                self.buffers.push(Box::new([0u8; BACKLOG_BUFFER_SIZE]));
            }
            let take = (text.len() - written).min(BACKLOG_BUFFER_SIZE - inner);
            self.buffers[outer][inner..inner + take]
                .copy_from_slice(&text[written..written + take]);
            for (offset, &byte) in text[written..written + take].iter().enumerate() {
                if byte == b'\n' {
                    self.lines.push(self.length + offset as u64 + 1);
                }
            }
            self.length += take as u64;
            written += take;
        }
        written as u64
    }

    /// Drop logical bytes back to `new_length`, releasing whole chunks past
    /// the new end. Line and event records are left alone; truncation only
    /// ever rewinds within the current line.
    fn truncate_to(&mut self, new_length: u64) {
        debug_assert!(new_length <= self.length);
        self.length = new_length;
        let keep = outer_index(new_length) + 1;
        while self.buffers.len() > keep {
            self.buffers.pop();
        }
    }

    fn start_of_current_line(&self) -> u64 {
        self.lines.last().copied().unwrap_or(0)
    }

    /// Append process output, interpreting control bytes as it goes.
    ///
    /// Returns how many input bytes were consumed. Everything is consumed
    /// unless the size cap truncates the write; a partial escape sequence
    /// consumes its bytes into `escape_backlog` without advancing `length`.
    pub fn append_text(&mut self, text: &[u8]) -> u64 {
        const ESCAPE: u8 = 0x1b;
        const DEL: u8 = 0x08;
        const BEL: u8 = 0x07;

        let mut text = text;
        let mut done: u64 = 0;

        // If we are inside an escape sequence then pump the text into that
        // first.
        if !self.escape_backlog.is_empty() {
            let mut skip = 0usize;
            if !escape::process_escape_sequence(self, text, &mut skip) {
                // All of the text was consumed.
                return text.len() as u64;
            }
            self.escape_backlog.clear();
            text = &text[skip..];
            done += skip as u64;
        }

        while !text.is_empty() {
            // Find the first special byte.
            let chunk_len = text
                .iter()
                .position(|&b| b == b'\r' || b == ESCAPE || b == DEL || b == BEL)
                .unwrap_or(text.len());

            // Append the normal text before it.
            let result = self.append_chunk(&text[..chunk_len]);
            done += result;

            // Output is truncated so just stop here.
            if result != chunk_len as u64 {
                break;
            }

            // No special byte so stop.
            if chunk_len == text.len() {
                break;
            }

            match text[chunk_len] {
                DEL => {
                    // Erase one byte, never past the start of the line.
                    let line_start = self.start_of_current_line();
                    if line_start < self.length {
                        let new_length = self.length - 1;
                        self.truncate_to(new_length);
                    }
                    text = &text[chunk_len + 1..];
                    done += 1;
                }

                // '\r\r\n' needs the '\r's collapsed, so CR rides through the
                // escape machinery like ESC does.
                b'\r' | ESCAPE => {
                    let remaining = &text[chunk_len..];
                    let mut skip = 0usize;
                    if !escape::process_escape_sequence(self, remaining, &mut skip) {
                        return done + remaining.len() as u64;
                    }
                    self.escape_backlog.clear();
                    text = &remaining[skip..];
                    done += skip as u64;
                }

                BEL => {
                    // Ignore alarm bytes.
                    text = &text[chunk_len + 1..];
                    done += 1;
                }

                _ => unreachable!("position only matches special bytes"),
            }
        }

        done
    }
}
