//! Output plumbing between programs and the backlog.
//!
//! [`ProcessOutput`] is the junction between program output and the rest of
//! the system: builtins write through it without caring whether the bytes
//! land in a pipe (to be drained later) or directly in a backlog. `Closed`
//! stands in for a cancelled output; writes fail so the owning builtin
//! finalizes on its next tick.

use std::fs::File;
use std::io::{self, Write};
use std::rc::Rc;

use crate::SharedBacklog;

#[derive(Debug)]
pub enum ProcessOutput {
    File(Rc<File>),
    Backlog(SharedBacklog),
    Closed,
}

impl ProcessOutput {
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ProcessOutput::File(file) => (&**file).write(buf),
            ProcessOutput::Backlog(backlog) => {
                backlog.borrow_mut().append_text(buf);
                Ok(buf.len())
            }
            ProcessOutput::Closed => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    /// Sever the sink; the next write reports a broken pipe.
    pub fn close(&mut self) {
        *self = ProcessOutput::Closed;
    }
}

/// CRLF normalization across read boundaries: a chunk ending in `'\r'` holds
/// that byte back until the next chunk shows whether a `'\n'` follows.
#[derive(Debug, Default)]
pub struct CrCarry {
    pending_cr: bool,
}

impl CrCarry {
    pub fn normalize(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\r');
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    /// Emit a held trailing `'\r'` at end of stream.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            self.pending_cr = false;
            out.push(b'\r');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_chunks(chunks: &[&[u8]]) -> Vec<u8> {
        let mut carry = CrCarry::default();
        let mut out = Vec::new();
        for chunk in chunks {
            carry.normalize(chunk, &mut out);
        }
        carry.finish(&mut out);
        out
    }

    #[test]
    fn crlf_in_one_chunk() {
        assert_eq!(normalize_chunks(&[b"a\r\nb"]), b"a\nb");
    }

    #[test]
    fn crlf_split_across_chunks() {
        assert_eq!(normalize_chunks(&[b"a\r", b"\nb"]), b"a\nb");
    }

    #[test]
    fn lone_cr_passes_through() {
        assert_eq!(normalize_chunks(&[b"a\rb"]), b"a\rb");
        assert_eq!(normalize_chunks(&[b"a\r", b"b"]), b"a\rb");
    }

    #[test]
    fn trailing_cr_flushed_at_end() {
        assert_eq!(normalize_chunks(&[b"a\r"]), b"a\r");
    }

    #[test]
    fn consecutive_crs() {
        assert_eq!(normalize_chunks(&[b"a\r\r\nb"]), b"a\r\nb");
    }

    #[test]
    fn closed_output_reports_broken_pipe() {
        let mut out = ProcessOutput::Closed;
        let error = out.write(b"x").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
    }
}
