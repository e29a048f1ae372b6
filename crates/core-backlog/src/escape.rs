//! Resumable escape-sequence parser.
//!
//! Sequences may arrive split across reads, so every byte is pulled through
//! [`ensure_char`]: either it is already buffered in `escape_backlog` from an
//! earlier call, or it is lifted out of the fresh input (advancing `skip`).
//! A parser that runs out of bytes returns `false`; the caller keeps
//! `escape_backlog` and retries when more input arrives. A parser that
//! finishes returns `true` and the caller discards the buffered sequence and
//! resumes plain-text scanning after `skip` fresh bytes.

use tracing::trace;

use crate::rendition::{
    GR_BACKGROUND_MASK, GR_BACKGROUND_SHIFT, GR_BOLD, GR_BRIGHT, GR_FOREGROUND_MASK,
    GR_FOREGROUND_SHIFT, GR_REVERSE, GR_UNDERLINE, reset,
};
use crate::Backlog;

const BEL: u8 = 0x07;

/// Make byte `it` of the sequence available, absorbing from `fresh` if
/// needed. Returns `false` when the sequence is still incomplete.
fn ensure_char(backlog: &mut Backlog, it: usize, fresh: &[u8], skip: &mut usize) -> bool {
    if it < backlog.escape_backlog.len() {
        return true;
    }
    if fresh.len() <= *skip {
        return false;
    }
    backlog.escape_backlog.push(fresh[*skip]);
    *skip += 1;
    true
}

/// Parse an optional decimal number at `*it`. Leaves `number` untouched when
/// no digits are present. Overflow clamps to 32767.
fn eat_number(
    backlog: &mut Backlog,
    it: &mut usize,
    fresh: &[u8],
    skip: &mut usize,
    number: &mut i32,
) -> bool {
    let mut end = *it;
    loop {
        if !ensure_char(backlog, end, fresh, skip) {
            return false;
        }
        if !backlog.escape_backlog[end].is_ascii_digit() {
            break;
        }
        end += 1;
    }

    // No number.
    if *it == end {
        return true;
    }

    let mut value: u32 = 0;
    for &digit in &backlog.escape_backlog[*it..end] {
        value = value.saturating_mul(10).saturating_add(u32::from(digit - b'0'));
    }
    *number = if value > u32::from(u16::MAX) {
        32767
    } else {
        value as i32
    };
    *it = end;
    true
}

/// Parse the `;`-separated argument list of a CSI sequence. Missing arguments
/// cut off by a semicolon default to -1.
fn parse_args(
    backlog: &mut Backlog,
    it: &mut usize,
    fresh: &[u8],
    skip: &mut usize,
    args: &mut Vec<i32>,
) -> bool {
    loop {
        let mut arg = -1i32;
        if !eat_number(backlog, it, fresh, skip, &mut arg) {
            return false;
        }

        if !ensure_char(backlog, *it, fresh, skip) {
            return false;
        }
        let semicolon = backlog.escape_backlog[*it] == b';';

        if arg == -1 && !semicolon {
            break;
        }
        args.push(arg);

        if !semicolon {
            break;
        }
        *it += 1;
    }
    true
}

/// `38`/`48` extended color argument: `;5;<n>` selects from the 256-color
/// palette; `;2;<r>;<g>;<b>` is consumed but the color is not stored (the
/// rendition word has palette slots only).
fn parse_extended_color(color: &mut u64, args: &[i32], i: &mut usize) -> bool {
    if *i + 2 >= args.len() {
        *i = args.len() - 1;
        return false;
    }

    if args[*i + 1] == 5 {
        if args[*i + 2] == -1 {
            *i += 2;
            return false;
        }
        *color = (args[*i + 2] as u64) & 0xff;
        *i += 2;
        true
    } else if args[*i + 1] == 2 {
        // r = i + 2, g = i + 3, b = i + 4
        *i += 4;
        false
    } else {
        false
    }
}

/// Fold a list of SGR arguments into the packed rendition word.
fn parse_graphics_rendition(args: &[i32], mut graphics_rendition: u64) -> u64 {
    if args.is_empty() {
        graphics_rendition = reset();
    }

    let mut i = 0;
    while i < args.len() {
        let arg = args[i];
        if arg == 0 || arg == -1 {
            graphics_rendition = reset();
        } else if arg == 1 {
            graphics_rendition |= GR_BOLD;
        } else if arg == 21 {
            graphics_rendition &= !GR_BOLD;
        } else if arg == 4 {
            graphics_rendition |= GR_UNDERLINE;
        } else if arg == 24 {
            graphics_rendition &= !GR_UNDERLINE;
        } else if arg == 7 {
            graphics_rendition |= GR_REVERSE;
        } else if arg == 27 {
            graphics_rendition &= !GR_REVERSE;
        } else if (30..=39).contains(&arg) || (90..=99).contains(&arg) {
            // Set foreground color; 90s are the bright block.
            if arg <= 39 {
                graphics_rendition &= !GR_BRIGHT;
            } else {
                graphics_rendition |= GR_BRIGHT;
            }
            graphics_rendition &= !GR_FOREGROUND_MASK;
            let base = if arg <= 39 { arg - 30 } else { arg - 90 };
            let mut color = base as u64;
            if color == 9 {
                color = 7;
            }
            if color == 8 && !parse_extended_color(&mut color, args, &mut i) {
                color = 7;
            }
            graphics_rendition |= color << GR_FOREGROUND_SHIFT;
        } else if (40..=49).contains(&arg) || (100..=109).contains(&arg) {
            // Set background color.
            if arg <= 49 {
                graphics_rendition &= !GR_BRIGHT;
            } else {
                graphics_rendition |= GR_BRIGHT;
            }
            graphics_rendition &= !GR_BACKGROUND_MASK;
            let base = if arg <= 49 { arg - 40 } else { arg - 100 };
            let mut color = base as u64;
            if color == 9 {
                color = 0;
            }
            if color == 8 && !parse_extended_color(&mut color, args, &mut i) {
                color = 0;
            }
            graphics_rendition |= color << GR_BACKGROUND_SHIFT;
        } else {
            // Ignored.
        }
        i += 1;
    }

    graphics_rendition
}

/// `ESC ] 8 ; ; <URL> BEL <TEXT> ESC ] 8 ; ;`
///
/// `<TEXT>` can itself contain escape sequences, so the opening form is
/// terminated at the BEL; whether this is an opening or closing form is
/// tracked by `inside_hyperlink`.
fn parse_hyperlink(backlog: &mut Backlog, fresh: &[u8], skip: &mut usize) -> bool {
    if !ensure_char(backlog, 3, fresh, skip) {
        return false;
    }
    if !ensure_char(backlog, 4, fresh, skip) {
        return false;
    }
    if backlog.escape_backlog[3] != b';' || backlog.escape_backlog[4] != b';' {
        // Parameterized forms (id=...) are not distinguished; drain and drop.
        trace!(target: "backlog.escape", "unsupported hyperlink parameters consumed");
        return consume_until_bel(backlog, 3, fresh, skip);
    }

    if backlog.inside_hyperlink {
        backlog.push_event(crate::EventKind::EndHyperlink);
    } else {
        let mut it = 5;
        loop {
            if !ensure_char(backlog, it, fresh, skip) {
                return false;
            }
            if backlog.escape_backlog[it] == BEL {
                break;
            }
            it += 1;
        }

        let url = &backlog.escape_backlog[5..backlog.escape_backlog.len() - 1];
        let start = backlog.arena.len();
        backlog.arena.extend_from_slice(url);
        let range = start..backlog.arena.len();
        backlog.push_event(crate::EventKind::StartHyperlink(range));
    }

    backlog.inside_hyperlink = !backlog.inside_hyperlink;
    true
}

/// `ESC ] 0 ; <TITLE> BEL` — consumed, no event.
fn parse_set_window_title(backlog: &mut Backlog, fresh: &[u8], skip: &mut usize) -> bool {
    if !ensure_char(backlog, 3, fresh, skip) {
        return false;
    }
    if backlog.escape_backlog[3] != b';' {
        return consume_until_bel(backlog, 3, fresh, skip);
    }
    consume_until_bel(backlog, 4, fresh, skip)
}

/// Drain an OSC body to its BEL terminator and drop it.
fn consume_until_bel(backlog: &mut Backlog, mut it: usize, fresh: &[u8], skip: &mut usize) -> bool {
    loop {
        if !ensure_char(backlog, it, fresh, skip) {
            return false;
        }
        if backlog.escape_backlog[it] == BEL {
            return true;
        }
        it += 1;
    }
}

/// Attempt to process an escape sequence. Returns `true` if it was
/// processed, `false` if more input is needed to finish it.
pub(crate) fn process_escape_sequence(
    backlog: &mut Backlog,
    fresh: &[u8],
    skip: &mut usize,
) -> bool {
    if !ensure_char(backlog, 0, fresh, skip) {
        return false;
    }

    if backlog.escape_backlog[0] == b'\r' {
        loop {
            if !ensure_char(backlog, 1, fresh, skip) {
                return false;
            }

            // Ignore consecutive '\r's.
            if backlog.escape_backlog[1] == b'\r' {
                backlog.escape_backlog.pop();
                continue;
            }

            if backlog.escape_backlog[1] == b'\n' {
                // '\r\n' -> '\n'
                backlog.append_chunk(b"\n");
            } else {
                // '\rX' -> rewind to the line start, then reprocess X. Only
                // the rewind is gated; the CR itself is always consumed.
                if backlog.cr_clears_line {
                    let line_start = backlog.start_of_current_line();
                    backlog.truncate_to(line_start);
                }
                debug_assert!(*skip > 0);
                *skip -= 1;
            }
            return true;
        }
    }

    debug_assert_eq!(backlog.escape_backlog[0], 0x1b);

    if !ensure_char(backlog, 1, fresh, skip) {
        return false;
    }

    // Ignoring these messages.
    // ESC M = Move up one line.
    // ESC 7 = Save cursor, ESC 8 = Restore cursor.
    // ESC = = Disable numlock, ESC > = Enable numlock.
    // ESC H = Set tabstop at cursor's current column.
    let introducer = backlog.escape_backlog[1];
    if matches!(introducer, b'M' | b'7' | b'8' | b'=' | b'>' | b'H') {
        return true;
    }

    if introducer == b'[' {
        if !ensure_char(backlog, 2, fresh, skip) {
            return false;
        }

        if backlog.escape_backlog[2] == b'?' {
            let mut it = 3;

            let mut arg = -1i32;
            if !eat_number(backlog, &mut it, fresh, skip, &mut arg) {
                return false;
            }

            // Parse the high or low flag.
            if !ensure_char(backlog, it, fresh, skip) {
                return false;
            }
            let flag = backlog.escape_backlog[it];
            if flag != b'h' && flag != b'l' {
                let tail = backlog.escape_backlog[1..].to_vec();
                backlog.append_chunk(&tail);
                return true;
            }

            match arg {
                // Start/Stop Blinking, Show/Hide Cursor, Numlock,
                // 132/80 Columns, Alternate Screen Buffer.
                12 | 25 | 1 | 3 | 1049 => {}
                _ => {
                    trace!(target: "backlog.escape", mode = arg, "unknown private mode reemitted");
                    let tail = backlog.escape_backlog[1..].to_vec();
                    backlog.append_chunk(&tail);
                }
            }
            true
        } else if backlog.escape_backlog[2] == b'!' {
            if !ensure_char(backlog, 3, fresh, skip) {
                return false;
            }

            if backlog.escape_backlog[3] == b'p' {
                // Soft reset.
                backlog.set_graphics_rendition(reset());
            } else {
                // Undo skipping the unrecognized byte.
                debug_assert!(*skip > 0);
                *skip -= 1;
                backlog.append_chunk(b"[!");
            }
            true
        } else {
            let mut it = 2;
            let mut args = Vec::new();
            if !parse_args(backlog, &mut it, fresh, skip, &mut args) {
                return false;
            }

            if !ensure_char(backlog, it, fresh, skip) {
                return false;
            }

            // Ignoring these messages (this is probably fine).
            // ESC [ s              Save Cursor
            // ESC [ u              Restore Cursor
            //
            // ESC [ <n> A          Cursor Up
            // ESC [ <n> B          Cursor Down
            // ESC [ <n> D          Cursor Backward
            // ESC [ <n> E          Cursor Down Lines
            // ESC [ <n> F          Cursor Up Lines
            // ESC [ <n> G          Cursor Set Column
            // ESC [ <n> d          Cursor Set Row
            // ESC [ <n> l          Cursor Forward to Tabstop
            // ESC [ <n> Z          Cursor Backwards to Tabstop
            // ESC [ <n> S          Scroll Up
            // ESC [ <n> T          Scroll Down
            //
            // ESC [ <m> @          Insert Character
            // ESC [ <m> P          Delete Character
            // ESC [ <m> X          Erase Character
            // ESC [ <m> L          Insert Line
            // ESC [ <m> M          Delete Line
            // ESC [ <o> J          Erase in Display
            // ESC [ <o> K          Erase in Line
            //
            // ESC [ 0 g            Clear Tab Stop at Column
            // ESC [ 3 g            Clear All Tab Stops
            //
            // ESC [ <n> ; <b> r    Set Scrolling Region
            let fin = backlog.escape_backlog[it];
            match fin {
                b's' | b'u' | b'A' | b'B' | b'D' | b'E' | b'F' | b'G' | b'd' | b'l' | b'Z'
                | b'S' | b'T' | b'@' | b'P' | b'X' | b'L' | b'M' | b'J' | b'K' | b'g' | b'r' => {
                    true
                }

                // ESC [ 6 n (Report Cursor Position) and ESC [ 0 c (Report
                // Device Attributes) expect a reply on the child's input;
                // consumed and ignored here.
                b'n' | b'c' => {
                    trace!(target: "backlog.escape", final_byte = fin, "report request ignored");
                    true
                }

                // ESC [ <ns> m         Set Graphic Rendition
                b'm' => {
                    let graphics_rendition =
                        parse_graphics_rendition(&args, backlog.graphics_rendition);
                    backlog.set_graphics_rendition(graphics_rendition);
                    true
                }

                // ESC [ <y> ; <x> H/f  Cursor Set Position. Windows sends
                // ESC [ H instead of CR so the no-argument form rewinds to
                // the line start.
                b'H' | b'f' => {
                    if args.is_empty() {
                        let line_start = backlog.start_of_current_line();
                        backlog.truncate_to(line_start);
                    }
                    true
                }

                // ESC [ <n> C          Cursor Forward. conhost clears n
                // characters, resets the rendition, then moves forward n; we
                // count the move as inserting spaces.
                b'C' => {
                    if let Some(&count) = args.first() {
                        for _ in 0..count {
                            backlog.append_chunk(b" ");
                        }
                    }
                    true
                }

                _ => {
                    // Undo skipping the unrecognized byte and degrade the
                    // introducer to a literal.
                    debug_assert!(*skip > 0);
                    *skip -= 1;
                    backlog.append_chunk(b"[");
                    true
                }
            }
        }
    } else if introducer == b'(' {
        // Charset designation: consume the designator byte and ignore.
        if !ensure_char(backlog, 2, fresh, skip) {
            return false;
        }
        true
    } else if introducer == b']' {
        if !ensure_char(backlog, 2, fresh, skip) {
            return false;
        }

        match backlog.escape_backlog[2] {
            b'8' => parse_hyperlink(backlog, fresh, skip),
            b'0' => parse_set_window_title(backlog, fresh, skip),
            command => {
                trace!(target: "backlog.escape", command, "unknown osc consumed");
                consume_until_bel(backlog, 3, fresh, skip)
            }
        }
    } else {
        // Other two-byte escapes are consumed and dropped.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::parse_graphics_rendition;
    use crate::rendition::{
        GR_BACKGROUND_SHIFT, GR_BOLD, GR_BRIGHT, GR_FOREGROUND_SHIFT, GR_UNDERLINE, reset,
    };

    #[test]
    fn empty_args_reset() {
        assert_eq!(parse_graphics_rendition(&[], 0xdead), reset());
    }

    #[test]
    fn basic_colors() {
        let gr = parse_graphics_rendition(&[31], reset());
        assert_eq!((gr >> GR_FOREGROUND_SHIFT) & 0xff, 1);

        let gr = parse_graphics_rendition(&[44], reset());
        assert_eq!((gr >> GR_BACKGROUND_SHIFT) & 0xff, 4);
    }

    #[test]
    fn bright_colors_set_flag() {
        let gr = parse_graphics_rendition(&[92], reset());
        assert_eq!((gr >> GR_FOREGROUND_SHIFT) & 0xff, 2);
        assert_ne!(gr & GR_BRIGHT, 0);

        // Returning to the dim block clears the flag.
        let gr = parse_graphics_rendition(&[32], gr);
        assert_eq!(gr & GR_BRIGHT, 0);
    }

    #[test]
    fn default_codes_pick_defaults() {
        let gr = parse_graphics_rendition(&[39, 49], 0);
        assert_eq!((gr >> GR_FOREGROUND_SHIFT) & 0xff, 7);
        assert_eq!((gr >> GR_BACKGROUND_SHIFT) & 0xff, 0);
    }

    #[test]
    fn attributes_toggle() {
        let gr = parse_graphics_rendition(&[1, 4], reset());
        assert_ne!(gr & GR_BOLD, 0);
        assert_ne!(gr & GR_UNDERLINE, 0);
        let gr = parse_graphics_rendition(&[21, 24], gr);
        assert_eq!(gr & (GR_BOLD | GR_UNDERLINE), 0);
    }

    #[test]
    fn extended_256_color() {
        let gr = parse_graphics_rendition(&[38, 5, 208], reset());
        assert_eq!((gr >> GR_FOREGROUND_SHIFT) & 0xff, 208);
    }

    #[test]
    fn extended_truecolor_consumed_not_stored() {
        // The r;g;b triple is skipped whole; the color falls back to the
        // default for the ground, and trailing codes still apply.
        let gr = parse_graphics_rendition(&[38, 2, 10, 20, 30, 1], reset());
        assert_eq!((gr >> GR_FOREGROUND_SHIFT) & 0xff, 7);
        assert_ne!(gr & GR_BOLD, 0);
    }

    #[test]
    fn truncated_extended_color_falls_back() {
        let gr = parse_graphics_rendition(&[38, 5], reset());
        assert_eq!((gr >> GR_FOREGROUND_SHIFT) & 0xff, 7);
    }

    #[test]
    fn zero_resets_mid_list() {
        let gr = parse_graphics_rendition(&[31, 0], 0);
        assert_eq!(gr, reset());
    }

    #[test]
    fn unknown_codes_ignored() {
        assert_eq!(parse_graphics_rendition(&[53, 73], reset()), reset());
    }
}
