//! Byte-level tokenization for HTTP/1.x message heads. All functions operate
//! on the connection's receive buffer or on a single parsed line; none of
//! them allocate.

use crate::net::buffer::NetBuffer;

#[inline]
pub fn is_whitespace(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

/// RFC 2616 token characters: printable ASCII minus separators.
#[inline]
pub fn is_token_char(byte: u8) -> bool {
    match byte {
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'['
        | b']' | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t' => false,
        0x21..=0x7e => true,
        _ => false,
    }
}

/// Skips any CR/LF bytes at the read cursor. Empty lines before a request
/// line are tolerated.
pub fn skip_crlf(buf: &mut NetBuffer) {
    loop {
        let advance = match buf.read_slice().first() {
            Some(&b'\r') | Some(&b'\n') => true,
            _ => false,
        };
        if !advance {
            return;
        }
        buf.advance_read(1);
    }
}

/// Consumes one line, LF-terminated with an optional preceding CR, and
/// returns its contents without the terminator. Returns `None` when the
/// buffer holds no complete line yet.
pub fn parse_line<'a>(buf: &'a mut NetBuffer) -> Option<&'a [u8]> {
    let (length, consumed) = {
        let slice = buf.read_slice();
        let lf = slice.iter().position(|&byte| byte == b'\n')?;
        let length = match lf > 0 && slice[lf - 1] == b'\r' {
            true => lf - 1,
            false => lf,
        };
        (length, lf + 1)
    };

    let start = buf.read_pos();
    buf.advance_read(consumed);
    Some(&buf.storage()[start..start + length])
}

/// Index of the first non-whitespace byte at or after `pos`.
pub fn skip_whitespace(line: &[u8], mut pos: usize) -> usize {
    while pos < line.len() && is_whitespace(line[pos]) {
        pos += 1;
    }
    pos
}

/// Parses a whitespace-delimited word, skipping leading whitespace. Returns
/// the word and the position just past it.
pub fn parse_word(line: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let start = skip_whitespace(line, pos);
    let mut end = start;
    while end < line.len() && !is_whitespace(line[end]) {
        end += 1;
    }

    match end > start {
        true => Some((&line[start..end], end)),
        false => None,
    }
}

/// Parses a run of token characters starting exactly at `pos`. Returns the
/// token and the position just past it.
pub fn parse_token(line: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let mut end = pos;
    while end < line.len() && is_token_char(line[end]) {
        end += 1;
    }

    match end > pos {
        true => Some((&line[pos..end], end)),
        false => None,
    }
}

/// The text from `pos` to the end of the line, with surrounding whitespace
/// trimmed.
pub fn parse_text(line: &[u8], pos: usize) -> &[u8] {
    let start = skip_whitespace(line, pos);
    let mut end = line.len();
    while end > start && is_whitespace(line[end - 1]) {
        end -= 1;
    }
    &line[start..end]
}

/// Parses an `HTTP/1.<minor>` version word. Any other protocol or major
/// version yields `None`.
pub fn parse_version(word: &[u8]) -> Option<u8> {
    const PREFIX: &[u8] = b"HTTP/1.";

    if word.len() <= PREFIX.len() || &word[..PREFIX.len()] != PREFIX {
        return None;
    }

    let digits = &word[PREFIX.len()..];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    std::str::from_utf8(digits).ok()?.parse().ok()
}
