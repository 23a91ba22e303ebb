//! Line-oriented readers shared by the output parsers.
//!
//! The compiler's textual protocols are LF-terminated UTF-8 lines, with
//! the occasional size-prefixed blob that may itself contain newlines.

use std::io::{BufRead, Read};

use tower_lsp::lsp_types::{Position, Range, Url};

use crate::error::ParseError;
use crate::path;
use crate::uri;

/// Reads one LF-terminated line, without the terminator.
/// A clean EOF before any byte is `ParseError::UnexpectedEof`.
pub fn read_line(reader: &mut impl BufRead) -> Result<String, ParseError> {
    match try_read_line(reader)? {
        Some(line) => Ok(line),
        None => Err(ParseError::UnexpectedEof),
    }
}

/// Like [`read_line`], but a clean EOF yields `None`.
pub fn try_read_line(reader: &mut impl BufRead) -> Result<Option<String>, ParseError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| ParseError::malformed(format!("invalid utf-8 in compiler output: {e}")))
}

pub fn read_int(reader: &mut impl BufRead) -> Result<i64, ParseError> {
    let line = read_line(reader)?;
    line.parse()
        .map_err(|_| ParseError::malformed(format!("expected an integer, got '{line}'")))
}

pub fn read_count(reader: &mut impl BufRead) -> Result<usize, ParseError> {
    let n = read_int(reader)?;
    usize::try_from(n).map_err(|_| ParseError::malformed(format!("expected a count, got {n}")))
}

/// Reads a compiler-form path line and converts it to a document URI.
pub fn read_uri(reader: &mut impl BufRead) -> Result<Url, ParseError> {
    let line = read_line(reader)?;
    uri::path_to_uri(&path::from_compiler_path(&line))
}

/// Reads four integer lines: from-line, from-character, to-line, to-character.
pub fn read_lsp_range(reader: &mut impl BufRead) -> Result<Range, ParseError> {
    let from_line = read_int(reader)?;
    let from_char = read_int(reader)?;
    let to_line = read_int(reader)?;
    let to_char = read_int(reader)?;
    Ok(Range {
        start: Position::new(from_line as u32, from_char as u32),
        end: Position::new(to_line as u32, to_char as u32),
    })
}

/// Reads a size-prefixed string: `<size>\n<size bytes>\n`. The payload may
/// span newlines.
pub fn read_sized(reader: &mut impl BufRead) -> Result<String, ParseError> {
    let size = read_count(reader)?;
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    let mut terminator = [0u8; 1];
    reader.read_exact(&mut terminator)?;
    String::from_utf8(buf)
        .map_err(|e| ParseError::malformed(format!("invalid utf-8 in sized string: {e}")))
}
