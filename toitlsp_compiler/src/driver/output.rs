//! Parsers for the compiler's per-command stdout formats.

use std::collections::HashMap;
use std::io::{BufRead, Read};

use tower_lsp::lsp_types::{
    CompletionItem, CompletionItemKind, Diagnostic, DiagnosticRelatedInformation,
    DiagnosticSeverity, Location, Url,
};

use crate::error::{CompilerError, ParseError};
use crate::lineio::{read_count, read_int, read_line, read_lsp_range, read_uri, try_read_line};
use crate::summary::{self, Module};

const MESSAGE_TERMINATOR: &str = "*******************";

/// Result of an `ANALYZE` invocation.
#[derive(Debug, Default)]
pub struct AnalyzeResult {
    pub diagnostics: HashMap<Url, Vec<Diagnostic>>,
    /// Out-of-protocol messages from the compiler, e.g. about unreadable
    /// entry files.
    pub diagnostics_without_position: Vec<String>,
    pub summaries: HashMap<Url, Module>,
}

pub fn parse_analyze(reader: &mut impl BufRead) -> Result<AnalyzeResult, CompilerError> {
    let mut res = AnalyzeResult::default();
    let mut saw_summary = false;

    let mut in_group = false;
    let mut group_uri: Option<Url> = None;
    let mut group_diagnostic: Option<Diagnostic> = None;

    loop {
        let Some(line) = try_read_line(reader).map_err(CompilerError::Parse)? else {
            break;
        };
        match line.as_str() {
            "" => continue,
            "SUMMARY" => {
                if saw_summary {
                    return Err(CompilerError::Parse(ParseError::malformed(
                        "summary already filled",
                    )));
                }
                res.summaries = summary::text::parse_summaries(reader)?;
                saw_summary = true;
            }
            "START GROUP" => {
                if in_group {
                    return Err(CompilerError::Parse(ParseError::malformed(
                        "already in a diagnostics group",
                    )));
                }
                in_group = true;
            }
            "END GROUP" => {
                if let (Some(uri), Some(diagnostic)) = (group_uri.take(), group_diagnostic.take())
                {
                    res.diagnostics.entry(uri).or_default().push(diagnostic);
                }
                in_group = false;
            }
            "WITH POSITION" | "NO POSITION" => {
                let with_position = line == "WITH POSITION";
                let severity = severity_of(&read_line(reader)?);
                let mut location = None;
                if with_position {
                    let uri = read_uri(reader)?;
                    let range = read_lsp_range(reader)?;
                    location = Some((uri, range));
                }
                let mut message = String::new();
                loop {
                    let part = read_line(reader)?;
                    if part == MESSAGE_TERMINATOR {
                        break;
                    }
                    message.push_str(&part);
                }

                match location {
                    None => res.diagnostics_without_position.push(message),
                    Some((uri, range)) if !in_group => {
                        res.diagnostics.entry(uri).or_default().push(Diagnostic {
                            range,
                            severity: Some(severity),
                            message,
                            ..Diagnostic::default()
                        });
                    }
                    Some((uri, range)) if group_uri.is_none() => {
                        // First positioned diagnostic in the group is its
                        // head; the rest become related information.
                        group_uri = Some(uri);
                        group_diagnostic = Some(Diagnostic {
                            range,
                            severity: Some(severity),
                            message,
                            ..Diagnostic::default()
                        });
                    }
                    Some((uri, range)) => {
                        let head = group_diagnostic
                            .as_mut()
                            .expect("group head must exist once the group uri is set");
                        head.related_information
                            .get_or_insert_with(Vec::new)
                            .push(DiagnosticRelatedInformation {
                                location: Location { uri, range },
                                message,
                            });
                    }
                }
            }
            other => {
                return Err(CompilerError::protocol(format!(
                    "unexpected line from compiler: {other}"
                )));
            }
        }
    }

    Ok(res)
}

fn severity_of(word: &str) -> DiagnosticSeverity {
    match word {
        "error" => DiagnosticSeverity::ERROR,
        "information" => DiagnosticSeverity::INFORMATION,
        // The compiler also emits "hint"; both fold into warnings.
        _ => DiagnosticSeverity::WARNING,
    }
}

pub fn parse_goto_definition(reader: &mut impl BufRead) -> Result<Vec<Location>, ParseError> {
    let mut res = Vec::new();
    loop {
        let Some(line) = try_read_line(reader)? else {
            return Ok(res);
        };
        let uri = crate::uri::path_to_uri(&crate::path::from_compiler_path(&line))?;
        let range = read_lsp_range(reader)?;
        res.push(Location { uri, range });
    }
}

pub fn parse_completions(reader: &mut impl BufRead) -> Result<Vec<CompletionItem>, ParseError> {
    let mut res = Vec::new();
    loop {
        let Some(label) = try_read_line(reader)? else {
            return Ok(res);
        };
        let kind = read_int(reader)?;
        res.push(CompletionItem {
            label,
            kind: completion_kind(kind),
            ..CompletionItem::default()
        });
    }
}

fn completion_kind(value: i64) -> Option<CompletionItemKind> {
    Some(match value {
        1 => CompletionItemKind::TEXT,
        2 => CompletionItemKind::METHOD,
        3 => CompletionItemKind::FUNCTION,
        4 => CompletionItemKind::CONSTRUCTOR,
        5 => CompletionItemKind::FIELD,
        6 => CompletionItemKind::VARIABLE,
        7 => CompletionItemKind::CLASS,
        8 => CompletionItemKind::INTERFACE,
        9 => CompletionItemKind::MODULE,
        10 => CompletionItemKind::PROPERTY,
        11 => CompletionItemKind::UNIT,
        12 => CompletionItemKind::VALUE,
        13 => CompletionItemKind::ENUM,
        14 => CompletionItemKind::KEYWORD,
        15 => CompletionItemKind::SNIPPET,
        16 => CompletionItemKind::COLOR,
        17 => CompletionItemKind::FILE,
        18 => CompletionItemKind::REFERENCE,
        19 => CompletionItemKind::FOLDER,
        20 => CompletionItemKind::ENUM_MEMBER,
        21 => CompletionItemKind::CONSTANT,
        22 => CompletionItemKind::STRUCT,
        23 => CompletionItemKind::EVENT,
        24 => CompletionItemKind::OPERATOR,
        25 => CompletionItemKind::TYPE_PARAMETER,
        _ => return None,
    })
}

pub fn parse_semantic_tokens(reader: &mut impl BufRead) -> Result<Vec<u32>, ParseError> {
    let count = read_count(reader)?;
    let mut res = Vec::with_capacity(count);
    for _ in 0..count {
        res.push(read_int(reader)? as u32);
    }
    Ok(res)
}

pub fn parse_snapshot_bundle(reader: &mut impl BufRead) -> Result<Vec<u8>, CompilerError> {
    let status = read_line(reader).map_err(CompilerError::Parse)?;
    if status != "OK" {
        return Err(CompilerError::protocol(format!(
            "failed to generate snapshot, status: {status}"
        )));
    }
    let size = read_int(reader).map_err(CompilerError::Parse)?;
    let mut res = Vec::new();
    reader.read_to_end(&mut res).map_err(ParseError::Io)?;
    if res.len() as i64 != size {
        return Err(CompilerError::protocol(format!(
            "snapshot bundle was corrupted: read {} bytes, expected {size}",
            res.len()
        )));
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn analyze(text: &str) -> AnalyzeResult {
        parse_analyze(&mut Cursor::new(text.as_bytes())).unwrap()
    }

    #[test]
    fn parses_positioned_diagnostics() {
        let text = "WITH POSITION\nerror\n/a.toit\n1\n2\n1\n5\nsomething is wrong\n\
                    *******************\n";
        let res = analyze(text);
        let uri = Url::parse("file:///a.toit").unwrap();
        let diags = &res.diagnostics[&uri];
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "something is wrong");
        assert_eq!(diags[0].severity, Some(DiagnosticSeverity::ERROR));
        assert_eq!(diags[0].range.start.line, 1);
        assert_eq!(diags[0].range.end.character, 5);
    }

    #[test]
    fn groups_attach_related_information() {
        let text = "START GROUP\n\
                    WITH POSITION\nwarning\n/a.toit\n0\n0\n0\n1\nhead\n*******************\n\
                    WITH POSITION\nwarning\n/b.toit\n2\n0\n2\n1\nrelated\n*******************\n\
                    END GROUP\n";
        let res = analyze(text);
        let uri = Url::parse("file:///a.toit").unwrap();
        let head = &res.diagnostics[&uri][0];
        assert_eq!(head.message, "head");
        let related = head.related_information.as_ref().unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].message, "related");
        assert_eq!(related[0].location.uri.as_str(), "file:///b.toit");
    }

    #[test]
    fn collects_positionless_diagnostics() {
        let res = analyze("NO POSITION\nerror\nno such file\n*******************\n");
        assert_eq!(res.diagnostics_without_position, vec!["no such file"]);
        assert!(res.diagnostics.is_empty());
    }

    #[test]
    fn unexpected_lines_are_protocol_errors() {
        let err = parse_analyze(&mut Cursor::new(b"GARBAGE\n".to_vec())).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn parses_goto_definition_locations() {
        let text = "/a.toit\n1\n2\n3\n4\n";
        let locations = parse_goto_definition(&mut Cursor::new(text.as_bytes())).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].uri.as_str(), "file:///a.toit");
        assert_eq!(locations[0].range.end.character, 4);
    }

    #[test]
    fn parses_completions() {
        let text = "print\n3\nclass-name\n7\n";
        let items = parse_completions(&mut Cursor::new(text.as_bytes())).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label, "print");
        assert_eq!(items[0].kind, Some(CompletionItemKind::FUNCTION));
        assert_eq!(items[1].kind, Some(CompletionItemKind::CLASS));
    }

    #[test]
    fn parses_semantic_tokens() {
        let tokens =
            parse_semantic_tokens(&mut Cursor::new(b"5\n0\n1\n3\n2\n0\n".to_vec())).unwrap();
        assert_eq!(tokens, vec![0, 1, 3, 2, 0]);
    }

    #[test]
    fn snapshot_bundle_verifies_size() {
        let bytes = parse_snapshot_bundle(&mut Cursor::new(b"OK\n4\nabcd".to_vec())).unwrap();
        assert_eq!(bytes, b"abcd");

        let err = parse_snapshot_bundle(&mut Cursor::new(b"OK\n5\nabcd".to_vec())).unwrap_err();
        assert!(err.is_protocol());

        let err = parse_snapshot_bundle(&mut Cursor::new(b"FAIL\n".to_vec())).unwrap_err();
        assert!(err.is_protocol());
    }
}
