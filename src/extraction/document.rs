//! Document kind detection and plain-text extraction for non-PDF formats.
//!
//! PDFs go to the model as-is. Word and RTF documents are reduced to text
//! first, since the Messages API only accepts PDF and plain-text documents.

use std::io::{Cursor, Read};

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::ExtractionError;
use crate::pipeline::admission::extension_of;

/// Upper bound on text handed to the model.
const MAX_TEXT_CHARS: usize = 120_000;
/// Shortest printable run kept when scraping legacy `.doc` binaries.
const MIN_DOC_RUN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Doc,
    Rtf,
}

impl DocumentKind {
    /// Sniff magic bytes first, then fall back to media type and extension.
    pub fn detect(filename: &str, media_type: &str, bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            return Some(Self::Pdf);
        }
        if bytes.starts_with(b"{\\rtf") {
            return Some(Self::Rtf);
        }
        if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
            return Some(Self::Doc);
        }

        let media = media_type.to_lowercase();
        let from_media = if media.contains("pdf") {
            Some(Self::Pdf)
        } else if media.contains("wordprocessingml") {
            Some(Self::Docx)
        } else if media.contains("msword") {
            Some(Self::Doc)
        } else if media.contains("rtf") {
            Some(Self::Rtf)
        } else {
            None
        };
        if from_media.is_some() {
            return from_media;
        }

        match extension_of(filename).as_deref() {
            Some("pdf") => Some(Self::Pdf),
            Some("docx") => Some(Self::Docx),
            Some("doc") => Some(Self::Doc),
            Some("rtf") => Some(Self::Rtf),
            _ if bytes.starts_with(b"PK\x03\x04") => Some(Self::Docx),
            _ => None,
        }
    }
}

/// Extract readable text from a non-PDF document.
pub fn document_text(kind: DocumentKind, filename: &str, bytes: &[u8]) -> Result<String, ExtractionError> {
    let unreadable = |reason: String| ExtractionError::UnreadableDocument {
        filename: filename.to_string(),
        reason,
    };

    let text = match kind {
        DocumentKind::Pdf => return Err(unreadable("PDF is sent without text extraction".into())),
        DocumentKind::Docx => docx_text(bytes).map_err(unreadable)?,
        DocumentKind::Rtf => rtf_text(&String::from_utf8_lossy(bytes)),
        DocumentKind::Doc => doc_text(bytes),
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(unreadable("no text found".into()));
    }
    Ok(text.chars().take(MAX_TEXT_CHARS).collect())
}

fn docx_text(bytes: &[u8]) -> Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("not a zip archive: {e}"))?;
    let mut document_xml = archive
        .by_name("word/document.xml")
        .map_err(|e| format!("missing word/document.xml: {e}"))?;

    let mut xml = String::new();
    document_xml
        .read_to_string(&mut xml)
        .map_err(|e| format!("failed to read document.xml: {e}"))?;

    parse_document_xml(&xml)
}

/// Collect `<w:t>` runs, one line per paragraph, tabs and breaks preserved.
fn parse_document_xml(xml: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut text = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"tab" => text.push('\t'),
                b"br" | b"cr" => text.push('\n'),
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => text.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parse error: {e}")),
            _ => {}
        }
    }
    Ok(text)
}

/// RTF destinations whose contents are never body text.
const RTF_SKIP_DESTINATIONS: &[&str] = &[
    "fonttbl", "colortbl", "stylesheet", "info", "pict", "header", "footer", "listtable",
    "listoverridetable", "rsidtbl", "generator", "themedata", "datastore", "latentstyles",
];

/// Strip control words and groups, keeping body text.
fn rtf_text(rtf: &str) -> String {
    let chars: Vec<char> = rtf.chars().collect();
    let mut out = String::new();
    // Depth at which a skipped destination started, if inside one.
    let mut skip_from: Option<usize> = None;
    let mut depth = 0usize;
    // Characters to drop after \uN (the ANSI fallback).
    let mut uc_skip = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' => {
                depth += 1;
                i += 1;
                if skip_from.is_none() && chars.get(i) == Some(&'\\') && chars.get(i + 1) == Some(&'*') {
                    skip_from = Some(depth);
                }
            }
            '}' => {
                if skip_from == Some(depth) {
                    skip_from = None;
                }
                depth = depth.saturating_sub(1);
                i += 1;
            }
            '\\' => {
                i += 1;
                let Some(&next) = chars.get(i) else { break };
                if matches!(next, '\\' | '{' | '}') {
                    if skip_from.is_none() {
                        out.push(next);
                    }
                    i += 1;
                    continue;
                }
                if next == '\'' {
                    let hex: String = chars.iter().skip(i + 1).take(2).collect();
                    i += 3;
                    if skip_from.is_none() {
                        if uc_skip > 0 {
                            uc_skip -= 1;
                        } else if let Ok(b) = u8::from_str_radix(&hex, 16) {
                            out.push(char::from(b));
                        }
                    }
                    continue;
                }
                if !next.is_ascii_alphabetic() {
                    // Control symbol such as \~ or \-
                    if skip_from.is_none() && next == '~' {
                        out.push(' ');
                    }
                    i += 1;
                    continue;
                }

                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let num_start = i;
                if i < chars.len() && (chars[i] == '-' || chars[i].is_ascii_digit()) {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let param: Option<i32> = chars[num_start..i].iter().collect::<String>().parse().ok();
                if chars.get(i) == Some(&' ') {
                    i += 1;
                }

                if skip_from.is_some() {
                    continue;
                }
                if RTF_SKIP_DESTINATIONS.contains(&word.as_str()) {
                    skip_from = Some(depth);
                    continue;
                }
                match word.as_str() {
                    "par" | "line" | "sect" | "page" => out.push('\n'),
                    "tab" | "cell" => out.push('\t'),
                    "row" => out.push('\n'),
                    "u" => {
                        if let Some(code) = param {
                            let code = if code < 0 { code + 65536 } else { code };
                            if let Some(ch) = u32::try_from(code).ok().and_then(char::from_u32) {
                                out.push(ch);
                            }
                            uc_skip = 1;
                        }
                    }
                    _ => {}
                }
            }
            '\r' | '\n' => i += 1,
            _ => {
                if skip_from.is_none() {
                    if uc_skip > 0 {
                        uc_skip -= 1;
                    } else {
                        out.push(c);
                    }
                }
                i += 1;
            }
        }
    }
    out
}

/// Best-effort text scrape of a Word 97-2003 binary: printable runs from
/// both the 8-bit and UTF-16LE encodings.
fn doc_text(bytes: &[u8]) -> String {
    let mut runs: Vec<String> = Vec::new();

    let mut current = String::new();
    for &b in bytes {
        if b == b'\t' || b == b'\r' || (0x20..0x7f).contains(&b) {
            current.push(if b == b'\r' { '\n' } else { char::from(b) });
        } else {
            flush_run(&mut current, &mut runs);
        }
    }
    flush_run(&mut current, &mut runs);

    for pair in bytes.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        match char::from_u32(u32::from(unit)) {
            Some(ch) if pair[1] == 0 && (ch == '\r' || (' '..='~').contains(&ch)) => {
                current.push(if ch == '\r' { '\n' } else { ch });
            }
            Some(ch) if (0x00c0..0x0250).contains(&unit) && ch.is_alphabetic() => current.push(ch),
            _ => flush_run(&mut current, &mut runs),
        }
    }
    flush_run(&mut current, &mut runs);

    runs.join("\n")
}

fn flush_run(current: &mut String, runs: &mut Vec<String>) {
    let trimmed = current.trim();
    let letters = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    if trimmed.chars().count() >= MIN_DOC_RUN && letters * 2 >= trimmed.chars().count() {
        runs.push(trimmed.to_string());
    }
    current.clear();
}
