//! Reader and writer for the `key=value` property format used by
//! `patch.properties` and by the status records of the patch repository.
//!
//! The dialect follows the classic Java properties rules: `#`/`!` comments,
//! `=`/`:`/whitespace separators, backslash line continuations and the
//! `\t \n \r \f \uXXXX` escapes. Output escapes everything outside printable
//! ASCII so files stay readable by ISO-8859-1 consumers.

use std::fmt::Write as _;

use indexmap::IndexMap;

/// Insertion-ordered property set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    entries: IndexMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode raw bytes: UTF-8 when valid, otherwise one char per byte (Latin-1).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::parse(text),
            Err(_) => {
                let text: String = bytes.iter().map(|b| char::from(*b)).collect();
                Self::parse(&text)
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = IndexMap::new();
        for line in logical_lines(text) {
            let (key, value) = split_key_value(&line);
            entries.insert(unescape(&key), unescape(&value));
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render every entry as one `key=value` line, preceded by an optional comment.
    pub fn render(&self, comment: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(comment) = comment {
            for line in comment.lines() {
                out.push('#');
                out.push_str(line);
                out.push('\n');
            }
        }
        for (key, value) in &self.entries {
            escape_into(&mut out, key, true);
            out.push('=');
            escape_into(&mut out, value, false);
            out.push('\n');
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Join continuation lines and drop blanks and comments. Escapes are kept
/// intact so the key/value split can still see escaped separators.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Option<String> = None;

    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        let trimmed = match current {
            Some(_) => raw.trim_start_matches([' ', '\t', '\x0c']),
            None => {
                let trimmed = raw.trim_start_matches([' ', '\t', '\x0c']);
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                    continue;
                }
                trimmed
            }
        };

        let trailing = trimmed.chars().rev().take_while(|c| *c == '\\').count();
        let continues = trailing % 2 == 1;
        let content = if continues {
            &trimmed[..trimmed.len() - 1]
        } else {
            trimmed
        };

        let mut line = current.take().unwrap_or_default();
        line.push_str(content);
        if continues {
            current = Some(line);
        } else {
            lines.push(line);
        }
    }

    if let Some(line) = current {
        lines.push(line);
    }
    lines
}

fn split_key_value(line: &str) -> (String, String) {
    let mut key_end = line.len();
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\x0c' => {
                key_end = idx;
                break;
            }
            _ => {}
        }
    }

    let key = line[..key_end].to_string();
    let mut rest = line[key_end..].trim_start_matches([' ', '\t', '\x0c']);
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start_matches([' ', '\t', '\x0c']);
    }
    (key, rest.to_string())
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut pending_high: Option<u16> = None;

    while let Some(c) = chars.next() {
        if c != '\\' {
            flush_surrogate(&mut out, &mut pending_high);
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            break;
        };
        match next {
            't' => push_plain(&mut out, &mut pending_high, '\t'),
            'n' => push_plain(&mut out, &mut pending_high, '\n'),
            'r' => push_plain(&mut out, &mut pending_high, '\r'),
            'f' => push_plain(&mut out, &mut pending_high, '\x0c'),
            'u' => {
                let hex: String = (0..4).filter_map(|_| chars.next()).collect();
                match u16::from_str_radix(&hex, 16) {
                    Ok(unit) => push_utf16_unit(&mut out, &mut pending_high, unit),
                    Err(_) => {
                        flush_surrogate(&mut out, &mut pending_high);
                        out.push('u');
                        out.push_str(&hex);
                    }
                }
            }
            other => push_plain(&mut out, &mut pending_high, other),
        }
    }
    flush_surrogate(&mut out, &mut pending_high);
    out
}

fn push_plain(out: &mut String, pending_high: &mut Option<u16>, c: char) {
    flush_surrogate(out, pending_high);
    out.push(c);
}

fn push_utf16_unit(out: &mut String, pending_high: &mut Option<u16>, unit: u16) {
    if let Some(high) = pending_high.take() {
        if (0xDC00..0xE000).contains(&unit) {
            let decoded = char::decode_utf16([high, unit])
                .next()
                .and_then(Result::ok)
                .unwrap_or(char::REPLACEMENT_CHARACTER);
            out.push(decoded);
            return;
        }
        out.push(char::REPLACEMENT_CHARACTER);
    }
    if (0xD800..0xDC00).contains(&unit) {
        *pending_high = Some(unit);
    } else {
        out.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
    }
}

fn flush_surrogate(out: &mut String, pending_high: &mut Option<u16>) {
    if pending_high.take().is_some() {
        out.push(char::REPLACEMENT_CHARACTER);
    }
}

fn escape_into(out: &mut String, input: &str, is_key: bool) {
    for (idx, c) in input.chars().enumerate() {
        match c {
            ' ' if is_key || idx == 0 => out.push_str("\\ "),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x0c' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            other => {
                let mut units = [0u16; 2];
                for unit in other.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04X}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_separators_comments_and_continuations() {
        let props = Properties::parse(
            "# leading comment\n\
             ! bang comment\n\
             ID=p1\n\
             DESCRIPTION : a fix \\\n    spanning lines\n\
             ROLLBACK_ALLOWED true\n\
             \n\
             EMPTY=\n",
        );

        assert_eq!(props.get("ID"), Some("p1"));
        assert_eq!(props.get("DESCRIPTION"), Some("a fix spanning lines"));
        assert_eq!(props.get("ROLLBACK_ALLOWED"), Some("true"));
        assert_eq!(props.get("EMPTY"), Some(""));
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn handles_escapes_in_keys_and_values() {
        let props = Properties::parse("a\\=b=c\\td\nunicode=caf\\u00e9\r\npair=\\uD83D\\uDE00\n");
        assert_eq!(props.get("a=b"), Some("c\td"));
        assert_eq!(props.get("unicode"), Some("café"));
        assert_eq!(props.get("pair"), Some("😀"));
    }

    #[test]
    fn rendered_output_reads_back_identically() {
        let mut props = Properties::new();
        props.insert("STATUS_MSG", "line one\nline two: done = ok\n  indented\\path");
        props.insert("key with space", " leading");
        props.insert("LAST_MOD", "1700000000000");
        props.insert("text", "naïve ✓");

        let rendered = props.render(Some("patch status"));
        assert!(rendered.starts_with("#patch status\n"));
        assert!(rendered.is_ascii());
        assert_eq!(Properties::parse(&rendered), props);
    }

    #[test]
    fn latin1_bytes_are_accepted() {
        let props = Properties::from_bytes(b"DESCRIPTION=caf\xe9\n");
        assert_eq!(props.get("DESCRIPTION"), Some("café"));
    }
}
