//! Line indexing and pattern-filtered extraction over fixture documents.
//!
//! The original document and a filtered excerpt are two independently
//! indexed texts. The per-case line delta between them is recorded here and
//! applied only when diagnostics are rendered; line numbers are never
//! rewritten earlier in the pipeline.

use anyhow::{bail, Context, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Case name mapped to the 1-based line where its name token first occurs.
pub type LineIndex = BTreeMap<String, usize>;

/// Result of extracting the cases whose names match a pattern.
#[derive(Debug, Default)]
pub struct FilteredFixture {
    /// The extracted blocks, joined with one blank line and trimmed. Empty
    /// when nothing matched.
    pub text: String,
    /// Included case names, in original document order.
    pub included: Vec<String>,
    /// Per-case `original_line - filtered_line`, for mapping a diagnostic's
    /// reported line back to the file the user edits.
    pub line_adjustments: BTreeMap<String, i64>,
}

/// Map every case name in a fixture document to its source line.
///
/// The document is parsed structurally to obtain the case name set; the
/// recorded line is found by scanning raw lines for the first occurrence of
/// the name token, so the index stays consistent with the literal text.
pub fn index_case_lines(text: &str) -> Result<LineIndex> {
    let names = case_names(text)?;
    let mut index = LineIndex::new();
    for (idx, line) in text.lines().enumerate() {
        if index.len() == names.len() {
            break;
        }
        for name in &names {
            if !index.contains_key(name) && line_has_token(line, name) {
                index.insert(name.clone(), idx + 1);
            }
        }
    }
    Ok(index)
}

/// Extract every case whose name contains `pattern` as a substring.
///
/// A case's block starts at its indexed line, extended backward over any
/// immediately preceding blank or comment lines so leading commentary stays
/// attached, and ends before the next case's block (by original line order)
/// or at document end. Matching zero cases is not an error here; the caller
/// decides whether that is fatal.
pub fn filter_by_pattern(text: &str, pattern: &str) -> Result<FilteredFixture> {
    let index = index_case_lines(text)?;
    let mut ordered: Vec<(String, usize)> = index
        .iter()
        .map(|(name, line)| (name.clone(), *line))
        .collect();
    ordered.sort_by_key(|(_, line)| *line);

    let lines: Vec<&str> = text.lines().collect();
    let starts: Vec<usize> = ordered
        .iter()
        .map(|(_, line)| {
            let mut start = *line;
            while start > 1 {
                let prev = lines[start - 2].trim();
                if prev.is_empty() || prev.starts_with('#') {
                    start -= 1;
                } else {
                    break;
                }
            }
            start
        })
        .collect();

    let mut included = Vec::new();
    let mut blocks = Vec::new();
    for (i, (name, _)) in ordered.iter().enumerate() {
        if !name.contains(pattern) {
            continue;
        }
        let start = starts[i];
        let end = if i + 1 < ordered.len() {
            starts[i + 1] - 1
        } else {
            lines.len()
        };
        let mut block: Vec<&str> = lines[start - 1..end].to_vec();
        // Leading blanks add nothing to a block and would drift the joined
        // text's line numbers; attached comments stay.
        while block.first().is_some_and(|line| line.trim().is_empty()) {
            block.remove(0);
        }
        while block.last().is_some_and(|line| line.trim().is_empty()) {
            block.pop();
        }
        blocks.push(block.join("\n"));
        included.push(name.clone());
    }

    if included.is_empty() {
        return Ok(FilteredFixture::default());
    }

    let filtered_text = blocks.join("\n\n").trim().to_string();
    let filtered_index = index_case_lines(&filtered_text)?;
    let mut line_adjustments = BTreeMap::new();
    for name in &included {
        let original = index[name] as i64;
        let filtered = filtered_index.get(name).copied().unwrap_or(index[name]) as i64;
        line_adjustments.insert(name.clone(), original - filtered);
    }

    Ok(FilteredFixture {
        text: filtered_text,
        included,
        line_adjustments,
    })
}

fn case_names(text: &str) -> Result<Vec<String>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: Value = serde_yaml::from_str(text).context("parse fixture document")?;
    match doc {
        Value::Null => Ok(Vec::new()),
        Value::Mapping(map) => Ok(map
            .keys()
            .filter_map(|key| key.as_str().map(String::from))
            .collect()),
        _ => bail!("fixture document is not a mapping of test cases"),
    }
}

fn line_has_token(line: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let bytes = line.as_bytes();
    let mut from = 0;
    while let Some(pos) = line[from..].find(name) {
        let at = from + pos;
        let end = at + name.len();
        let before_ok = at == 0 || !is_word_byte(bytes[at - 1]);
        let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        from = end;
    }
    false
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}
