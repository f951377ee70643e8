//! Compact indent-based serialisation for model prompts and inter-agent
//! call envelopes. Two-space indentation expresses nesting, `key: value`
//! for mappings, `- item` for sequence items, `|` introduces a multi-line
//! string block. Mapping key order is preserved, so encoding the same
//! value always yields the same prompt text.
//!
//! Never used for persistent storage.

use serde_json::{Map, Number, Value};

use crate::error::{EngineError, Result};

/// Nesting cap for both directions. `serde_json::Value` cannot form a
/// reference cycle, so runaway depth is the observable shape a cycle
/// would take; the encoder reports it as one.
const MAX_DEPTH: usize = 128;

pub fn encode(value: &Value) -> Result<String> {
    let mut out = String::new();
    encode_node(value, 0, &mut out)?;
    Ok(out)
}

pub fn decode(text: &str) -> Result<Value> {
    let lines = collect_lines(text)?;
    if lines.is_empty() {
        return Err(EngineError::BadRequest("empty document".into()));
    }
    let mut pos = 0;
    let value = parse_block(&lines, &mut pos, 0, 0)?;
    if pos != lines.len() {
        return Err(EngineError::BadRequest(format!(
            "trailing content at line {}",
            lines[pos].number
        )));
    }
    Ok(value)
}

/// Rough token estimate, one token per four bytes. Used for conversation
/// and prompt budgeting.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

// ── encoding ──

fn depth_guard(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(EngineError::CycleDetected(format!(
            "nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    Ok(())
}

fn encode_node(value: &Value, depth: usize, out: &mut String) -> Result<()> {
    depth_guard(depth)?;
    match value {
        Value::Object(map) if !map.is_empty() => encode_map(map, depth, out),
        Value::Array(items) if !items.is_empty() => encode_seq(items, depth, out),
        other => {
            // Bare scalar (or empty container) document.
            push_indent(depth, out);
            out.push_str(&scalar_text(other));
            out.push('\n');
            Ok(())
        }
    }
}

fn encode_map(map: &Map<String, Value>, depth: usize, out: &mut String) -> Result<()> {
    depth_guard(depth)?;
    for (key, value) in map {
        push_indent(depth, out);
        out.push_str(&key_text(key));
        out.push(':');
        encode_entry_value(value, depth, out)?;
    }
    Ok(())
}

fn encode_seq(items: &[Value], depth: usize, out: &mut String) -> Result<()> {
    depth_guard(depth)?;
    for item in items {
        push_indent(depth, out);
        out.push('-');
        encode_entry_value(item, depth, out)?;
    }
    Ok(())
}

/// Emit the value side of a `key:` or `-` entry, choosing between inline
/// scalar, block scalar, and nested block.
fn encode_entry_value(value: &Value, depth: usize, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) if !map.is_empty() => {
            out.push('\n');
            encode_map(map, depth + 1, out)
        }
        Value::Array(items) if !items.is_empty() => {
            out.push('\n');
            encode_seq(items, depth + 1, out)
        }
        Value::String(s) if wants_block(s) => {
            out.push_str(" |\n");
            for line in s.split('\n') {
                push_indent(depth + 1, out);
                out.push_str(line);
                out.push('\n');
            }
            Ok(())
        }
        other => {
            out.push(' ');
            out.push_str(&scalar_text(other));
            out.push('\n');
            Ok(())
        }
    }
}

fn push_indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_text(n),
        Value::String(s) => {
            if plain_string_ok(s) {
                s.clone()
            } else {
                // JSON quoting keeps ambiguous strings lossless.
                serde_json::to_string(s).unwrap_or_default()
            }
        }
        Value::Object(_) => "{}".to_string(),
        Value::Array(_) => "[]".to_string(),
    }
}

fn number_text(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(f) = n.as_f64() {
        let text = f.to_string();
        // Keep integral doubles distinguishable from integers.
        if !text.contains('.') && !text.contains('e') && !text.contains('E') {
            return format!("{text}.0");
        }
        return text;
    }
    n.to_string()
}

/// A string may be written bare only when reading it back cannot be
/// mistaken for another scalar kind or for markup.
fn plain_string_ok(s: &str) -> bool {
    if s.is_empty() || s.contains('\n') {
        return false;
    }
    if s.trim() != s {
        return false;
    }
    if matches!(s, "null" | "true" | "false" | "{}" | "[]" | "|" | "-") {
        return false;
    }
    if s.starts_with("- ") || s.starts_with('"') {
        return false;
    }
    if s.contains(':') {
        return false;
    }
    if s.parse::<f64>().is_ok() {
        return false;
    }
    true
}

fn key_text(key: &str) -> String {
    let plain = !key.is_empty()
        && key.trim() == key
        && !key.contains(':')
        && !key.contains('\n')
        && !key.starts_with('"')
        && !key.starts_with('-');
    if plain {
        key.to_string()
    } else {
        serde_json::to_string(key).unwrap_or_default()
    }
}

/// Block scalars carry multi-line strings whose every line survives the
/// indent round trip; anything else falls back to JSON quoting.
fn wants_block(s: &str) -> bool {
    s.contains('\n')
        && !s.ends_with('\n')
        && s.split('\n')
            .all(|line| !line.is_empty() && line.trim_end() == line && line.trim_start() == line)
}

// ── decoding ──

struct Line<'a> {
    indent: usize,
    content: &'a str,
    number: usize,
}

fn collect_lines(text: &str) -> Result<Vec<Line<'_>>> {
    let mut lines = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let spaces = raw.len() - raw.trim_start_matches(' ').len();
        if spaces % 2 != 0 {
            return Err(EngineError::BadRequest(format!(
                "odd indentation at line {}",
                idx + 1
            )));
        }
        lines.push(Line {
            indent: spaces / 2,
            content: &raw[spaces..],
            number: idx + 1,
        });
    }
    Ok(lines)
}

fn parse_block(lines: &[Line<'_>], pos: &mut usize, level: usize, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(EngineError::BadRequest("document nests too deeply".into()));
    }
    let first = &lines[*pos];
    if first.indent != level {
        return Err(EngineError::BadRequest(format!(
            "unexpected indentation at line {}",
            first.number
        )));
    }
    if first.content == "-" || first.content.starts_with("- ") {
        parse_seq(lines, pos, level, depth)
    } else if first.content.contains(':') {
        parse_map(lines, pos, level, depth)
    } else {
        // Bare scalar document.
        let value = parse_scalar(first.content, first.number)?;
        *pos += 1;
        Ok(value)
    }
}

fn parse_seq(lines: &[Line<'_>], pos: &mut usize, level: usize, depth: usize) -> Result<Value> {
    let mut items = Vec::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent < level {
            break;
        }
        if line.indent != level || !(line.content == "-" || line.content.starts_with("- ")) {
            return Err(EngineError::BadRequest(format!(
                "expected sequence item at line {}",
                line.number
            )));
        }
        if line.content == "-" {
            *pos += 1;
            if *pos >= lines.len() || lines[*pos].indent <= level {
                return Err(EngineError::BadRequest(format!(
                    "sequence item at line {} has no body",
                    line.number
                )));
            }
            items.push(parse_block(lines, pos, level + 1, depth + 1)?);
        } else {
            let rest = &line.content[2..];
            if rest == "|" {
                *pos += 1;
                items.push(Value::String(parse_block_scalar(lines, pos, level + 1)?));
            } else {
                items.push(parse_scalar(rest, line.number)?);
                *pos += 1;
            }
        }
    }
    Ok(Value::Array(items))
}

fn parse_map(lines: &[Line<'_>], pos: &mut usize, level: usize, depth: usize) -> Result<Value> {
    let mut map = Map::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent < level {
            break;
        }
        if line.indent != level || line.content.starts_with("- ") || line.content == "-" {
            return Err(EngineError::BadRequest(format!(
                "expected mapping entry at line {}",
                line.number
            )));
        }
        let (key, rest) = split_key(line.content, line.number)?;
        if rest.is_empty() {
            *pos += 1;
            if *pos >= lines.len() || lines[*pos].indent <= level {
                return Err(EngineError::BadRequest(format!(
                    "mapping entry at line {} has no value",
                    line.number
                )));
            }
            map.insert(key, parse_block(lines, pos, level + 1, depth + 1)?);
        } else if rest == "|" {
            *pos += 1;
            map.insert(key, Value::String(parse_block_scalar(lines, pos, level + 1)?));
        } else {
            map.insert(key, parse_scalar(rest, line.number)?);
            *pos += 1;
        }
    }
    Ok(Value::Object(map))
}

fn parse_block_scalar(lines: &[Line<'_>], pos: &mut usize, level: usize) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    while *pos < lines.len() && lines[*pos].indent >= level {
        // Indentation deeper than the block level keeps its extra spaces.
        let extra = (lines[*pos].indent - level) * 2;
        parts.push(format!("{}{}", " ".repeat(extra), lines[*pos].content));
        *pos += 1;
    }
    if parts.is_empty() {
        return Err(EngineError::BadRequest("empty block scalar".into()));
    }
    Ok(parts.join("\n"))
}

fn split_key(content: &str, number: usize) -> Result<(String, &str)> {
    if content.starts_with('"') {
        // JSON-quoted key: find the closing quote, honouring escapes.
        let mut escaped = false;
        for (i, c) in content.char_indices().skip(1) {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => {
                    let key: String = serde_json::from_str(&content[..=i]).map_err(|_| {
                        EngineError::BadRequest(format!("bad quoted key at line {number}"))
                    })?;
                    let rest = content[i + 1..].strip_prefix(':').ok_or_else(|| {
                        EngineError::BadRequest(format!("missing ':' at line {number}"))
                    })?;
                    return Ok((key, rest.strip_prefix(' ').unwrap_or(rest)));
                }
                _ => {}
            }
        }
        Err(EngineError::BadRequest(format!(
            "unterminated key at line {number}"
        )))
    } else {
        let colon = content
            .find(':')
            .ok_or_else(|| EngineError::BadRequest(format!("missing ':' at line {number}")))?;
        let key = content[..colon].to_string();
        let rest = &content[colon + 1..];
        Ok((key, rest.strip_prefix(' ').unwrap_or(rest)))
    }
}

fn parse_scalar(text: &str, number: usize) -> Result<Value> {
    match text {
        "null" => return Ok(Value::Null),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "{}" => return Ok(Value::Object(Map::new())),
        "[]" => return Ok(Value::Array(Vec::new())),
        _ => {}
    }
    if text.starts_with('"') {
        let s: String = serde_json::from_str(text)
            .map_err(|_| EngineError::BadRequest(format!("bad quoted string at line {number}")))?;
        return Ok(Value::String(s));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Number(i.into()));
    }
    if let Ok(f) = text.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = Number::from_f64(f) {
                return Ok(Value::Number(n));
            }
        }
    }
    Ok(Value::String(text.to_string()))
}
