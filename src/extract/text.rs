use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::ExtractError;

static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").unwrap());
static PLY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*-?\s*ply").unwrap());
static SIZE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\S*").unwrap());
static SIZE_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)(\d+\s*x\s*\d+\s*[^\s,]+)").unwrap(),
        Regex::new(r"(?i)(\d+\s*(?:Rolls?|Sheets?|Boxes?|Packs?|pcs|Per\s+Pack))").unwrap(),
    ]
});

/// Lowercase words separated by single spaces, punctuation dropped.
pub fn normalize_name(s: &str) -> String {
    NON_WORD_RE
        .replace_all(&s.to_lowercase(), " ")
        .trim()
        .to_string()
}

/// Keep ASCII digits only.
pub fn digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// First number in display text such as `"$1,299.50 / pack"`.
pub fn price_from_text(s: &str) -> Option<f64> {
    let m = NUMBER_RE.find(s)?;
    m.as_str().replace(',', "").parse().ok()
}

/// Coerce a JSON scalar into a float; absent, null and blank are `None`.
pub fn value_f64(v: Option<&Value>, field: &str) -> Result<Option<f64>, ExtractError> {
    let parsed = match v {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(Some(f)),
        _ => Err(invalid(field, v)),
    }
}

/// Coerce a JSON scalar into an integer, truncating decimals (`"12.0"` → 12).
pub fn value_i64(v: Option<&Value>, field: &str) -> Result<Option<i64>, ExtractError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .map(Some)
            .ok_or_else(|| invalid(field, v)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim().replace(',', "");
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .map(Some)
                .ok_or_else(|| invalid(field, v))
        }
        Some(_) => Err(invalid(field, v)),
    }
}

/// Price that may be a number or display text; text without digits is `None`.
pub fn value_price(v: Option<&Value>, field: &str) -> Result<Option<f64>, ExtractError> {
    match v {
        Some(Value::String(s)) => Ok(price_from_text(s)),
        other => value_f64(other, field),
    }
}

/// Non-empty string (numbers are stringified).
pub fn value_str(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn invalid(field: &str, v: Option<&Value>) -> ExtractError {
    let shown = v.map(|v| v.to_string()).unwrap_or_default();
    ExtractError::Validation(format!("{} is not numeric: {}", field, shown))
}

pub fn extract_ply(name: &str) -> Option<String> {
    PLY_RE.captures(name).map(|c| c[1].to_string())
}

/// Numeric tokens of a listing name after the brand, ply tokens excluded.
pub fn size_tokens(name: &str, brand: &str) -> Option<String> {
    let mut rest = name.trim();
    if rest.to_lowercase().starts_with(&brand.to_lowercase()) {
        rest = rest.get(brand.len()..).unwrap_or(rest).trim();
    }
    let tokens: Vec<&str> = SIZE_TOKEN_RE
        .find_iter(rest)
        .filter(|m| !is_ply_token(rest, m.start(), m.end()))
        .map(|m| m.as_str())
        .collect();
    let joined = tokens.join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn is_ply_token(text: &str, start: usize, end: usize) -> bool {
    text[start..end].to_lowercase().contains("ply")
        || text[end..].trim_start().to_lowercase().starts_with("ply")
        || text[..start].to_lowercase().ends_with("ply")
}

/// `"10 x 200 sheets"` style pack sizes, then roll/sheet/pack counts.
pub fn size_from_patterns(text: &str) -> Option<String> {
    SIZE_PATTERNS
        .iter()
        .find_map(|re| re.captures(text).map(|c| c[1].trim().to_string()))
}

/// Truncate to at most `max` characters.
pub fn clip_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => s[..i].to_string(),
        None => s.to_string(),
    }
}
