//! Built-in filters.
//!
//! Every filter receives the piped value and its arguments as raw token text.

use std::fmt::Write;

use chrono::{DateTime, NaiveDate};

use crate::data::value::Value;
use crate::registry::{FilterResult, Registry};

pub(crate) fn register_builtins(registry: &Registry) {
    registry.register_filter("upper", upper);
    registry.register_filter("lower", lower);
    registry.register_filter("capitalize", capitalize);
    registry.register_filter("title", title);
    registry.register_filter("trim", trim);
    registry.register_filter("length", length);
    registry.register_filter("default", default);
    registry.register_filter("join", join);
    registry.register_filter("first", first);
    registry.register_filter("last", last);
    registry.register_filter("reverse", reverse);
    registry.register_filter("replace", replace);
    registry.register_filter("truncate", truncate);
    registry.register_filter("abs", abs);
    registry.register_filter("round", round);
    registry.register_filter("date", date);
}

fn arity(args: &[String], min: usize, max: usize) -> Result<(), String> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    Err(match (min, max) {
        (0, 0) => format!("takes no arguments, got {}", args.len()),
        (a, b) if a == b => format!("expects {} argument(s), got {}", a, args.len()),
        (a, b) => format!("expects {} to {} arguments, got {}", a, b, args.len()),
    })
}

fn int_arg(args: &[String], i: usize, default: i64) -> Result<i64, String> {
    match args.get(i) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| format!("argument `{}` is not an integer", raw)),
    }
}

pub fn upper(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    Ok(Value::Str(value.to_string().to_uppercase()))
}

pub fn lower(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    Ok(Value::Str(value.to_string().to_lowercase()))
}

fn capitalize_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Upper-cases the first character and lower-cases the rest.
pub fn capitalize(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    Ok(Value::Str(capitalize_word(&value.to_string())))
}

pub fn title(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    let text = value.to_string();
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();
    for c in text.chars() {
        if c.is_whitespace() {
            out.push_str(&capitalize_word(&word));
            word.clear();
            out.push(c);
        } else {
            word.push(c);
        }
    }
    out.push_str(&capitalize_word(&word));
    Ok(Value::Str(out))
}

pub fn trim(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    Ok(Value::Str(value.to_string().trim().to_string()))
}

pub fn length(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    value
        .len()
        .map(|n| Value::I64(n as i64))
        .ok_or_else(|| format!("a {} has no length", value.type_name()))
}

/// Replaces nil and the empty string with the argument.
pub fn default(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 1, 1)?;
    match value {
        Value::Null => Ok(Value::Str(args[0].clone())),
        Value::Str(s) if s.is_empty() => Ok(Value::Str(args[0].clone())),
        other => Ok(other.clone()),
    }
}

pub fn join(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 1)?;
    let sep = args.first().map(String::as_str).unwrap_or("");
    match value {
        Value::List(items) => Ok(Value::Str(
            items
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(sep),
        )),
        other => Err(format!("cannot join a {}", other.type_name())),
    }
}

pub fn first(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    match value {
        Value::List(items) => Ok(items.first().cloned().unwrap_or_default()),
        Value::Str(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::Str(c.to_string()))
            .unwrap_or_default()),
        other => Err(format!("a {} has no first element", other.type_name())),
    }
}

pub fn last(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    match value {
        Value::List(items) => Ok(items.last().cloned().unwrap_or_default()),
        Value::Str(s) => Ok(s
            .chars()
            .next_back()
            .map(|c| Value::Str(c.to_string()))
            .unwrap_or_default()),
        other => Err(format!("a {} has no last element", other.type_name())),
    }
}

pub fn reverse(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    match value {
        Value::List(items) => Ok(Value::List(items.iter().rev().cloned().collect())),
        Value::Str(s) => Ok(Value::Str(s.chars().rev().collect())),
        other => Err(format!("cannot reverse a {}", other.type_name())),
    }
}

pub fn replace(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 2, 2)?;
    Ok(Value::Str(value.to_string().replace(&args[0], &args[1])))
}

/// Cuts the text to `n` characters and appends `...` when anything was cut.
pub fn truncate(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 1, 1)?;
    let n = int_arg(args, 0, 0)?;
    if n < 0 {
        return Err(format!("length must not be negative, got {}", n));
    }
    let text = value.to_string();
    if text.chars().count() <= n as usize {
        return Ok(Value::Str(text));
    }
    let mut cut: String = text.chars().take(n as usize).collect();
    cut.push_str("...");
    Ok(Value::Str(cut))
}

pub fn abs(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 0)?;
    match value {
        Value::I64(n) => n
            .checked_abs()
            .map(Value::I64)
            .ok_or_else(|| format!("absolute value of {} overflows", n)),
        Value::F64(n) => Ok(Value::F64(n.abs())),
        other => Err(format!("expected a number, got {}", other.type_name())),
    }
}

/// `round` gives an integer; `round:2` keeps two decimals.
pub fn round(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 1)?;
    let digits = int_arg(args, 0, 0)?;
    let n = match value {
        Value::I64(n) => return Ok(Value::I64(*n)),
        Value::F64(n) => *n,
        other => return Err(format!("expected a number, got {}", other.type_name())),
    };
    if digits <= 0 {
        return Ok(Value::I64(n.round() as i64));
    }
    let scale = 10f64.powi(digits.min(15) as i32);
    Ok(Value::F64((n * scale).round() / scale))
}

/// Formats a date with a `strftime` pattern, `%Y-%m-%d` by default.
///
/// Accepts RFC 3339 strings, `YYYY-MM-DD` strings and integer unix seconds.
pub fn date(value: &Value, args: &[String]) -> FilterResult {
    arity(args, 0, 1)?;
    let format = args.first().map(String::as_str).unwrap_or("%Y-%m-%d");
    let mut out = String::new();
    let written = match value {
        Value::I64(secs) => {
            let dt = DateTime::from_timestamp(*secs, 0)
                .ok_or_else(|| format!("timestamp {} is out of range", secs))?;
            write!(out, "{}", dt.format(format))
        }
        Value::Str(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                write!(out, "{}", dt.format(format))
            } else if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                write!(out, "{}", day.format(format))
            } else {
                return Err(format!("`{}` is not a recognised date", s));
            }
        }
        other => return Err(format!("expected a date string or timestamp, got {}", other.type_name())),
    };
    written.map_err(|_| format!("invalid date format `{}`", format))?;
    Ok(Value::Str(out))
}
