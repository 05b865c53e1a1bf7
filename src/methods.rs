//! The method catalogue.
//!
//! Every value kind carries a fixed set of named methods. Method access
//! without a call materializes a bound callable via [`bound`]; calls
//! dispatch through [`call`]. The container mutators go through
//! [`call_mut`], which receives the receiver as a mutable slot resolved by
//! the lvalue protocol so `a.b.at(0).push(x)` writes back in place.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::content::{Content, ContentNode};
use crate::diag::{EvalError, EvalResult};
use crate::library;
use crate::ops;
use crate::show::Selector;
use crate::value::{Args, Func, HorizAlign, Value, WrappedRegex};
use crate::vm::Vm;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Methods that write through their receiver.
pub fn is_mutating(name: &str) -> bool {
    matches!(name, "push" | "pop" | "insert" | "remove")
}

/// Whether the catalogue defines `name` for this value kind.
pub fn is_method(value: &Value, name: &str) -> bool {
    let catalogue: &[&str] = match value {
        Value::Str(_) => &[
            "len", "first", "last", "at", "slice", "clusters", "codepoints",
            "contains", "starts-with", "ends-with", "find", "position", "match",
            "matches", "replace", "trim", "split",
        ],
        Value::Array(_) => &[
            "len", "first", "last", "at", "push", "pop", "slice", "split",
            "insert", "remove", "contains", "find", "position", "filter", "map",
            "flatten", "enumerate", "fold", "any", "all", "rev", "join", "sorted",
            "zip", "sum", "product",
        ],
        Value::Dict(_) => &["len", "at", "insert", "keys", "values", "pairs", "remove"],
        Value::Content(_) => &["func", "has", "at", "text", "children"],
        Value::Counter(_) => &["display", "step", "update", "at", "final"],
        Value::Color(_) => &["darken", "lighten", "negate"],
        Value::Func(_) => &["with", "where"],
        Value::Selector(_) => &["or", "and", "before", "after"],
        Value::Args(_) => &["pos", "named"],
        _ => &[],
    };
    catalogue.contains(&name)
}

/// Materialize a non-mutating method as a callable value carrying its
/// receiver.
pub fn bound(receiver: &Value, name: &str) -> Option<Value> {
    if !is_method(receiver, name) || is_mutating(name) {
        return None;
    }
    let receiver = receiver.clone();
    let method = name.to_string();
    Some(Value::Func(Func::native(name, move |vm, args| {
        call(vm, receiver.clone(), &method, args)
    })))
}

/// Dispatch a non-mutating method call.
pub fn call(vm: &mut Vm, receiver: Value, name: &str, args: Args) -> EvalResult<Value> {
    match receiver {
        Value::Str(s) => str_method(vm, &s, name, args),
        Value::Array(items) => array_method(vm, items, name, args),
        Value::Dict(map) => dict_method(map, name, args),
        Value::Content(nodes) => content_method(nodes, name, args),
        Value::Counter(key) => counter_method(vm, &key, name, args),
        Value::Color(color) => color_method(&color, name, args),
        Value::Func(func) => func_method(func, name, args),
        Value::Selector(sel) => selector_method(vm, sel, name, args),
        Value::Args(inner) => args_method(inner, name),
        v => Err(EvalError::invalid_op(format!(
            "type {} has no method {}",
            v.type_name(),
            name
        ))),
    }
}

/// Dispatch a container mutator against a resolved lvalue slot.
pub fn call_mut(slot: &mut Value, name: &str, mut args: Args) -> EvalResult<Value> {
    match slot {
        Value::Array(items) => match name {
            "push" => {
                items.push(args.expect_front("value")?);
                Ok(Value::None)
            }
            "pop" => items
                .pop()
                .ok_or_else(|| EvalError::domain("array is empty")),
            "insert" => {
                let index = args.expect_front("index")?.as_int()?;
                let value = args.expect_front("value")?;
                if index < 0 || index as usize > items.len() {
                    return Err(EvalError::domain(format!(
                        "index {index} out of bounds for length {}",
                        items.len()
                    )));
                }
                items.insert(index as usize, value);
                Ok(Value::None)
            }
            "remove" => {
                let index = args.expect_front("index")?.as_int()?;
                let resolved = resolve_index(index, items.len())?;
                Ok(items.remove(resolved))
            }
            other => Err(EvalError::invalid_op(format!(
                "array has no method {other}"
            ))),
        },
        Value::Dict(map) => match name {
            "insert" => {
                let key = args.expect_front("key")?.as_str()?.to_string();
                let value = args.expect_front("value")?;
                map.insert(key, value);
                Ok(Value::None)
            }
            "remove" => {
                let key = args.expect_front("key")?.as_str()?.to_string();
                map.shift_remove(&key)
                    .ok_or_else(|| EvalError::domain(format!("key not found: {key}")))
            }
            other => Err(EvalError::invalid_op(format!(
                "dictionary has no method {other}"
            ))),
        },
        v => Err(EvalError::invalid_op(format!(
            "cannot mutate a value of type {}",
            v.type_name()
        ))),
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// A string or regex pattern argument.
enum Pat {
    Str(String),
    Re(WrappedRegex),
}

impl Pat {
    fn from(value: Value) -> EvalResult<Pat> {
        match value {
            Value::Str(s) => Ok(Pat::Str(s)),
            Value::Regex(re) => Ok(Pat::Re(re)),
            v => Err(EvalError::type_mismatch("string or regex", v.type_name())),
        }
    }
}

/// Resolve an index, wrapping negatives modulo the length.
fn resolve_index(index: i64, len: usize) -> EvalResult<usize> {
    if len == 0 {
        return Err(EvalError::domain("container is empty"));
    }
    let resolved = if index < 0 { index.rem_euclid(len as i64) } else { index };
    if resolved as usize >= len {
        return Err(EvalError::domain(format!(
            "index {index} out of bounds for length {len}"
        )));
    }
    Ok(resolved as usize)
}

/// Resolve a slice bound, clamping into range; negatives count from the end.
fn slice_bound(index: i64, len: usize) -> usize {
    let resolved = if index < 0 { index + len as i64 } else { index };
    resolved.clamp(0, len as i64) as usize
}

fn call_fn(vm: &mut Vm, f: &Value, args: Vec<Value>) -> EvalResult<Value> {
    match f {
        Value::Func(func) => vm.call_func(func, Args::from_values(args)),
        v => Err(EvalError::type_mismatch("function", v.type_name())),
    }
}

// ============================================================================
// Strings
// ============================================================================

fn str_method(vm: &mut Vm, s: &str, name: &str, mut args: Args) -> EvalResult<Value> {
    let chars: Vec<char> = s.chars().collect();
    match name {
        "len" => Ok(Value::Int(chars.len() as i64)),
        "first" => chars
            .first()
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(|| EvalError::domain("string is empty")),
        "last" => chars
            .last()
            .map(|c| Value::Str(c.to_string()))
            .ok_or_else(|| EvalError::domain("string is empty")),
        "at" => {
            let index = args.expect_front("index")?.as_int()?;
            let resolved = resolve_index(index, chars.len())?;
            Ok(Value::Str(chars[resolved].to_string()))
        }
        "slice" => {
            let start = slice_bound(args.expect_front("start")?.as_int()?, chars.len());
            let end = match (args.take_front(), args.take_named("count")) {
                (Some(end), _) => slice_bound(end.as_int()?, chars.len()),
                (None, Some(count)) => {
                    (start + count.as_int()?.max(0) as usize).min(chars.len())
                }
                (None, None) => chars.len(),
            };
            if end <= start {
                return Ok(Value::Str(String::new()));
            }
            Ok(Value::Str(chars[start..end].iter().collect()))
        }
        // Grapheme clusters fall back to per-codepoint chunking.
        "clusters" | "codepoints" => Ok(Value::Array(
            chars.iter().map(|c| Value::Str(c.to_string())).collect(),
        )),
        "contains" => match Pat::from(args.expect_front("pattern")?)? {
            Pat::Str(p) => Ok(Value::Bool(s.contains(&p))),
            Pat::Re(re) => Ok(Value::Bool(re.is_match(s))),
        },
        "starts-with" => match Pat::from(args.expect_front("pattern")?)? {
            Pat::Str(p) => Ok(Value::Bool(s.starts_with(&p))),
            Pat::Re(re) => Ok(Value::Bool(re.find(s).is_some_and(|m| m.start() == 0))),
        },
        "ends-with" => match Pat::from(args.expect_front("pattern")?)? {
            Pat::Str(p) => Ok(Value::Bool(s.ends_with(&p))),
            Pat::Re(re) => {
                Ok(Value::Bool(re.find_iter(s).any(|m| m.end() == s.len())))
            }
        },
        "find" => match Pat::from(args.expect_front("pattern")?)? {
            Pat::Str(p) => Ok(if s.contains(&p) { Value::Str(p) } else { Value::None }),
            Pat::Re(re) => Ok(re
                .find(s)
                .map(|m| Value::Str(m.as_str().to_string()))
                .unwrap_or(Value::None)),
        },
        "position" => match Pat::from(args.expect_front("pattern")?)? {
            Pat::Str(p) => Ok(s
                .find(&p)
                .map(|byte| Value::Int(char_index(s, byte)))
                .unwrap_or(Value::None)),
            Pat::Re(re) => Ok(re
                .find(s)
                .map(|m| Value::Int(char_index(s, m.start())))
                .unwrap_or(Value::None)),
        },
        "match" => match first_match(s, Pat::from(args.expect_front("pattern")?)?) {
            Some(m) => Ok(m),
            None => Ok(Value::None),
        },
        "matches" => Ok(Value::Array(all_matches(
            s,
            Pat::from(args.expect_front("pattern")?)?,
        ))),
        "replace" => {
            let pattern = Pat::from(args.expect_front("pattern")?)?;
            let with = args.expect_front("replacement")?;
            let count = args
                .take_named("count")
                .map(|v| v.as_int())
                .transpose()?
                .map(|n| n.max(0) as usize);
            let out = match with {
                Value::Str(replacement) => match pattern {
                    Pat::Str(p) => match count {
                        Some(n) => s.replacen(&p, &replacement, n),
                        None => s.replace(&p, &replacement),
                    },
                    Pat::Re(re) => match count {
                        Some(n) => re.replacen(s, n, replacement.as_str()).into_owned(),
                        None => re.replace_all(s, replacement.as_str()).into_owned(),
                    },
                },
                // A function replacement receives the match dictionary.
                f @ Value::Func(_) => replace_with_fn(vm, s, pattern, &f, count)?,
                v => {
                    return Err(EvalError::type_mismatch(
                        "string or function",
                        v.type_name(),
                    ))
                }
            };
            Ok(Value::Str(out))
        }
        "trim" => {
            let pattern = args.take_front().map(Pat::from).transpose()?;
            let repeat = args
                .take_named("repeat")
                .map(|v| v.as_bool())
                .transpose()?
                .unwrap_or(true);
            let at = args.take_named("at");
            let (from_start, from_end) = match at {
                Some(Value::Alignment(a)) => match a.horiz {
                    Some(HorizAlign::Start) => (true, false),
                    Some(HorizAlign::End) => (false, true),
                    _ => (true, true),
                },
                _ => (true, true),
            };
            Ok(Value::Str(trim(s, pattern, repeat, from_start, from_end)))
        }
        "split" => match args.take_front() {
            None | Some(Value::None) => Ok(Value::Array(
                WHITESPACE
                    .split(s.trim())
                    .filter(|p| !p.is_empty())
                    .map(|p| Value::Str(p.to_string()))
                    .collect(),
            )),
            Some(Value::Str(p)) if p.is_empty() => {
                let mut out = vec![Value::Str(String::new())];
                out.extend(chars.iter().map(|c| Value::Str(c.to_string())));
                out.push(Value::Str(String::new()));
                Ok(Value::Array(out))
            }
            Some(Value::Str(p)) => Ok(Value::Array(
                s.split(&p).map(|p| Value::Str(p.to_string())).collect(),
            )),
            Some(Value::Regex(re)) => Ok(Value::Array(
                re.split(s).map(|p| Value::Str(p.to_string())).collect(),
            )),
            Some(v) => Err(EvalError::type_mismatch("string or regex", v.type_name())),
        },
        other => Err(EvalError::invalid_op(format!("string has no method {other}"))),
    }
}

/// Replace matches by calling a function with each match dictionary.
fn replace_with_fn(
    vm: &mut Vm,
    s: &str,
    pattern: Pat,
    f: &Value,
    count: Option<usize>,
) -> EvalResult<String> {
    let matches = all_matches(s, pattern);
    let mut out = String::new();
    let mut last = 0usize;
    let chars: Vec<char> = s.chars().collect();
    let at_byte = |char_idx: i64| -> usize {
        chars[..char_idx as usize].iter().map(|c| c.len_utf8()).sum()
    };
    for (i, m) in matches.into_iter().enumerate() {
        if let Some(limit) = count {
            if i >= limit {
                break;
            }
        }
        let Value::Dict(ref dict) = m else { unreachable!() };
        let (Some(Value::Int(start)), Some(Value::Int(end))) =
            (dict.get("start"), dict.get("end"))
        else {
            unreachable!()
        };
        let (start, end) = (at_byte(*start), at_byte(*end));
        out.push_str(&s[last..start]);
        out.push_str(&call_fn(vm, f, vec![m.clone()])?.display());
        last = end;
    }
    out.push_str(&s[last..]);
    Ok(out)
}

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

fn match_dict(s: &str, m: regex::Match, captures: Vec<Value>) -> Value {
    let mut dict = IndexMap::new();
    dict.insert("start".to_string(), Value::Int(char_index(s, m.start())));
    dict.insert("end".to_string(), Value::Int(char_index(s, m.end())));
    dict.insert("text".to_string(), Value::Str(m.as_str().to_string()));
    dict.insert("captures".to_string(), Value::Array(captures));
    Value::Dict(dict)
}

fn first_match(s: &str, pattern: Pat) -> Option<Value> {
    match pattern {
        Pat::Str(p) => {
            let byte = s.find(&p)?;
            let mut dict = IndexMap::new();
            dict.insert("start".to_string(), Value::Int(char_index(s, byte)));
            dict.insert(
                "end".to_string(),
                Value::Int(char_index(s, byte + p.len())),
            );
            dict.insert("text".to_string(), Value::Str(p));
            dict.insert("captures".to_string(), Value::Array(Vec::new()));
            Some(Value::Dict(dict))
        }
        Pat::Re(re) => {
            let caps = re.captures(s)?;
            let m = caps.get(0)?;
            let groups = caps
                .iter()
                .skip(1)
                .map(|g| match g {
                    Some(g) => Value::Str(g.as_str().to_string()),
                    None => Value::None,
                })
                .collect();
            Some(match_dict(s, m, groups))
        }
    }
}

fn all_matches(s: &str, pattern: Pat) -> Vec<Value> {
    match pattern {
        Pat::Str(p) => {
            if p.is_empty() {
                return Vec::new();
            }
            let mut out = Vec::new();
            let mut from = 0;
            while let Some(found) = s[from..].find(&p) {
                let byte = from + found;
                let mut dict = IndexMap::new();
                dict.insert("start".to_string(), Value::Int(char_index(s, byte)));
                dict.insert(
                    "end".to_string(),
                    Value::Int(char_index(s, byte + p.len())),
                );
                dict.insert("text".to_string(), Value::Str(p.clone()));
                dict.insert("captures".to_string(), Value::Array(Vec::new()));
                out.push(Value::Dict(dict));
                from = byte + p.len();
            }
            out
        }
        Pat::Re(re) => {
            let mut out = Vec::new();
            for caps in re.captures_iter(s) {
                if let Some(m) = caps.get(0) {
                    let groups = caps
                        .iter()
                        .skip(1)
                        .map(|g| match g {
                            Some(g) => Value::Str(g.as_str().to_string()),
                            None => Value::None,
                        })
                        .collect();
                    out.push(match_dict(s, m, groups));
                }
            }
            out
        }
    }
}

fn trim(s: &str, pattern: Option<Pat>, repeat: bool, start: bool, end: bool) -> String {
    match pattern {
        None => {
            let mut out = s;
            if start {
                out = out.trim_start();
            }
            if end {
                out = out.trim_end();
            }
            out.to_string()
        }
        Some(Pat::Str(p)) => {
            if p.is_empty() {
                return s.to_string();
            }
            let mut out = s;
            if start {
                while let Some(rest) = out.strip_prefix(&p) {
                    out = rest;
                    if !repeat {
                        break;
                    }
                }
            }
            if end {
                while let Some(rest) = out.strip_suffix(&p) {
                    out = rest;
                    if !repeat {
                        break;
                    }
                }
            }
            out.to_string()
        }
        Some(Pat::Re(re)) => {
            let mut out = s.to_string();
            if start {
                loop {
                    let Some(m) = re.find(&out) else { break };
                    if m.start() != 0 || m.is_empty() {
                        break;
                    }
                    out.drain(..m.end());
                    if !repeat {
                        break;
                    }
                }
            }
            if end {
                loop {
                    let Some(m) = re.find_iter(&out).last() else { break };
                    if m.end() != out.len() || m.is_empty() {
                        break;
                    }
                    out.truncate(m.start());
                    if !repeat {
                        break;
                    }
                }
            }
            out
        }
    }
}

// ============================================================================
// Arrays
// ============================================================================

fn array_method(
    vm: &mut Vm,
    items: Vec<Value>,
    name: &str,
    mut args: Args,
) -> EvalResult<Value> {
    match name {
        "len" => Ok(Value::Int(items.len() as i64)),
        "first" => items
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::domain("array is empty")),
        "last" => items
            .into_iter()
            .next_back()
            .ok_or_else(|| EvalError::domain("array is empty")),
        "at" => {
            let index = args.expect_front("index")?.as_int()?;
            let default = args.take_named("default");
            match resolve_index(index, items.len()) {
                Ok(resolved) => Ok(items[resolved].clone()),
                Err(_) => default.ok_or_else(|| {
                    EvalError::domain(format!(
                        "index {index} out of bounds for length {}",
                        items.len()
                    ))
                }),
            }
        }
        "slice" => {
            let start = slice_bound(args.expect_front("start")?.as_int()?, items.len());
            let end = match (args.take_front(), args.take_named("count")) {
                (Some(end), _) => slice_bound(end.as_int()?, items.len()),
                (None, Some(count)) => {
                    (start + count.as_int()?.max(0) as usize).min(items.len())
                }
                (None, None) => items.len(),
            };
            if end <= start {
                return Ok(Value::Array(Vec::new()));
            }
            Ok(Value::Array(items[start..end].to_vec()))
        }
        "split" => {
            let separator = args.expect_front("separator")?;
            let mut out = Vec::new();
            let mut current = Vec::new();
            for item in items {
                if item == separator {
                    out.push(Value::Array(std::mem::take(&mut current)));
                } else {
                    current.push(item);
                }
            }
            out.push(Value::Array(current));
            Ok(Value::Array(out))
        }
        "contains" => {
            let needle = args.expect_front("value")?;
            Ok(Value::Bool(items.contains(&needle)))
        }
        "find" => {
            let pred = args.expect_front("function")?;
            for item in items {
                if call_fn(vm, &pred, vec![item.clone()])?.as_bool()? {
                    return Ok(item);
                }
            }
            Ok(Value::None)
        }
        "position" => {
            let pred = args.expect_front("function")?;
            for (i, item) in items.into_iter().enumerate() {
                if call_fn(vm, &pred, vec![item])?.as_bool()? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Ok(Value::None)
        }
        "filter" => {
            let pred = args.expect_front("function")?;
            let mut out = Vec::new();
            for item in items {
                if call_fn(vm, &pred, vec![item.clone()])?.as_bool()? {
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        "map" => {
            let f = args.expect_front("function")?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(call_fn(vm, &f, vec![item])?);
            }
            Ok(Value::Array(out))
        }
        "flatten" => Ok(Value::Array(flatten(items))),
        "enumerate" => Ok(Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::Array(vec![Value::Int(i as i64), v]))
                .collect(),
        )),
        "fold" => {
            let init = args.expect_front("initial value")?;
            let f = args.expect_front("function")?;
            let mut acc = init;
            for item in items {
                acc = call_fn(vm, &f, vec![acc, item])?;
            }
            Ok(acc)
        }
        "any" => {
            let pred = args.expect_front("function")?;
            for item in items {
                if call_fn(vm, &pred, vec![item])?.as_bool()? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "all" => {
            let pred = args.expect_front("function")?;
            for item in items {
                if !call_fn(vm, &pred, vec![item])?.as_bool()? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "rev" => Ok(Value::Array(items.into_iter().rev().collect())),
        "join" => {
            let separator = args.take_front();
            let last = args.take_named("last");
            let count = items.len();
            let mut out = Value::None;
            for (i, item) in items.into_iter().enumerate() {
                if i > 0 {
                    let sep = if i + 1 == count && last.is_some() {
                        last.clone()
                    } else {
                        separator.clone()
                    };
                    if let Some(sep) = sep {
                        out = ops::join(out, sep)?;
                    }
                }
                out = ops::join(out, item)?;
            }
            Ok(out)
        }
        "sorted" => {
            let key = args.take_named("key").or_else(|| args.take_front());
            let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
            for item in items {
                let k = match &key {
                    Some(f) => call_fn(vm, f, vec![item.clone()])?,
                    None => item.clone(),
                };
                keyed.push((k, item));
            }
            let mut failed = false;
            keyed.sort_by(|a, b| match ops::compare(&a.0, &b.0) {
                Some(ordering) => ordering,
                None => {
                    failed = true;
                    std::cmp::Ordering::Equal
                }
            });
            if failed {
                return Err(EvalError::invalid_op("cannot sort incomparable values"));
            }
            Ok(Value::Array(keyed.into_iter().map(|(_, v)| v).collect()))
        }
        "zip" => {
            let other = args.expect_front("array")?.into_array()?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .zip(other)
                    .map(|(a, b)| Value::Array(vec![a, b]))
                    .collect(),
            ))
        }
        "sum" => {
            let default = args.take_named("default");
            if items.is_empty() {
                return default
                    .ok_or_else(|| EvalError::domain("cannot sum an empty array"));
            }
            let mut iter = items.into_iter();
            let mut acc = iter.next().unwrap();
            for item in iter {
                acc = ops::add(acc, item)?;
            }
            Ok(acc)
        }
        "product" => {
            let default = args.take_named("default");
            if items.is_empty() {
                return default.ok_or_else(|| {
                    EvalError::domain("cannot multiply an empty array")
                });
            }
            let mut iter = items.into_iter();
            let mut acc = iter.next().unwrap();
            for item in iter {
                acc = ops::mul(acc, item)?;
            }
            Ok(acc)
        }
        other => Err(EvalError::invalid_op(format!("array has no method {other}"))),
    }
}

fn flatten(items: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Array(inner) => out.extend(flatten(inner)),
            other => out.push(other),
        }
    }
    out
}

// ============================================================================
// Dictionaries
// ============================================================================

fn dict_method(
    map: IndexMap<String, Value>,
    name: &str,
    mut args: Args,
) -> EvalResult<Value> {
    match name {
        "len" => Ok(Value::Int(map.len() as i64)),
        "at" => {
            let key = args.expect_front("key")?.as_str()?.to_string();
            let default = args.take_named("default");
            map.get(&key).cloned().map(Ok).unwrap_or_else(|| {
                default.ok_or_else(|| EvalError::domain(format!("key not found: {key}")))
            })
        }
        "keys" => Ok(Value::Array(
            map.keys().map(|k| Value::Str(k.clone())).collect(),
        )),
        "values" => Ok(Value::Array(map.into_values().collect())),
        "pairs" => Ok(Value::Array(
            map.into_iter()
                .map(|(k, v)| Value::Array(vec![Value::Str(k), v]))
                .collect(),
        )),
        other => Err(EvalError::invalid_op(format!(
            "dictionary has no method {other}"
        ))),
    }
}

// ============================================================================
// Content
// ============================================================================

fn content_method(nodes: Content, name: &str, mut args: Args) -> EvalResult<Value> {
    match name {
        "text" => Ok(Value::Str(
            nodes.iter().map(|n| n.plain_text()).collect(),
        )),
        "children" => Ok(Value::Array(
            nodes
                .into_iter()
                .map(|n| Value::Content(vec![n]))
                .collect(),
        )),
        "func" => match single_element(&nodes)? {
            Some(elem) => Ok(Value::Func(library::element_func(&elem.name))),
            None => Ok(Value::Func(library::element_func("text"))),
        },
        "has" => {
            let field = args.expect_front("field")?.as_str()?.to_string();
            match single_element(&nodes)? {
                Some(elem) => Ok(Value::Bool(elem.fields.contains_key(&field))),
                None => Ok(Value::Bool(field == "text")),
            }
        }
        "at" => {
            let field = args.expect_front("field")?.as_str()?.to_string();
            let default = args.take_named("default");
            let found = match single_element(&nodes)? {
                Some(elem) => elem.fields.get(&field).cloned(),
                None if field == "text" => Some(Value::Str(
                    nodes.iter().map(|n| n.plain_text()).collect(),
                )),
                None => None,
            };
            found.map(Ok).unwrap_or_else(|| {
                default
                    .ok_or_else(|| EvalError::domain(format!("content has no field {field}")))
            })
        }
        other => Err(EvalError::invalid_op(format!(
            "content has no method {other}"
        ))),
    }
}

/// The element of a single-node content value, if it is an element.
fn single_element(nodes: &Content) -> EvalResult<Option<&crate::content::Element>> {
    match nodes[..] {
        [ContentNode::Elem(ref elem)] => Ok(Some(elem)),
        [ContentNode::Text(_)] => Ok(None),
        _ => Err(EvalError::domain(
            "expected a single content node, found a sequence",
        )),
    }
}

// ============================================================================
// Counters
// ============================================================================

fn counter_method(vm: &mut Vm, key: &str, name: &str, mut args: Args) -> EvalResult<Value> {
    match name {
        "display" => {
            let current = vm.counters.get(key).copied().unwrap_or(0);
            Ok(Value::Content(vec![ContentNode::Text(current.to_string())]))
        }
        "step" => {
            *vm.counters.entry(key.to_string()).or_insert(0) += 1;
            Ok(Value::None)
        }
        "update" => {
            let update = args.expect_front("value or function")?;
            match update {
                Value::Int(n) => {
                    vm.counters.insert(key.to_string(), n);
                    Ok(Value::None)
                }
                f @ Value::Func(_) => {
                    let current = vm.counters.get(key).copied().unwrap_or(0);
                    let next = call_fn(vm, &f, vec![Value::Int(current)])?.as_int()?;
                    vm.counters.insert(key.to_string(), next);
                    Ok(Value::None)
                }
                v => Err(EvalError::type_mismatch("int or function", v.type_name())),
            }
        }
        "at" => Err(EvalError::unimplemented("counter.at")),
        "final" => Err(EvalError::unimplemented("counter.final")),
        other => Err(EvalError::invalid_op(format!(
            "counter has no method {other}"
        ))),
    }
}

// ============================================================================
// Colors, functions, selectors, arguments
// ============================================================================

fn color_method(
    color: &crate::value::Color,
    name: &str,
    mut args: Args,
) -> EvalResult<Value> {
    match name {
        "darken" => {
            let amount = args.expect_front("amount")?.as_float()?;
            Ok(Value::Color(color.darken(amount)))
        }
        "lighten" => {
            let amount = args.expect_front("amount")?.as_float()?;
            Ok(Value::Color(color.lighten(amount)))
        }
        "negate" => Ok(Value::Color(color.negate())),
        other => Err(EvalError::invalid_op(format!("color has no method {other}"))),
    }
}

fn func_method(func: Func, name: &str, args: Args) -> EvalResult<Value> {
    match name {
        "with" => Ok(Value::Func(func.applied(args))),
        "where" => {
            let elem = func.elem.clone().ok_or_else(|| {
                EvalError::domain("only element functions support where()")
            })?;
            let constraints = args.named.into_iter().collect();
            Ok(Value::Selector(Selector::Elem(elem, constraints)))
        }
        other => Err(EvalError::invalid_op(format!(
            "function has no method {other}"
        ))),
    }
}

fn selector_method(
    vm: &mut Vm,
    sel: Selector,
    name: &str,
    mut args: Args,
) -> EvalResult<Value> {
    let other = vm.to_selector(args.expect_front("selector")?)?;
    let combined = match name {
        "or" => Selector::Or(Box::new(sel), Box::new(other)),
        "and" => Selector::And(Box::new(sel), Box::new(other)),
        "before" => Selector::Before(Box::new(sel), Box::new(other)),
        "after" => Selector::After(Box::new(sel), Box::new(other)),
        other => {
            return Err(EvalError::invalid_op(format!(
                "selector has no method {other}"
            )))
        }
    };
    Ok(Value::Selector(combined))
}

fn args_method(inner: Args, name: &str) -> EvalResult<Value> {
    match name {
        "pos" => Ok(Value::Array(inner.pos)),
        "named" => Ok(Value::Dict(inner.named)),
        other => Err(EvalError::invalid_op(format!(
            "arguments has no method {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm() -> Vm {
        Vm::new(std::sync::Arc::new(crate::world::NoopWorld), "test")
    }

    fn str_call(s: &str, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        str_method(&mut test_vm(), s, name, Args::from_values(args))
    }

    #[test]
    fn string_indexing_wraps_negative() {
        assert_eq!(
            str_call("abc", "at", vec![Value::Int(-1)]).unwrap(),
            Value::Str("c".into())
        );
        assert_eq!(
            str_call("abc", "at", vec![Value::Int(-4)]).unwrap(),
            Value::Str("c".into())
        );
        assert!(str_call("abc", "at", vec![Value::Int(3)]).is_err());
    }

    #[test]
    fn string_slice_defaults_and_empty() {
        assert_eq!(
            str_call("hello", "slice", vec![Value::Int(1)]).unwrap(),
            Value::Str("ello".into())
        );
        assert_eq!(
            str_call("hello", "slice", vec![Value::Int(3), Value::Int(1)]).unwrap(),
            Value::Str("".into())
        );
    }

    #[test]
    fn string_split_empty_pattern() {
        let out = str_call("ab", "split", vec![Value::Str("".into())]).unwrap();
        assert_eq!(
            out,
            Value::Array(vec![
                Value::Str("".into()),
                Value::Str("a".into()),
                Value::Str("b".into()),
                Value::Str("".into()),
            ])
        );
    }

    #[test]
    fn string_trim_variants() {
        assert_eq!(
            str_call("  x  ", "trim", vec![]).unwrap(),
            Value::Str("x".into())
        );
        assert_eq!(
            str_call("aaxaa", "trim", vec![Value::Str("a".into())]).unwrap(),
            Value::Str("x".into())
        );
        let mut args = Args::from_values(vec![Value::Str("a".into())]);
        args.insert("repeat", Value::Bool(false));
        assert_eq!(
            str_method(&mut test_vm(), "aax", "trim", args).unwrap(),
            Value::Str("ax".into())
        );
    }

    #[test]
    fn string_match_gives_positions() {
        let re = Value::Regex(WrappedRegex(Regex::new("l+").unwrap()));
        let out = str_call("hello", "match", vec![re]).unwrap();
        let Value::Dict(dict) = out else { panic!("expected dict") };
        assert_eq!(dict.get("start"), Some(&Value::Int(2)));
        assert_eq!(dict.get("end"), Some(&Value::Int(4)));
        assert_eq!(dict.get("text"), Some(&Value::Str("ll".into())));
    }

    #[test]
    fn array_mutators_write_back() {
        let mut slot = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        call_mut(&mut slot, "push", Args::from_values(vec![Value::Int(3)])).unwrap();
        assert_eq!(
            slot,
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let popped = call_mut(&mut slot, "pop", Args::new()).unwrap();
        assert_eq!(popped, Value::Int(3));
        let removed =
            call_mut(&mut slot, "remove", Args::from_values(vec![Value::Int(0)])).unwrap();
        assert_eq!(removed, Value::Int(1));
        assert_eq!(slot, Value::Array(vec![Value::Int(2)]));
    }

    #[test]
    fn pop_on_empty_is_a_domain_error() {
        let mut slot = Value::Array(vec![]);
        assert!(call_mut(&mut slot, "pop", Args::new()).is_err());
    }

    #[test]
    fn dict_mutators() {
        let mut slot = Value::Dict(IndexMap::new());
        call_mut(
            &mut slot,
            "insert",
            Args::from_values(vec![Value::Str("a".into()), Value::Int(1)]),
        )
        .unwrap();
        let removed = call_mut(
            &mut slot,
            "remove",
            Args::from_values(vec![Value::Str("a".into())]),
        )
        .unwrap();
        assert_eq!(removed, Value::Int(1));
        assert!(call_mut(
            &mut slot,
            "remove",
            Args::from_values(vec![Value::Str("a".into())])
        )
        .is_err());
    }

    #[test]
    fn flatten_is_deep() {
        let nested = vec![
            Value::Int(1),
            Value::Array(vec![Value::Int(2), Value::Array(vec![Value::Int(3)])]),
        ];
        assert_eq!(
            flatten(nested),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }
}
