//! Address resolution for nested documents
//!
//! An address is a dot-separated chain of segments, `segment ("." segment)*`.
//! A segment is a bare `name`, an indexed `name[index]` selecting the list
//! element whose identity equals `index`, or a splat `name[]` that keeps the
//! whole list and fans out across it. An index may contain dots
//! (`terms[1.5].value`); only dots outside brackets separate segments.
//!
//! Resolution starts at any [`Addressable`] root (a JSON document, a [`Node`],
//! the gathered parents of an operation) and walks plain JSON from there.
//!
//! [`Node`]: crate::node::Node

mod diff;

pub use diff::Diff;

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

/// Error types for address parsing and resolution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid segment '{segment}' in address '{address}'")]
    InvalidSegment { address: String, segment: String },

    #[error("Missing member '{member}' while resolving '{address}'")]
    MissingMember { address: String, member: String },

    #[error("Address '{0}' matches more than one value")]
    AmbiguousMatch(String),

    #[error("Cannot index '{segment}' in '{address}': value is not a list")]
    TypeMismatch { address: String, segment: String },
}

/// How a segment picks from a list-valued member
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Selector {
    /// No brackets
    None,
    /// `name[index]`: the element whose identity equals `index`
    Index(String),
    /// `name[]`: every element
    Splat,
}

/// One step of an address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    pub name: String,
    pub selector: Selector,
}

impl Segment {
    /// Parse a single segment, returning `None` if it is malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, selector) = match raw.find('[') {
            None => (raw, Selector::None),
            Some(open) => {
                let inner = raw[open + 1..].strip_suffix(']')?;
                if inner.contains('[') || inner.contains(']') {
                    return None;
                }
                let selector = if inner.is_empty() {
                    Selector::Splat
                } else {
                    Selector::Index(inner.to_string())
                };
                (&raw[..open], selector)
            }
        };

        if !is_valid_name(name) {
            return None;
        }

        Some(Self {
            name: name.to_string(),
            selector,
        })
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self.selector, Selector::Index(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::None => write!(f, "{}", self.name),
            Selector::Index(index) => write!(f, "{}[{}]", self.name, index),
            Selector::Splat => write!(f, "{}[]", self.name),
        }
    }
}

/// Whether `name` may appear as a segment name: `[A-Za-z0-9_?!-]+`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '?' | '!' | '-'))
}

/// A parsed address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    raw: String,
    segments: Vec<Segment>,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let segments = split_segments(raw)
            .into_iter()
            .map(|piece| {
                Segment::parse(piece).ok_or_else(|| AddressError::InvalidSegment {
                    address: raw.to_string(),
                    segment: piece.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first segment. Parsing guarantees there is one.
    pub fn head(&self) -> &Segment {
        &self.segments[0]
    }

    /// Everything after the first segment, if anything.
    pub fn tail(&self) -> Option<Address> {
        if self.segments.len() < 2 {
            return None;
        }
        let segments = self.segments[1..].to_vec();
        let raw = segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(".");
        Some(Self { raw, segments })
    }

    /// Whether any segment fans out with `[]`.
    pub fn has_splat(&self) -> bool {
        self.segments.iter().any(|s| s.selector == Selector::Splat)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Byte offset of the first `.` that is not inside brackets.
fn first_separator(addr: &str) -> Option<usize> {
    let mut bracketed = false;
    for (at, c) in addr.char_indices() {
        match c {
            '[' => bracketed = true,
            ']' => bracketed = false,
            '.' if !bracketed => return Some(at),
            _ => {}
        }
    }
    None
}

/// Split on the dots between segments. Dots inside an index stay put.
fn split_segments(addr: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = addr;
    while let Some(at) = first_separator(rest) {
        pieces.push(&rest[..at]);
        rest = &rest[at + 1..];
    }
    pieces.push(rest);
    pieces
}

/// First segment of a raw address, selector included.
pub fn head(addr: &str) -> &str {
    first_separator(addr).map_or(addr, |at| &addr[..at])
}

/// Remainder of a raw address after the first segment.
pub fn tail(addr: &str) -> Option<&str> {
    first_separator(addr).map(|at| &addr[at + 1..])
}

/// Name of the first segment with any selector stripped.
pub fn head_name(addr: &str) -> &str {
    let h = head(addr);
    h.split('[').next().unwrap_or(h)
}

/// Anything that can serve as the root of a resolution.
///
/// Keyed containers answer with their entries; attributed objects answer
/// with their named accessors. `None` means the member does not exist,
/// which is different from a member that exists and is null.
pub trait Addressable {
    fn member(&self, name: &str) -> Option<Cow<'_, Value>>;
}

impl Addressable for Value {
    fn member(&self, name: &str) -> Option<Cow<'_, Value>> {
        match self {
            Value::Object(map) => map.get(name).map(Cow::Borrowed),
            _ => None,
        }
    }
}

impl Addressable for Map<String, Value> {
    fn member(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }
}

/// Resolution mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Exactly one match per level; fanning out is an error
    Single,
    /// Every match, fanning out over list-valued intermediates
    #[default]
    Plural,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub mode: Mode,
    /// Raise on a missing key instead of resolving to null
    pub raise_on_invalid: bool,
}

impl FetchOptions {
    pub fn single() -> Self {
        Self {
            mode: Mode::Single,
            raise_on_invalid: false,
        }
    }

    pub fn plural() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.raise_on_invalid = true;
        self
    }
}

/// Resolve `addr` against `target`.
///
/// In plural mode the result holds one entry per match, in document order.
/// In single mode it holds exactly one entry. Absent values resolve to
/// `null` unless `raise_on_invalid` is set.
pub fn fetch<T>(addr: &str, target: &T, opts: FetchOptions) -> Result<Vec<Value>, AddressError>
where
    T: Addressable + ?Sized,
{
    let address = Address::parse(addr)?;
    fetch_address(&address, target, opts)
}

/// Resolve an already-parsed address.
pub fn fetch_address<T>(
    address: &Address,
    target: &T,
    opts: FetchOptions,
) -> Result<Vec<Value>, AddressError>
where
    T: Addressable + ?Sized,
{
    let mut out = Vec::new();
    let first = address.head();
    match target.member(&first.name) {
        Some(value) => descend(address, address.segments(), &value, opts, &mut out)?,
        None => missing(address, &first.name, opts, &mut out)?,
    }
    Ok(out)
}

/// Resolve in single mode and return the one value.
pub fn fetch_one<T>(addr: &str, target: &T, strict: bool) -> Result<Value, AddressError>
where
    T: Addressable + ?Sized,
{
    let mut opts = FetchOptions::single();
    opts.raise_on_invalid = strict;
    let found = fetch(addr, target, opts)?;
    Ok(found.into_iter().next().unwrap_or(Value::Null))
}

// `value` is what segs[0].name resolved to; apply its selector, then the rest.
fn descend(
    address: &Address,
    segs: &[Segment],
    value: &Value,
    opts: FetchOptions,
    out: &mut Vec<Value>,
) -> Result<(), AddressError> {
    let seg = &segs[0];
    let rest = &segs[1..];

    match &seg.selector {
        Selector::None => continue_with(address, rest, value, opts, out),
        Selector::Index(index) => {
            let Some(items) = as_list(address, seg, value)? else {
                out.push(Value::Null);
                return Ok(());
            };
            match items.iter().find(|item| identity_matches(item, index)) {
                Some(item) => continue_with(address, rest, item, opts, out),
                None => {
                    out.push(Value::Null);
                    Ok(())
                }
            }
        }
        Selector::Splat => {
            if opts.mode == Mode::Single {
                return Err(AddressError::AmbiguousMatch(address.to_string()));
            }
            let Some(items) = as_list(address, seg, value)? else {
                out.push(Value::Null);
                return Ok(());
            };
            for item in items {
                continue_with(address, rest, item, opts, out)?;
            }
            Ok(())
        }
    }
}

fn continue_with(
    address: &Address,
    rest: &[Segment],
    value: &Value,
    opts: FetchOptions,
    out: &mut Vec<Value>,
) -> Result<(), AddressError> {
    let Some(next) = rest.first() else {
        out.push(value.clone());
        return Ok(());
    };

    match value {
        Value::Array(items) => {
            if opts.mode == Mode::Single {
                return Err(AddressError::AmbiguousMatch(address.to_string()));
            }
            for item in items {
                continue_with(address, rest, item, opts, out)?;
            }
            Ok(())
        }
        Value::Object(map) => match map.get(&next.name) {
            Some(child) => descend(address, rest, child, opts, out),
            None => missing(address, &next.name, opts, out),
        },
        _ => missing(address, &next.name, opts, out),
    }
}

fn missing(
    address: &Address,
    member: &str,
    opts: FetchOptions,
    out: &mut Vec<Value>,
) -> Result<(), AddressError> {
    if opts.raise_on_invalid {
        return Err(AddressError::MissingMember {
            address: address.to_string(),
            member: member.to_string(),
        });
    }
    out.push(Value::Null);
    Ok(())
}

// Null counts as absent; any other non-list is a type error.
fn as_list<'v>(
    address: &Address,
    seg: &Segment,
    value: &'v Value,
) -> Result<Option<&'v Vec<Value>>, AddressError> {
    match value {
        Value::Array(items) => Ok(Some(items)),
        Value::Null => Ok(None),
        _ => Err(AddressError::TypeMismatch {
            address: address.to_string(),
            segment: seg.to_string(),
        }),
    }
}

/// Does `item` carry the identity `index` (its `id` or `_id` member)?
fn identity_matches(item: &Value, index: &str) -> bool {
    let Value::Object(map) = item else {
        return false;
    };
    map.get("id")
        .or_else(|| map.get("_id"))
        .map(|id| identity_string(id) == index)
        .unwrap_or(false)
}

fn identity_string(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}
