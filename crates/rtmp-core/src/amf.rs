//! AMF0 codec for command and metadata payloads.
//!
//! Decoding is descriptor-driven: the caller lays out the values it expects
//! as a slice of `Elt`, each pointing at a local to fill in. Values of the
//! wrong type, unknown object members and surplus array items are decoded
//! and dropped, so the cursor always lands on a value boundary.
//!
//! Encoding takes `Value` trees and writes them straight into pool blocks,
//! ready for the chunk send path.
//!
//! Two outcomes are distinct on decode:
//!   - `Err(AmfError)`: malformed or truncated input. Fatal to the message.
//!   - `Ok(())` with some targets untouched: an optional element or an
//!     unterminated object ran into a clean end of input.

use std::borrow::Cow;
use std::ops::BitOr;

use crate::pool::{BufferPool, Chain, PoolError};

/// Deepest nesting of objects and arrays accepted on decode.
pub const MAX_DEPTH: usize = 64;

// ── Type markers ──────────────────────────────────────────────────────────────

pub mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const ARRAY_NULL: u8 = 0x06;
    pub const MIXED_ARRAY: u8 = 0x08;
    pub const END: u8 = 0x09;
    pub const ARRAY: u8 = 0x0a;
}

/// Value kinds. The integer kinds and `Variant` have no wire marker and
/// only appear typeless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmfType {
    Number,
    Boolean,
    String,
    Object,
    Null,
    ArrayNull,
    MixedArray,
    End,
    Array,
    Int8,
    Int16,
    Int32,
    Variant,
}

impl AmfType {
    pub fn from_marker(m: u8) -> Option<Self> {
        Some(match m {
            marker::NUMBER => Self::Number,
            marker::BOOLEAN => Self::Boolean,
            marker::STRING => Self::String,
            marker::OBJECT => Self::Object,
            marker::NULL => Self::Null,
            marker::ARRAY_NULL => Self::ArrayNull,
            marker::MIXED_ARRAY => Self::MixedArray,
            marker::END => Self::End,
            marker::ARRAY => Self::Array,
            _ => return None,
        })
    }

    pub fn marker(self) -> Option<u8> {
        Some(match self {
            Self::Number => marker::NUMBER,
            Self::Boolean => marker::BOOLEAN,
            Self::String => marker::STRING,
            Self::Object => marker::OBJECT,
            Self::Null => marker::NULL,
            Self::ArrayNull => marker::ARRAY_NULL,
            Self::MixedArray => marker::MIXED_ARRAY,
            Self::End => marker::END,
            Self::Array => marker::ARRAY,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Variant => return None,
        })
    }

    /// Objects and mixed arrays share a body layout and satisfy each other.
    fn accepts(self, actual: AmfType) -> bool {
        self == actual
            || matches!(
                (self, actual),
                (Self::Object, Self::MixedArray) | (Self::MixedArray, Self::Object)
            )
    }
}

/// Descriptor modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// End of input in place of this element stops decoding cleanly.
    pub const OPTIONAL: Flags = Flags(0x01);
    /// No type marker precedes the value; the descriptor's kind is used.
    pub const TYPELESS: Flags = Flags(0x02);
    /// Record the cursor position instead of the value.
    pub const CONTEXT: Flags = Flags(0x04);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

// ── Cursor ────────────────────────────────────────────────────────────────────

/// Read position over a payload split across several buffers.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    parts: Vec<&'a [u8]>,
    part: usize,
    offset: usize,
    position: usize,
    total: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(parts: Vec<&'a [u8]>) -> Self {
        let total = parts.iter().map(|p| p.len()).sum();
        Self { parts, part: 0, offset: 0, position: 0, total }
    }

    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self::new(vec![bytes])
    }

    pub fn from_chain(chain: &'a Chain) -> Self {
        Self::new(chain.slices())
    }

    /// Bytes consumed since the start of the payload.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.total - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Jump to an absolute position, e.g. one recorded by a context element.
    pub fn seek(&mut self, position: usize) -> Result<(), AmfError> {
        self.part = 0;
        self.offset = 0;
        self.position = 0;
        self.skip(position)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), AmfError> {
        self.take(n, |_| {})
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), AmfError> {
        let mut filled = 0;
        self.take(out.len(), |piece| {
            out[filled..filled + piece.len()].copy_from_slice(piece);
            filled += piece.len();
        })
    }

    pub fn read_u8(&mut self) -> Result<u8, AmfError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, AmfError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, AmfError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], AmfError> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Consume `n` bytes, feeding each contiguous piece to `sink`.
    /// Nothing is consumed when fewer than `n` bytes remain.
    fn take(&mut self, n: usize, mut sink: impl FnMut(&'a [u8])) -> Result<(), AmfError> {
        if self.remaining() < n {
            return Err(AmfError::UnexpectedEof);
        }
        let mut left = n;
        while left > 0 {
            let part = self.parts[self.part];
            let avail = part.len() - self.offset;
            if avail == 0 {
                self.part += 1;
                self.offset = 0;
                continue;
            }
            let step = avail.min(left);
            sink(&part[self.offset..self.offset + step]);
            self.offset += step;
            self.position += step;
            left -= step;
        }
        Ok(())
    }
}

// ── Descriptors ───────────────────────────────────────────────────────────────

/// Where a decoded value goes.
#[derive(Debug)]
pub enum Target<'a> {
    Ignore,
    Number(&'a mut f64),
    Boolean(&'a mut bool),
    String(&'a mut String),
    Int8(&'a mut u8),
    Int16(&'a mut u16),
    Int32(&'a mut u32),
    /// Object or mixed-array members, array items, or variant candidates.
    Members(&'a mut [Elt<'a>]),
    /// Position just past the value's type marker.
    Context(&'a mut Option<usize>),
}

/// One expected value.
#[derive(Debug)]
pub struct Elt<'a> {
    pub kind: AmfType,
    pub flags: Flags,
    /// Member name inside an object; ignored elsewhere.
    pub name: &'a str,
    /// String targets keep at most this many bytes.
    pub capacity: usize,
    pub target: Target<'a>,
}

impl<'a> Elt<'a> {
    fn with(kind: AmfType, name: &'a str, target: Target<'a>) -> Self {
        Self { kind, flags: Flags::NONE, name, capacity: usize::MAX, target }
    }

    pub fn number(name: &'a str, v: &'a mut f64) -> Self {
        Self::with(AmfType::Number, name, Target::Number(v))
    }

    pub fn boolean(name: &'a str, v: &'a mut bool) -> Self {
        Self::with(AmfType::Boolean, name, Target::Boolean(v))
    }

    pub fn string(name: &'a str, v: &'a mut String) -> Self {
        Self::with(AmfType::String, name, Target::String(v))
    }

    pub fn object(name: &'a str, members: &'a mut [Elt<'a>]) -> Self {
        Self::with(AmfType::Object, name, Target::Members(members))
    }

    pub fn mixed_array(name: &'a str, members: &'a mut [Elt<'a>]) -> Self {
        Self::with(AmfType::MixedArray, name, Target::Members(members))
    }

    pub fn array(name: &'a str, items: &'a mut [Elt<'a>]) -> Self {
        Self::with(AmfType::Array, name, Target::Members(items))
    }

    pub fn int8(name: &'a str, v: &'a mut u8) -> Self {
        Self::with(AmfType::Int8, name, Target::Int8(v))
    }

    pub fn int16(name: &'a str, v: &'a mut u16) -> Self {
        Self::with(AmfType::Int16, name, Target::Int16(v))
    }

    pub fn int32(name: &'a str, v: &'a mut u32) -> Self {
        Self::with(AmfType::Int32, name, Target::Int32(v))
    }

    /// Expect a value of `kind` and throw it away.
    pub fn skip(kind: AmfType, name: &'a str) -> Self {
        Self::with(kind, name, Target::Ignore)
    }

    pub fn null(name: &'a str) -> Self {
        Self::skip(AmfType::Null, name)
    }

    /// A type marker picks which candidate receives the value.
    pub fn variant(name: &'a str, candidates: &'a mut [Elt<'a>]) -> Self {
        Self::with(AmfType::Variant, name, Target::Members(candidates)).typeless()
    }

    /// Record where a value of `kind` starts, skip over it, and leave
    /// parsing it to a later `Cursor::seek` + typeless decode.
    pub fn context(kind: AmfType, name: &'a str, slot: &'a mut Option<usize>) -> Self {
        let mut elt = Self::with(kind, name, Target::Context(slot));
        elt.flags = elt.flags | Flags::CONTEXT;
        elt
    }

    pub fn optional(mut self) -> Self {
        self.flags = self.flags | Flags::OPTIONAL;
        self
    }

    pub fn typeless(mut self) -> Self {
        self.flags = self.flags | Flags::TYPELESS;
        self
    }

    pub fn capacity(mut self, n: usize) -> Self {
        self.capacity = n;
        self
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

enum Step {
    Next,
    Stop,
}

/// Decode values from `cur` into `elts`, in order.
pub fn decode(cur: &mut Cursor<'_>, elts: &mut [Elt<'_>]) -> Result<(), AmfError> {
    for elt in elts.iter_mut() {
        if let Step::Stop = read_elt(cur, elt, 0)? {
            break;
        }
    }
    Ok(())
}

/// Decode and discard every remaining value. Returns how many were skipped.
pub fn skip_all(cur: &mut Cursor<'_>) -> Result<usize, AmfError> {
    let mut count = 0;
    while !cur.is_empty() {
        skip_value(cur, 0)?;
        count += 1;
    }
    Ok(count)
}

fn read_elt(cur: &mut Cursor<'_>, elt: &mut Elt<'_>, depth: usize) -> Result<Step, AmfError> {
    let actual = if elt.flags.contains(Flags::TYPELESS) {
        elt.kind
    } else {
        let m = match cur.read_u8() {
            Ok(m) => m,
            Err(AmfError::UnexpectedEof) if elt.flags.contains(Flags::OPTIONAL) => {
                return Ok(Step::Stop)
            }
            Err(e) => return Err(e),
        };
        AmfType::from_marker(m).ok_or(AmfError::UnknownMarker(m))?
    };

    if actual == AmfType::End {
        return Ok(Step::Stop);
    }

    let accepts = elt.kind.accepts(actual);
    if elt.flags.contains(Flags::CONTEXT) {
        if let (true, Target::Context(slot)) = (accepts, &mut elt.target) {
            **slot = Some(cur.position());
        }
        read_value(cur, actual, None, usize::MAX, depth)?;
    } else if accepts {
        read_value(cur, actual, Some(&mut elt.target), elt.capacity, depth)?;
    } else {
        read_value(cur, actual, None, usize::MAX, depth)?;
    }
    Ok(Step::Next)
}

fn skip_value(cur: &mut Cursor<'_>, depth: usize) -> Result<(), AmfError> {
    let m = cur.read_u8()?;
    let actual = AmfType::from_marker(m).ok_or(AmfError::UnknownMarker(m))?;
    read_value(cur, actual, None, usize::MAX, depth)
}

fn members<'t, 'a>(target: Option<&'t mut Target<'a>>) -> Option<&'t mut [Elt<'a>]> {
    match target {
        Some(Target::Members(m)) => Some(&mut **m),
        _ => None,
    }
}

fn read_value(
    cur: &mut Cursor<'_>,
    actual: AmfType,
    target: Option<&mut Target<'_>>,
    capacity: usize,
    depth: usize,
) -> Result<(), AmfError> {
    if matches!(actual, AmfType::Object | AmfType::MixedArray | AmfType::Array) && depth >= MAX_DEPTH {
        return Err(AmfError::TooDeep);
    }
    match actual {
        AmfType::Number => {
            let v = f64::from_be_bytes(cur.read_array()?);
            if let Some(Target::Number(out)) = target {
                **out = v;
            }
        }
        AmfType::Boolean => {
            let v = cur.read_u8()? != 0;
            if let Some(Target::Boolean(out)) = target {
                **out = v;
            }
        }
        AmfType::String => {
            let len = cur.read_u16()? as usize;
            match target {
                Some(Target::String(out)) => {
                    let keep = len.min(capacity);
                    let mut bytes = vec![0u8; keep];
                    cur.read_exact(&mut bytes)?;
                    cur.skip(len - keep)?;
                    **out = String::from_utf8_lossy(&bytes).into_owned();
                }
                _ => cur.skip(len)?,
            }
        }
        AmfType::Null | AmfType::ArrayNull | AmfType::End => {}
        AmfType::Object => read_object(cur, members(target), depth + 1)?,
        AmfType::MixedArray => {
            cur.skip(4)?;
            read_object(cur, members(target), depth + 1)?;
        }
        AmfType::Array => read_array(cur, members(target), depth + 1)?,
        AmfType::Variant => read_variant(cur, members(target), depth)?,
        AmfType::Int8 => {
            let v = cur.read_u8()?;
            if let Some(Target::Int8(out)) = target {
                **out = v;
            }
        }
        AmfType::Int16 => {
            let v = cur.read_u16()?;
            if let Some(Target::Int16(out)) = target {
                **out = v;
            }
        }
        AmfType::Int32 => {
            let v = cur.read_u32()?;
            if let Some(Target::Int32(out)) = target {
                **out = v;
            }
        }
    }
    Ok(())
}

fn read_object(
    cur: &mut Cursor<'_>,
    mut members: Option<&mut [Elt<'_>]>,
    depth: usize,
) -> Result<(), AmfError> {
    loop {
        // Some encoders never write the terminator.
        let len = match cur.read_u16() {
            Ok(n) => n as usize,
            Err(AmfError::UnexpectedEof) => return Ok(()),
            Err(e) => return Err(e),
        };
        if len == 0 {
            break;
        }

        let mut name = vec![0u8; len];
        cur.read_exact(&mut name)?;

        let slot = members
            .as_deref_mut()
            .and_then(|m| m.iter_mut().find(|e| e.name.as_bytes() == name.as_slice()));
        match slot {
            Some(elt) => {
                read_elt(cur, elt, depth)?;
            }
            None => skip_value(cur, depth)?,
        }
    }

    let end = cur.read_u8()?;
    if end != marker::END {
        return Err(AmfError::MissingObjectEnd(end));
    }
    Ok(())
}

fn read_array(
    cur: &mut Cursor<'_>,
    mut items: Option<&mut [Elt<'_>]>,
    depth: usize,
) -> Result<(), AmfError> {
    let count = cur.read_u32()? as usize;
    for i in 0..count {
        match items.as_deref_mut().and_then(|m| m.get_mut(i)) {
            Some(elt) => {
                read_elt(cur, elt, depth)?;
            }
            None => skip_value(cur, depth)?,
        }
    }
    Ok(())
}

fn read_variant(
    cur: &mut Cursor<'_>,
    candidates: Option<&mut [Elt<'_>]>,
    depth: usize,
) -> Result<(), AmfError> {
    let m = cur.read_u8()?;
    let actual = AmfType::from_marker(m).ok_or(AmfError::UnknownMarker(m))?;

    // Later candidates override earlier ones of the same kind.
    let chosen = candidates.and_then(|c| c.iter_mut().rev().find(|e| e.kind == actual));
    match chosen {
        Some(elt) => {
            let capacity = elt.capacity;
            read_value(cur, actual, Some(&mut elt.target), capacity, depth)
        }
        None => read_value(cur, actual, None, usize::MAX, depth),
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// An AMF value to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Number(f64),
    Boolean(bool),
    String(Cow<'a, str>),
    Object(Vec<(Cow<'a, str>, Value<'a>)>),
    Null,
    ArrayNull,
    MixedArray(Vec<(Cow<'a, str>, Value<'a>)>),
    Array(Vec<Value<'a>>),
    Int8(u8),
    Int16(u16),
    Int32(u32),
}

impl<'a> Value<'a> {
    pub fn string(s: impl Into<Cow<'a, str>>) -> Self {
        Self::String(s.into())
    }

    pub fn object(members: impl IntoIterator<Item = (&'a str, Value<'a>)>) -> Self {
        Self::Object(members.into_iter().map(|(k, v)| (Cow::Borrowed(k), v)).collect())
    }

    pub fn amf_type(&self) -> AmfType {
        match self {
            Self::Number(_) => AmfType::Number,
            Self::Boolean(_) => AmfType::Boolean,
            Self::String(_) => AmfType::String,
            Self::Object(_) => AmfType::Object,
            Self::Null => AmfType::Null,
            Self::ArrayNull => AmfType::ArrayNull,
            Self::MixedArray(_) => AmfType::MixedArray,
            Self::Array(_) => AmfType::Array,
            Self::Int8(_) => AmfType::Int8,
            Self::Int16(_) => AmfType::Int16,
            Self::Int32(_) => AmfType::Int32,
        }
    }
}

/// Writes values into pool blocks.
pub struct Encoder<'p> {
    pool: &'p BufferPool,
    chain: Chain,
}

impl<'p> Encoder<'p> {
    pub fn new(pool: &'p BufferPool) -> Self {
        Self { pool, chain: Chain::new() }
    }

    pub fn write(&mut self, v: &Value<'_>) -> Result<(), AmfError> {
        self.put_value(v, true)
    }

    /// Write without the leading type marker.
    pub fn write_typeless(&mut self, v: &Value<'_>) -> Result<(), AmfError> {
        self.put_value(v, false)
    }

    pub fn finish(self) -> Chain {
        self.chain
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), AmfError> {
        self.pool.append(&mut self.chain, bytes)?;
        Ok(())
    }

    fn put_value(&mut self, v: &Value<'_>, typed: bool) -> Result<(), AmfError> {
        if typed {
            let kind = v.amf_type();
            let m = kind.marker().ok_or(AmfError::NoMarker(kind))?;
            self.put(&[m])?;
        }
        match v {
            Value::Number(n) => self.put(&n.to_be_bytes()),
            Value::Boolean(b) => self.put(&[*b as u8]),
            Value::String(s) => self.put_string(s),
            Value::Null | Value::ArrayNull => Ok(()),
            Value::Object(members) => self.put_members(members),
            Value::MixedArray(members) => {
                self.put(&(members.len() as u32).to_be_bytes())?;
                self.put_members(members)
            }
            Value::Array(items) => {
                self.put(&(items.len() as u32).to_be_bytes())?;
                for item in items {
                    self.put_value(item, true)?;
                }
                Ok(())
            }
            Value::Int8(n) => self.put(&[*n]),
            Value::Int16(n) => self.put(&n.to_be_bytes()),
            Value::Int32(n) => self.put(&n.to_be_bytes()),
        }
    }

    fn put_string(&mut self, s: &str) -> Result<(), AmfError> {
        let len = u16::try_from(s.len()).map_err(|_| AmfError::StringTooLong(s.len()))?;
        self.put(&len.to_be_bytes())?;
        self.put(s.as_bytes())
    }

    fn put_members(&mut self, members: &[(Cow<'_, str>, Value<'_>)]) -> Result<(), AmfError> {
        for (name, value) in members {
            self.put_string(name)?;
            self.put_value(value, true)?;
        }
        self.put(&[0, 0, marker::END])
    }
}

/// Encode `values` in order into a fresh chain.
pub fn encode(pool: &BufferPool, values: &[Value<'_>]) -> Result<Chain, AmfError> {
    let mut enc = Encoder::new(pool);
    for v in values {
        enc.write(v)?;
    }
    Ok(enc.finish())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF type marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("object end marker expected, found 0x{0:02x}")]
    MissingObjectEnd(u8),

    #[error("{0:?} values have no type marker")]
    NoMarker(AmfType),

    #[error("string of {0} bytes exceeds 16-bit length")]
    StringTooLong(usize),

    #[error("AMF values nested too deeply")]
    TooDeep,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
