//! Compact term operands.
//!
//! ```text
//! byte & 0x07      tag: u i a x y f h z
//! byte & 0x08 == 0 value = byte >> 4                      (0..16)
//! byte & 0x10 == 0 value = (byte & 0xE0) << 3 | next      (0..2048)
//! otherwise        n = (byte >> 5) + 2 big-endian bytes follow;
//!                  n = 7 + 2 means a nested `u` term holds n - 9
//! ```
//!
//! Tag `z` selects an extended operand by `byte >> 4` (list, float register,
//! allocation list, literal index, typed register).

use core::fmt;

use crate::{ByteReader, ByteWriter, CoreError, CoreResult};

const TAG_U: u8 = 0;
const TAG_I: u8 = 1;
const TAG_A: u8 = 2;
const TAG_X: u8 = 3;
const TAG_Y: u8 = 4;
const TAG_F: u8 = 5;
const TAG_H: u8 = 6;
const TAG_Z: u8 = 7;

const EXT_LIST: u8 = 1;
const EXT_FLOAT_REG: u8 = 2;
const EXT_ALLOC_LIST: u8 = 3;
const EXT_LITERAL: u8 = 4;
const EXT_TYPED_REG: u8 = 5;

/// One decoded instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Unsigned literal (`u`): arities, import indices, label definitions.
    Unsigned(u64),
    /// Signed integer (`i`) that fits 64 bits.
    Integer(i64),
    /// Signed integer wider than 64 bits, two's complement big-endian.
    BigInteger(Vec<u8>),
    /// Atom index (`a`), 1-based.
    Atom(u32),
    /// Atom 0, the empty list.
    Nil,
    /// X register.
    X(u32),
    /// Y register.
    Y(u32),
    /// Label reference (`f`); 0 means "no label".
    Label(u32),
    /// Character (`h`).
    Char(u32),
    /// Operand list (select tables, `put_tuple2`, …).
    List(Vec<Operand>),
    /// Float register.
    FloatReg(u32),
    /// Allocation list: `(kind, amount)` pairs.
    AllocList(Vec<(u32, u64)>),
    /// Literal table index.
    Literal(u32),
    /// Register annotated with a type table index.
    TypedRegister {
        /// Underlying register.
        register: Box<Operand>,
        /// Index into the type table.
        type_index: u32,
    },
}

impl Operand {
    /// Value of an unsigned operand.
    pub fn as_unsigned(&self) -> Option<u64> {
        match *self {
            Self::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    /// Atom index (`Nil` is atom 0).
    pub fn as_atom(&self) -> Option<u32> {
        match *self {
            Self::Atom(a) => Some(a),
            Self::Nil => Some(0),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::BigInteger(bytes) => {
                f.write_str("big(0x")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                f.write_str(")")
            }
            Self::Atom(a) => write!(f, "a({a})"),
            Self::Nil => f.write_str("nil"),
            Self::X(r) => write!(f, "x({r})"),
            Self::Y(r) => write!(f, "y({r})"),
            Self::Label(l) => write!(f, "f({l})"),
            Self::Char(c) => write!(f, "h({c})"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{it}")?;
                }
                f.write_str("]")
            }
            Self::FloatReg(r) => write!(f, "fr({r})"),
            Self::AllocList(items) => {
                f.write_str("alloc[")?;
                for (i, (kind, n)) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    let kind = match kind {
                        0 => "words",
                        1 => "floats",
                        2 => "funs",
                        _ => "?",
                    };
                    write!(f, "{kind}={n}")?;
                }
                f.write_str("]")
            }
            Self::Literal(i) => write!(f, "lit({i})"),
            Self::TypedRegister { register, type_index } => write!(f, "{register}::t{type_index}"),
        }
    }
}

/* ─────────────────────────── Decoding ─────────────────────────── */

enum Value<'a> {
    Small(u64),
    Bytes(&'a [u8]),
}

impl Value<'_> {
    fn unsigned(&self) -> CoreResult<u64> {
        match *self {
            Value::Small(v) => Ok(v),
            Value::Bytes(bytes) => {
                let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
                let digits = &bytes[start..];
                if digits.len() > 8 {
                    return Err(CoreError::malformed(format!("unsigned operand of {} bytes", bytes.len())));
                }
                Ok(digits.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b)))
            }
        }
    }

    fn index(&self) -> CoreResult<u32> {
        u32::try_from(self.unsigned()?).map_err(|_| CoreError::malformed("operand index overflows u32"))
    }

    fn signed(&self) -> Operand {
        match *self {
            Value::Small(v) => Operand::Integer(v as i64),
            Value::Bytes(bytes) if bytes.len() <= 8 => {
                let seed: i64 = if bytes.first().is_some_and(|b| b & 0x80 != 0) { -1 } else { 0 };
                Operand::Integer(bytes.iter().fold(seed, |acc, &b| (acc << 8) | i64::from(b)))
            }
            Value::Bytes(bytes) => Operand::BigInteger(bytes.to_vec()),
        }
    }
}

fn read_value<'a>(first: u8, r: &mut ByteReader<'a>) -> CoreResult<Value<'a>> {
    if first & 0x08 == 0 {
        return Ok(Value::Small(u64::from(first >> 4)));
    }
    if first & 0x10 == 0 {
        let lo = r.read_u8()?;
        return Ok(Value::Small((u64::from(first & 0xE0) << 3) | u64::from(lo)));
    }
    let len = match first >> 5 {
        7 => {
            let extra = usize::try_from(read_unsigned(r)?)
                .map_err(|_| CoreError::malformed("operand length overflow"))?;
            extra.saturating_add(9)
        }
        n => usize::from(n) + 2,
    };
    Ok(Value::Bytes(r.read_bytes(len)?))
}

/// Read one operand that must be an unsigned literal.
pub fn read_unsigned(r: &mut ByteReader<'_>) -> CoreResult<u64> {
    let at = r.offset();
    match read_operand(r)? {
        Operand::Unsigned(v) => Ok(v),
        other => Err(CoreError::malformed(format!("expected unsigned at {at}, found {other}"))),
    }
}

fn read_index(r: &mut ByteReader<'_>) -> CoreResult<u32> {
    u32::try_from(read_unsigned(r)?).map_err(|_| CoreError::malformed("operand index overflows u32"))
}

/// Decode the next operand.
pub fn read_operand(r: &mut ByteReader<'_>) -> CoreResult<Operand> {
    let first = r.read_u8()?;
    let tag = first & 0x07;
    if tag == TAG_Z {
        return read_extended(first, r);
    }
    let value = read_value(first, r)?;
    Ok(match tag {
        TAG_U => Operand::Unsigned(value.unsigned()?),
        TAG_I => value.signed(),
        TAG_A => match value.index()? {
            0 => Operand::Nil,
            a => Operand::Atom(a),
        },
        TAG_X => Operand::X(value.index()?),
        TAG_Y => Operand::Y(value.index()?),
        TAG_F => Operand::Label(value.index()?),
        _ => Operand::Char(value.index()?),
    })
}

fn read_extended(first: u8, r: &mut ByteReader<'_>) -> CoreResult<Operand> {
    if first & 0x08 != 0 {
        return Err(CoreError::malformed(format!("unsupported extended operand 0x{first:02x}")));
    }
    match first >> 4 {
        EXT_LIST => {
            let count = read_count(r)?;
            let items = (0..count).map(|_| read_operand(r)).collect::<CoreResult<_>>()?;
            Ok(Operand::List(items))
        }
        EXT_FLOAT_REG => Ok(Operand::FloatReg(read_index(r)?)),
        EXT_ALLOC_LIST => {
            let count = read_count(r)?;
            let items = (0..count)
                .map(|_| Ok((read_index(r)?, read_unsigned(r)?)))
                .collect::<CoreResult<_>>()?;
            Ok(Operand::AllocList(items))
        }
        EXT_LITERAL => Ok(Operand::Literal(read_index(r)?)),
        EXT_TYPED_REG => {
            let register = Box::new(read_operand(r)?);
            if !matches!(*register, Operand::X(_) | Operand::Y(_)) {
                return Err(CoreError::malformed(format!("typed operand wraps {register}")));
            }
            Ok(Operand::TypedRegister { register, type_index: read_index(r)? })
        }
        kind => Err(CoreError::malformed(format!("unknown extended operand kind {kind}"))),
    }
}

// each element needs at least one byte
fn read_count(r: &mut ByteReader<'_>) -> CoreResult<usize> {
    let n = read_unsigned(r)?;
    match usize::try_from(n) {
        Ok(n) if n <= r.remaining() => Ok(n),
        _ => Err(CoreError::malformed(format!("operand list of {n} items exceeds input"))),
    }
}

/* ─────────────────────────── Encoding ─────────────────────────── */

/// Encode one operand (shortest form).
pub fn write_operand(w: &mut ByteWriter, op: &Operand) {
    match op {
        Operand::Unsigned(v) => write_value(w, TAG_U, *v),
        Operand::Integer(v) => match u64::try_from(*v) {
            Ok(v) => write_value(w, TAG_I, v),
            Err(_) => write_bytes_form(w, TAG_I, &signed_bytes(*v)),
        },
        Operand::BigInteger(bytes) => write_bytes_form(w, TAG_I, bytes),
        Operand::Atom(a) => write_value(w, TAG_A, u64::from(*a)),
        Operand::Nil => write_value(w, TAG_A, 0),
        Operand::X(r) => write_value(w, TAG_X, u64::from(*r)),
        Operand::Y(r) => write_value(w, TAG_Y, u64::from(*r)),
        Operand::Label(l) => write_value(w, TAG_F, u64::from(*l)),
        Operand::Char(c) => write_value(w, TAG_H, u64::from(*c)),
        Operand::List(items) => {
            w.write_u8(EXT_LIST << 4 | TAG_Z);
            write_value(w, TAG_U, items.len() as u64);
            for it in items {
                write_operand(w, it);
            }
        }
        Operand::FloatReg(r) => {
            w.write_u8(EXT_FLOAT_REG << 4 | TAG_Z);
            write_value(w, TAG_U, u64::from(*r));
        }
        Operand::AllocList(items) => {
            w.write_u8(EXT_ALLOC_LIST << 4 | TAG_Z);
            write_value(w, TAG_U, items.len() as u64);
            for (kind, n) in items {
                write_value(w, TAG_U, u64::from(*kind));
                write_value(w, TAG_U, *n);
            }
        }
        Operand::Literal(i) => {
            w.write_u8(EXT_LITERAL << 4 | TAG_Z);
            write_value(w, TAG_U, u64::from(*i));
        }
        Operand::TypedRegister { register, type_index } => {
            w.write_u8(EXT_TYPED_REG << 4 | TAG_Z);
            write_operand(w, register);
            write_value(w, TAG_U, u64::from(*type_index));
        }
    }
}

fn write_value(w: &mut ByteWriter, tag: u8, v: u64) {
    if v < 0x10 {
        w.write_u8((v as u8) << 4 | tag);
    } else if v < 0x800 {
        w.write_u8(((v >> 3) & 0xE0) as u8 | 0x08 | tag);
        w.write_u8((v & 0xFF) as u8);
    } else {
        write_bytes_form(w, tag, &unsigned_bytes(v));
    }
}

fn write_bytes_form(w: &mut ByteWriter, tag: u8, bytes: &[u8]) {
    let n = bytes.len();
    if n <= 8 {
        w.write_u8(((n.saturating_sub(2) as u8) << 5) | 0x18 | tag);
    } else {
        w.write_u8(0xF8 | tag);
        write_value(w, TAG_U, (n - 9) as u64);
    }
    w.write_bytes(bytes);
}

// Minimal big-endian form, kept positive when read as two's complement.
fn unsigned_bytes(v: u64) -> Vec<u8> {
    let raw = v.to_be_bytes();
    let start = raw.iter().position(|&b| b != 0).unwrap_or(7).min(6);
    let mut out = Vec::with_capacity(9);
    if raw[start] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&raw[start..]);
    out
}

fn signed_bytes(v: i64) -> Vec<u8> {
    let raw = v.to_be_bytes();
    let mut start = 0;
    while start < 6 {
        let redundant = (raw[start] == 0x00 && raw[start + 1] & 0x80 == 0)
            || (raw[start] == 0xFF && raw[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    raw[start..].to_vec()
}
