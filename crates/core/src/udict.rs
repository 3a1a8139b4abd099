// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Typed attribute dictionary.
//!
//! A [`Udict`] maps *(type, name)* keys to typed values. Names are either
//! well-known short tags (see [`crate::flow`] and [`crate::uclock`] for the
//! standard sets) or application-defined strings. A key appears at most
//! once; iteration yields insertion order; replacing a value preserves its
//! position.
//!
//! Dictionaries are produced by a [`UdictMgr`], which recycles entry storage
//! up to a configurable depth. `serialize`/`deserialize` implement a compact
//! length-prefixed wire codec; decoding an unknown type tag yields
//! [`UbaseError::Invalid`].

use crate::error::{Result, UbaseError};
use bytes::{Buf, BufMut};
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A rational number, used for rates and aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: u64,
}

impl Rational {
    #[must_use]
    pub const fn new(num: i64, den: u64) -> Self {
        Self { num, den }
    }
}

/// The fixed set of value types a dictionary can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Opaque,
    String,
    Bool,
    SmallUnsigned,
    SmallInt,
    Unsigned,
    Int,
    Rational,
    Clock,
}

impl AttrType {
    const fn tag(self) -> u8 {
        match self {
            Self::Opaque => 0x01,
            Self::String => 0x02,
            Self::Bool => 0x03,
            Self::SmallUnsigned => 0x04,
            Self::SmallInt => 0x05,
            Self::Unsigned => 0x06,
            Self::Int => 0x07,
            Self::Rational => 0x08,
            Self::Clock => 0x09,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0x01 => Self::Opaque,
            0x02 => Self::String,
            0x03 => Self::Bool,
            0x04 => Self::SmallUnsigned,
            0x05 => Self::SmallInt,
            0x06 => Self::Unsigned,
            0x07 => Self::Int,
            0x08 => Self::Rational,
            0x09 => Self::Clock,
            _ => return Err(UbaseError::Invalid),
        })
    }
}

/// A typed attribute value. Small values are stored inline; opaque and
/// string payloads live on the heap with their lifetime tied to the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Opaque(Vec<u8>),
    String(String),
    Bool(bool),
    SmallUnsigned(u8),
    SmallInt(i8),
    Unsigned(u64),
    Int(i64),
    Rational(Rational),
    Clock(u64),
}

impl AttrValue {
    #[must_use]
    pub const fn attr_type(&self) -> AttrType {
        match self {
            Self::Opaque(_) => AttrType::Opaque,
            Self::String(_) => AttrType::String,
            Self::Bool(_) => AttrType::Bool,
            Self::SmallUnsigned(_) => AttrType::SmallUnsigned,
            Self::SmallInt(_) => AttrType::SmallInt,
            Self::Unsigned(_) => AttrType::Unsigned,
            Self::Int(_) => AttrType::Int,
            Self::Rational(_) => AttrType::Rational,
            Self::Clock(_) => AttrType::Clock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    ty: AttrType,
    name: Box<str>,
}

impl indexmap::Equivalent<Key> for (AttrType, &str) {
    fn equivalent(&self, key: &Key) -> bool {
        self.0 == key.ty && self.1 == &*key.name
    }
}

type EntryMap = IndexMap<Key, AttrValue>;

struct UdictMgrInner {
    depth: usize,
    free: Mutex<VecDeque<EntryMap>>,
}

/// Factory for dictionaries, recycling entry storage up to `depth`.
#[derive(Clone)]
pub struct UdictMgr {
    inner: Arc<UdictMgrInner>,
}

impl UdictMgr {
    /// The standard inline manager. Depth 0 disables recycling.
    #[must_use]
    pub fn inline_mgr(depth: usize) -> Self {
        Self { inner: Arc::new(UdictMgrInner { depth, free: Mutex::new(VecDeque::new()) }) }
    }

    /// Allocates an empty dictionary.
    #[must_use]
    pub fn alloc(&self) -> Udict {
        let map = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop_front())
            .unwrap_or_default();
        Udict { map, mgr: Some(self.clone()) }
    }

    fn recycle(&self, mut map: EntryMap) {
        if self.inner.depth == 0 {
            return;
        }
        if let Ok(mut free) = self.inner.free.lock() {
            if free.len() < self.inner.depth {
                map.clear();
                free.push_back(map);
            }
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.inner.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// An ordered, typed attribute set.
pub struct Udict {
    map: EntryMap,
    mgr: Option<UdictMgr>,
}

impl Udict {
    /// A dictionary with no backing manager, for tests and transient use.
    #[must_use]
    pub fn new() -> Self {
        Self { map: EntryMap::default(), mgr: None }
    }

    /// Deep copy, drawn from the same manager.
    #[must_use]
    pub fn dup(&self) -> Self {
        let mut copy = self.mgr.as_ref().map_or_else(Self::new, UdictMgr::alloc);
        copy.map.extend(self.map.iter().map(|(k, v)| (k.clone(), v.clone())));
        copy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Looks up a value by type and name.
    #[must_use]
    pub fn get(&self, ty: AttrType, name: &str) -> Option<&AttrValue> {
        self.map.get(&(ty, name))
    }

    /// Inserts or replaces a value. Replacement preserves the entry's
    /// position in iteration order.
    pub fn set(&mut self, name: &str, value: AttrValue) {
        let ty = value.attr_type();
        if let Some(slot) = self.map.get_mut(&(ty, name)) {
            *slot = value;
        } else {
            self.map.insert(Key { ty, name: name.into() }, value);
        }
    }

    /// Removes an entry; remaining entries keep their relative order.
    pub fn delete(&mut self, ty: AttrType, name: &str) -> bool {
        self.map.shift_remove(&(ty, name)).is_some()
    }

    /// Iterates keys in insertion order.
    pub fn iterate(&self) -> impl Iterator<Item = (AttrType, &str)> {
        self.map.keys().map(|k| (k.ty, &*k.name))
    }

    /// Iterates entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (AttrType, &str, &AttrValue)> {
        self.map.iter().map(|(k, v)| (k.ty, &*k.name, v))
    }

    /// Merges `src` into `self`; on conflicting keys `src` wins.
    pub fn import(&mut self, src: &Self) {
        for (k, v) in &src.map {
            if let Some(slot) = self.map.get_mut(k) {
                *slot = v.clone();
            } else {
                self.map.insert(k.clone(), v.clone());
            }
        }
    }

    /// Content equality, regardless of insertion order.
    #[must_use]
    pub fn compare(&self, other: &Self) -> bool {
        self.map == other.map
    }

    // Typed accessors. The untyped `get`/`set` pair above stays available
    // for generic code such as the wire codec.

    #[must_use]
    pub fn get_opaque(&self, name: &str) -> Option<&[u8]> {
        match self.get(AttrType::Opaque, name) {
            Some(AttrValue::Opaque(v)) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(AttrType::String, name) {
            Some(AttrValue::String(v)) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(AttrType::Bool, name) {
            Some(AttrValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_small_unsigned(&self, name: &str) -> Option<u8> {
        match self.get(AttrType::SmallUnsigned, name) {
            Some(AttrValue::SmallUnsigned(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_unsigned(&self, name: &str) -> Option<u64> {
        match self.get(AttrType::Unsigned, name) {
            Some(AttrValue::Unsigned(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(AttrType::Int, name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_rational(&self, name: &str) -> Option<Rational> {
        match self.get(AttrType::Rational, name) {
            Some(AttrValue::Rational(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_clock(&self, name: &str) -> Option<u64> {
        match self.get(AttrType::Clock, name) {
            Some(AttrValue::Clock(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_opaque(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.set(name, AttrValue::Opaque(value.into()));
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, AttrValue::String(value.into()));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.set(name, AttrValue::Bool(value));
    }

    pub fn set_small_unsigned(&mut self, name: &str, value: u8) {
        self.set(name, AttrValue::SmallUnsigned(value));
    }

    pub fn set_unsigned(&mut self, name: &str, value: u64) {
        self.set(name, AttrValue::Unsigned(value));
    }

    pub fn set_int(&mut self, name: &str, value: i64) {
        self.set(name, AttrValue::Int(value));
    }

    pub fn set_rational(&mut self, name: &str, value: Rational) {
        self.set(name, AttrValue::Rational(value));
    }

    pub fn set_clock(&mut self, name: &str, value: u64) {
        self.set(name, AttrValue::Clock(value));
    }

    /// Serializes to the compact wire format.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in &self.map {
            out.put_u8(k.ty.tag());
            debug_assert!(k.name.len() <= usize::from(u16::MAX));
            out.put_u16(k.name.len() as u16);
            out.put_slice(k.name.as_bytes());
            match v {
                AttrValue::Opaque(bytes) => {
                    out.put_u32(bytes.len() as u32);
                    out.put_slice(bytes);
                }
                AttrValue::String(s) => {
                    out.put_u32(s.len() as u32);
                    out.put_slice(s.as_bytes());
                }
                AttrValue::Bool(b) => out.put_u8(u8::from(*b)),
                AttrValue::SmallUnsigned(u) => out.put_u8(*u),
                AttrValue::SmallInt(i) => out.put_i8(*i),
                AttrValue::Unsigned(u) => out.put_u64(*u),
                AttrValue::Int(i) => out.put_i64(*i),
                AttrValue::Rational(r) => {
                    out.put_i64(r.num);
                    out.put_u64(r.den);
                }
                AttrValue::Clock(c) => out.put_u64(*c),
            }
        }
        out
    }

    /// Rebuilds a dictionary from its wire format.
    ///
    /// # Errors
    ///
    /// `Invalid` on truncated input, malformed UTF-8 names, or an
    /// unrecognized type tag.
    pub fn deserialize(mgr: &UdictMgr, mut buf: &[u8]) -> Result<Self> {
        let mut dict = mgr.alloc();
        while buf.has_remaining() {
            if buf.remaining() < 3 {
                return Err(UbaseError::Invalid);
            }
            let ty = AttrType::from_tag(buf.get_u8())?;
            let name_len = usize::from(buf.get_u16());
            if buf.remaining() < name_len {
                return Err(UbaseError::Invalid);
            }
            let name = std::str::from_utf8(&buf[..name_len])
                .map_err(|_| UbaseError::Invalid)?
                .to_owned();
            buf.advance(name_len);

            let value = match ty {
                AttrType::Opaque | AttrType::String => {
                    if buf.remaining() < 4 {
                        return Err(UbaseError::Invalid);
                    }
                    let len = buf.get_u32() as usize;
                    if buf.remaining() < len {
                        return Err(UbaseError::Invalid);
                    }
                    let payload = buf[..len].to_vec();
                    buf.advance(len);
                    if ty == AttrType::Opaque {
                        AttrValue::Opaque(payload)
                    } else {
                        AttrValue::String(
                            String::from_utf8(payload).map_err(|_| UbaseError::Invalid)?,
                        )
                    }
                }
                AttrType::Bool => {
                    if buf.remaining() < 1 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::Bool(buf.get_u8() != 0)
                }
                AttrType::SmallUnsigned => {
                    if buf.remaining() < 1 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::SmallUnsigned(buf.get_u8())
                }
                AttrType::SmallInt => {
                    if buf.remaining() < 1 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::SmallInt(buf.get_i8())
                }
                AttrType::Unsigned => {
                    if buf.remaining() < 8 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::Unsigned(buf.get_u64())
                }
                AttrType::Int => {
                    if buf.remaining() < 8 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::Int(buf.get_i64())
                }
                AttrType::Rational => {
                    if buf.remaining() < 16 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::Rational(Rational { num: buf.get_i64(), den: buf.get_u64() })
                }
                AttrType::Clock => {
                    if buf.remaining() < 8 {
                        return Err(UbaseError::Invalid);
                    }
                    AttrValue::Clock(buf.get_u64())
                }
            };
            dict.set(&name, value);
        }
        Ok(dict)
    }
}

impl Default for Udict {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Udict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.map {
            map.entry(&format_args!("{:?}/{}", k.ty, k.name), v);
        }
        map.finish()
    }
}

impl Drop for Udict {
    fn drop(&mut self) {
        if let Some(mgr) = self.mgr.take() {
            mgr.recycle(std::mem::take(&mut self.map));
        }
    }
}
