//! Attribute dictionary: inline TLV-encoded typed key-value store (C3).
//!
//! Entries are packed back to back in a single buffer. A named entry is
//! `[type:u8][len:u16 BE][name\0][value]`, where `len` covers `name\0value`.
//! A shorthand entry (a well-known, pre-registered name/type pair) omits the
//! name and, for fixed-width base types, the length too:
//! `[code:u8][value]` or, for variable-width base types, `[code:u8][len:u16 BE][value]`.
//! The dictionary ends with a single sentinel byte, [`END`].

use crate::umem::Umem;

/// Wire type code for a base attribute type (0..=10), or the sentinel [`END`].
pub type TypeCode = u8;

pub const END: TypeCode = 0;
pub const OPAQUE: TypeCode = 1;
pub const STRING: TypeCode = 2;
pub const VOID: TypeCode = 3;
pub const BOOL: TypeCode = 4;
pub const SMALL_UNSIGNED: TypeCode = 5;
pub const SMALL_INT: TypeCode = 6;
pub const UNSIGNED: TypeCode = 7;
pub const INT: TypeCode = 8;
pub const RATIONAL: TypeCode = 9;
pub const FLOAT: TypeCode = 10;
/// Base type codes strictly above this value are shorthand codes.
pub const SHORTHAND: TypeCode = 11;

/// A base attribute type, independent of whether it is reached via a named
/// entry or a shorthand code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum BaseType {
    Opaque = OPAQUE,
    String = STRING,
    Void = VOID,
    Bool = BOOL,
    SmallUnsigned = SMALL_UNSIGNED,
    SmallInt = SMALL_INT,
    Unsigned = UNSIGNED,
    Int = INT,
    Rational = RATIONAL,
    Float = FLOAT,
}

impl BaseType {
    /// Fixed width in bytes of this type's value, or `None` if variable-width.
    fn fixed_size(self) -> Option<usize> {
        match self {
            BaseType::Opaque | BaseType::String => None,
            BaseType::Void => Some(0),
            BaseType::Bool | BaseType::SmallUnsigned | BaseType::SmallInt => Some(1),
            BaseType::Unsigned | BaseType::Int | BaseType::Float => Some(8),
            BaseType::Rational => Some(16),
        }
    }

    fn is_variable(self) -> bool {
        self.fixed_size().is_none()
    }
}

struct ShorthandEntry {
    name: &'static str,
    base_type: BaseType,
}

/// A well-known (name, type) pair that can be encoded on the wire without
/// repeating the name. Discriminant order matches [`SHORTHANDS`] exactly;
/// the discriminant is the wire code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Shorthand {
    FDisc = SHORTHAND + 1,
    FRandom,
    FError,
    FDef,
    FRawdef,
    FProgram,
    FLang,
    KSystime,
    KSystimeRap,
    KPts,
    KPtsOrig,
    KPtsSys,
    KDts,
    KDtsOrig,
    KDtsSys,
    KVbvdelay,
    KDuration,
    BStart,
    BEnd,
    PNum,
    PHsize,
    PVsize,
    PHsizevis,
    PVsizevis,
    PHposition,
    PVposition,
    PAspect,
    PProgressive,
    PTf,
    PBf,
    PTff,
}

const SHORTHANDS: &[ShorthandEntry] = &[
    ShorthandEntry { name: "f.disc", base_type: BaseType::Void },
    ShorthandEntry { name: "f.random", base_type: BaseType::Void },
    ShorthandEntry { name: "f.error", base_type: BaseType::Void },
    ShorthandEntry { name: "f.def", base_type: BaseType::String },
    ShorthandEntry { name: "f.rawdef", base_type: BaseType::String },
    ShorthandEntry { name: "f.program", base_type: BaseType::String },
    ShorthandEntry { name: "f.lang", base_type: BaseType::String },
    ShorthandEntry { name: "k.systime", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.systime.rap", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.pts", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.pts.orig", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.pts.sys", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.dts", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.dts.orig", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.dts.sys", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.vbvdelay", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "k.duration", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "b.start", base_type: BaseType::Void },
    ShorthandEntry { name: "b.end", base_type: BaseType::Void },
    ShorthandEntry { name: "p.num", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.hsize", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.vsize", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.hsizevis", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.vsizevis", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.hposition", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.vposition", base_type: BaseType::Unsigned },
    ShorthandEntry { name: "p.aspect", base_type: BaseType::Rational },
    ShorthandEntry { name: "p.progressive", base_type: BaseType::Void },
    ShorthandEntry { name: "p.tf", base_type: BaseType::Void },
    ShorthandEntry { name: "p.bf", base_type: BaseType::Void },
    ShorthandEntry { name: "p.tff", base_type: BaseType::Void },
];

impl Shorthand {
    /// Decodes a wire type code into a shorthand, applying the *inclusive*
    /// bound `SHORTHAND+1 ..= SHORTHAND+len`. The original C implementation's
    /// equivalent check (`type > UDICT_TYPE_SHORTHAND + 1 + len`) is off by
    /// one and admits `type == SHORTHAND + 1 + len`, one past the table; that
    /// bug is not reproduced here.
    pub fn from_code(code: TypeCode) -> Option<Self> {
        use Shorthand::*;
        const TABLE: &[Shorthand] = &[
            FDisc, FRandom, FError, FDef, FRawdef, FProgram, FLang, KSystime, KSystimeRap, KPts,
            KPtsOrig, KPtsSys, KDts, KDtsOrig, KDtsSys, KVbvdelay, KDuration, BStart, BEnd, PNum,
            PHsize, PVsize, PHsizevis, PVsizevis, PHposition, PVposition, PAspect, PProgressive,
            PTf, PBf, PTff,
        ];
        if code <= SHORTHAND {
            return None;
        }
        let index = (code - SHORTHAND - 1) as usize;
        TABLE.get(index).copied()
    }

    pub fn code(self) -> TypeCode {
        self as TypeCode
    }

    fn entry(self) -> &'static ShorthandEntry {
        &SHORTHANDS[(self.code() - SHORTHAND - 1) as usize]
    }

    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn base_type(self) -> BaseType {
        self.entry().base_type
    }
}

fn base_type_of(code: TypeCode) -> Option<BaseType> {
    if code > SHORTHAND {
        Shorthand::from_code(code).map(Shorthand::base_type)
    } else {
        match code {
            OPAQUE => Some(BaseType::Opaque),
            STRING => Some(BaseType::String),
            VOID => Some(BaseType::Void),
            BOOL => Some(BaseType::Bool),
            SMALL_UNSIGNED => Some(BaseType::SmallUnsigned),
            SMALL_INT => Some(BaseType::SmallInt),
            UNSIGNED => Some(BaseType::Unsigned),
            INT => Some(BaseType::Int),
            RATIONAL => Some(BaseType::Rational),
            FLOAT => Some(BaseType::Float),
            _ => None,
        }
    }
}

fn be16(buf: &[u8], offset: usize) -> usize {
    u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize
}

fn put_be16(buf: &mut [u8], offset: usize, value: u16) {
    let bytes = value.to_be_bytes();
    buf[offset] = bytes[0];
    buf[offset + 1] = bytes[1];
}

/// Length of the whole entry starting at `offset`, or `None` if `offset`
/// points at the terminating [`END`] byte.
fn entry_len(buf: &[u8], offset: usize) -> Option<usize> {
    let code = buf[offset];
    if code == END {
        return None;
    }
    if code > SHORTHAND {
        let base = Shorthand::from_code(code).expect("valid shorthand code on wire").base_type();
        if base.is_variable() {
            Some(3 + be16(buf, offset + 1))
        } else {
            Some(1 + base.fixed_size().unwrap())
        }
    } else {
        Some(3 + be16(buf, offset + 1))
    }
}

/// A single attribute dictionary.
#[derive(Debug)]
pub struct Dict {
    umem: Umem,
    /// Number of bytes in use, including the trailing `END` sentinel.
    size: usize,
    extra_size: usize,
}

impl Dict {
    /// Allocates an empty dictionary with at least `size` bytes of storage.
    pub fn alloc(size: usize) -> Self {
        Self::with_capacity(size, 64)
    }

    /// Allocates an empty dictionary, growing in `extra_size`-byte steps.
    pub fn with_capacity(size: usize, extra_size: usize) -> Self {
        let mut umem = Umem::alloc(size.max(1));
        umem.as_mut_slice()[0] = END;
        Self {
            umem,
            size: 1,
            extra_size,
        }
    }

    /// Duplicates this dictionary into a freshly allocated buffer.
    pub fn dup(&self) -> Self {
        let mut umem = Umem::alloc(self.size);
        umem.as_mut_slice().copy_from_slice(&self.umem.as_slice()[..self.size]);
        Self {
            umem,
            size: self.size,
            extra_size: self.extra_size,
        }
    }

    fn buf(&self) -> &[u8] {
        &self.umem.as_slice()[..self.size]
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.umem.as_mut_slice()[..size]
    }

    fn grow(&mut self, required: usize) {
        if required > self.umem.size() {
            self.umem.resize(required + self.extra_size);
        }
    }

    fn find_raw(&self, name: &str, type_code: TypeCode) -> Option<usize> {
        let buf = self.buf();
        let mut offset = 0;
        loop {
            let code = buf[offset];
            if code == END {
                return None;
            }
            let matches = if type_code > SHORTHAND {
                code == type_code
            } else {
                code == type_code && {
                    let name_start = offset + 3;
                    let nul = buf[name_start..].iter().position(|&b| b == 0)?;
                    &buf[name_start..name_start + nul] == name.as_bytes()
                }
            };
            if matches {
                return Some(offset);
            }
            offset += entry_len(buf, offset)?;
        }
    }

    /// Byte range of the value stored at the entry starting at `offset`.
    fn value_range(&self, offset: usize) -> (usize, usize) {
        let buf = self.buf();
        let code = buf[offset];
        if code > SHORTHAND {
            let base = Shorthand::from_code(code).unwrap().base_type();
            if base.is_variable() {
                let len = be16(buf, offset + 1);
                (offset + 3, offset + 3 + len)
            } else {
                let width = base.fixed_size().unwrap();
                (offset + 1, offset + 1 + width)
            }
        } else {
            let len = be16(buf, offset + 1);
            let name_start = offset + 3;
            let nul = buf[name_start..].iter().position(|&b| b == 0).unwrap();
            let value_start = name_start + nul + 1;
            (value_start, offset + 3 + len)
        }
    }

    fn delete_at(&mut self, offset: usize) {
        let len = entry_len(self.buf(), offset).expect("offset points at a live entry");
        let end = offset + len;
        let tail_len = self.size - end;
        self.umem.as_mut_slice().copy_within(end..end + tail_len, offset);
        self.size -= len;
    }

    fn raw_get(&self, name: &str, type_code: TypeCode) -> Option<&[u8]> {
        let offset = self.find_raw(name, type_code)?;
        let (start, end) = self.value_range(offset);
        Some(&self.buf()[start..end])
    }

    fn raw_set(&mut self, name: &str, type_code: TypeCode, value: &[u8]) -> crate::error::Result<()> {
        use crate::error::Error;

        let base = base_type_of(type_code).expect("valid type code");
        let is_shorthand = type_code > SHORTHAND;

        if let Some(offset) = self.find_raw(name, type_code) {
            let (start, end) = self.value_range(offset);
            let current_len = end - start;
            if current_len == value.len() {
                self.buf_mut()[start..end].copy_from_slice(value);
                return Ok(());
            }
            if base == BaseType::String && current_len > value.len() {
                let buf = self.buf_mut();
                buf[start..start + value.len()].copy_from_slice(value);
                for b in &mut buf[start + value.len()..end] {
                    *b = 0;
                }
                return Ok(());
            }
            self.delete_at(offset);
        }

        if base.is_variable() && value.len() > u16::MAX as usize {
            return Err(Error::Overflow);
        }
        let header_size = if is_shorthand {
            if base.is_variable() { 3 } else { 1 }
        } else {
            let total_len = name.len() + 1 + value.len();
            if total_len > u16::MAX as usize {
                return Err(Error::Overflow);
            }
            3 + name.len() + 1
        };

        let needed = (self.size - 1) + header_size + value.len() + 1;
        self.grow(needed);

        let mut offset = self.size - 1;
        {
            let buf = self.umem.as_mut_slice();
            buf[offset] = type_code;
            offset += 1;
            if is_shorthand {
                if base.is_variable() {
                    put_be16(buf, offset, value.len() as u16);
                    offset += 2;
                }
            } else {
                put_be16(buf, offset, (name.len() + 1 + value.len()) as u16);
                offset += 2;
                buf[offset..offset + name.len()].copy_from_slice(name.as_bytes());
                offset += name.len();
                buf[offset] = 0;
                offset += 1;
            }
            buf[offset..offset + value.len()].copy_from_slice(value);
            offset += value.len();
            buf[offset] = END;
        }
        self.size = offset + 1;
        Ok(())
    }

    fn raw_delete(&mut self, name: &str, type_code: TypeCode) -> bool {
        match self.find_raw(name, type_code) {
            Some(offset) => {
                self.delete_at(offset);
                true
            }
            None => false,
        }
    }

    // -- shorthand-keyed access --------------------------------------------

    pub fn get_shorthand(&self, sh: Shorthand) -> Option<&[u8]> {
        self.raw_get("", sh.code())
    }

    pub fn set_shorthand(&mut self, sh: Shorthand, value: &[u8]) -> crate::error::Result<()> {
        self.raw_set("", sh.code(), value)
    }

    pub fn delete_shorthand(&mut self, sh: Shorthand) -> bool {
        self.raw_delete("", sh.code())
    }

    pub fn has_shorthand(&self, sh: Shorthand) -> bool {
        self.get_shorthand(sh).is_some()
    }

    // -- named (dynamically-keyed) access -----------------------------------

    pub fn get_named(&self, name: &str, base: BaseType) -> Option<&[u8]> {
        self.raw_get(name, base as TypeCode)
    }

    pub fn set_named(&mut self, name: &str, base: BaseType, value: &[u8]) -> crate::error::Result<()> {
        self.raw_set(name, base as TypeCode, value)
    }

    pub fn delete_named(&mut self, name: &str, base: BaseType) -> bool {
        self.raw_delete(name, base as TypeCode)
    }

    // -- typed convenience wrappers over shorthand access --------------------

    pub fn get_u64(&self, sh: Shorthand) -> Option<u64> {
        self.get_shorthand(sh).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn set_u64(&mut self, sh: Shorthand, value: u64) -> crate::error::Result<()> {
        self.set_shorthand(sh, &value.to_be_bytes())
    }

    pub fn get_rational(&self, sh: Shorthand) -> Option<(i64, i64)> {
        self.get_shorthand(sh).map(|b| {
            let num = i64::from_be_bytes(b[0..8].try_into().unwrap());
            let den = i64::from_be_bytes(b[8..16].try_into().unwrap());
            (num, den)
        })
    }

    pub fn set_rational(&mut self, sh: Shorthand, num: i64, den: i64) -> crate::error::Result<()> {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&num.to_be_bytes());
        buf[8..16].copy_from_slice(&den.to_be_bytes());
        self.set_shorthand(sh, &buf)
    }

    /// Presence-only attribute: set it to mark a flag, delete to clear it.
    pub fn set_void(&mut self, sh: Shorthand) -> crate::error::Result<()> {
        self.set_shorthand(sh, &[])
    }

    pub fn get_string(&self, sh: Shorthand) -> Option<&str> {
        self.get_shorthand(sh).map(|b| std::str::from_utf8(b).expect("attribute strings are utf-8"))
    }

    pub fn set_string(&mut self, sh: Shorthand, value: &str) -> crate::error::Result<()> {
        self.set_shorthand(sh, value.as_bytes())
    }

    /// Iterates the entries of this dictionary in their on-wire order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { dict: self, offset: 0 }
    }
}

/// Iterates the (name, type) pairs of a [`Dict`] in wire order. A `None` name
/// means the entry was stored via its shorthand code.
pub struct Iter<'a> {
    dict: &'a Dict,
    offset: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Option<String>, TypeCode);

    fn next(&mut self) -> Option<Self::Item> {
        let buf = self.dict.buf();
        let code = buf[self.offset];
        if code == END {
            return None;
        }
        let name = if code > SHORTHAND {
            None
        } else {
            let name_start = self.offset + 3;
            let nul = buf[name_start..].iter().position(|&b| b == 0).unwrap();
            Some(String::from_utf8_lossy(&buf[name_start..name_start + nul]).into_owned())
        };
        let len = entry_len(buf, self.offset).unwrap();
        self.offset += len;
        Some((name, code))
    }
}

/// Pools [`Dict`]s on a LIFO free list up to `pool_depth`, per spec's
/// "freed by returning to a per-manager pool" lifecycle.
pub struct DictManager {
    min_size: usize,
    extra_size: usize,
    pool_depth: usize,
    pool: Vec<Dict>,
}

impl DictManager {
    pub fn new(min_size: usize, extra_size: usize, pool_depth: usize) -> Self {
        Self {
            min_size,
            extra_size,
            pool_depth,
            pool: Vec::new(),
        }
    }

    pub fn alloc(&mut self, size: usize) -> Dict {
        let size = size.max(self.min_size);
        match self.pool.pop() {
            Some(mut dict) => {
                crate::logging::debug!("reusing pooled dict ({} left)", self.pool.len());
                dict.umem.resize(size);
                dict.umem.as_mut_slice()[0] = END;
                dict.size = 1;
                dict
            }
            None => Dict::with_capacity(size, self.extra_size),
        }
    }

    pub fn dup(&mut self, src: &Dict) -> Dict {
        let mut dict = self.alloc(src.size);
        dict.umem.as_mut_slice()[..src.size].copy_from_slice(src.buf());
        dict.size = src.size;
        dict
    }

    pub fn release(&mut self, dict: Dict) {
        if self.pool.len() < self.pool_depth {
            self.pool.push(dict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_roundtrip() {
        let mut dict = Dict::alloc(128);
        dict.set_u64(Shorthand::KPts, 12345).unwrap();
        assert_eq!(dict.get_u64(Shorthand::KPts), Some(12345));
        assert!(dict.delete_shorthand(Shorthand::KPts));
        assert_eq!(dict.get_u64(Shorthand::KPts), None);
    }

    #[test]
    fn named_roundtrip() {
        let mut dict = Dict::alloc(128);
        dict.set_named("p.0.chroma", BaseType::String, b"y8").unwrap();
        assert_eq!(dict.get_named("p.0.chroma", BaseType::String), Some(&b"y8"[..]));
        assert_eq!(dict.get_named("p.1.chroma", BaseType::String), None);
    }

    #[test]
    fn string_shrink_in_place() {
        let mut dict = Dict::alloc(128);
        dict.set_string(Shorthand::FDef, "block.mpeg2video.").unwrap();
        dict.set_string(Shorthand::FDef, "short").unwrap();
        let (start, end) = dict.value_range(dict.find_raw("", Shorthand::FDef.code()).unwrap());
        assert_eq!(end - start, "block.mpeg2video.".len(), "value slot keeps its size");
        assert_eq!(&dict.buf()[start..start + 5], b"short");
        assert!(dict.buf()[start + 5..end].iter().all(|&b| b == 0));
    }

    #[test]
    fn iteration_matches_insertion_order() {
        let mut dict = Dict::alloc(128);
        dict.set_void(Shorthand::FRandom).unwrap();
        dict.set_u64(Shorthand::KPts, 1).unwrap();
        dict.set_named("x", BaseType::SmallUnsigned, &[9]).unwrap();

        let entries: Vec<_> = dict.iter().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (None, Shorthand::FRandom.code()));
        assert_eq!(entries[1], (None, Shorthand::KPts.code()));
        assert_eq!(entries[2], (Some("x".to_string()), SMALL_UNSIGNED));
    }

    #[test]
    fn dup_is_independent() {
        let mut dict = Dict::alloc(128);
        dict.set_u64(Shorthand::KPts, 1).unwrap();
        let mut dup = dict.dup();
        dup.set_u64(Shorthand::KPts, 2).unwrap();
        assert_eq!(dict.get_u64(Shorthand::KPts), Some(1));
        assert_eq!(dup.get_u64(Shorthand::KPts), Some(2));
    }

    #[test]
    fn shorthand_bound_is_not_off_by_one() {
        let last = SHORTHANDS.len() as u8;
        assert!(Shorthand::from_code(SHORTHAND + last).is_some());
        assert!(Shorthand::from_code(SHORTHAND + last + 1).is_none());
    }

    #[test]
    fn manager_pools_released_dicts() {
        let mut mgr = DictManager::new(32, 16, 2);
        let dict = mgr.alloc(32);
        mgr.release(dict);
        assert_eq!(mgr.pool.len(), 1);
        let reused = mgr.alloc(32);
        assert_eq!(reused.size, 1);
        assert_eq!(mgr.pool.len(), 0);
    }
}
