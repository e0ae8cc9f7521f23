// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::fmt;

use bytes::{
    Buf,
    BufMut,
};
use getset::CopyGetters;

/// Encoded size of an [`Oid`] on the wire.
pub const OID_SIZE: usize = size_of::<i16>() + size_of::<i32>() + size_of::<i16>();

const NULL_PAGEID: i32 = -1;

/// A (volume, page, slot) reference to a stored record.
///
/// An oid with a page below [`NULL_PAGEID`] is temporary: it was minted by the
/// session for an object the server has never seen and must be exchanged for a
/// permanent one before anything else can embed it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Oid {
    volid: i16,
    pageid: i32,
    slotid: i16,
}

impl Oid {
    pub const NULL: Oid = Oid {
        volid: -1,
        pageid: NULL_PAGEID,
        slotid: -1,
    };

    /// The root class, the class of every class.
    pub const ROOT: Oid = Oid {
        volid: 0,
        pageid: 0,
        slotid: 0,
    };

    pub const fn new(volid: i16, pageid: i32, slotid: i16) -> Self {
        Oid {
            volid,
            pageid,
            slotid,
        }
    }

    fn temporary(counter: u32) -> Self {
        // counter starts at one, so the first temporary page is -2
        Oid {
            volid: -1,
            pageid: NULL_PAGEID - counter as i32,
            slotid: 0,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Oid::NULL
    }

    #[inline]
    pub fn is_temp(&self) -> bool {
        !self.is_null() && self.pageid < NULL_PAGEID
    }

    #[inline]
    pub fn is_permanent(&self) -> bool {
        !self.is_null() && !self.is_temp()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        *self == Oid::ROOT
    }

    pub fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_i16_le(self.volid);
        buf.put_i32_le(self.pageid);
        buf.put_i16_le(self.slotid);
    }

    /// Read an oid off the front of `buf`. The caller guarantees [`OID_SIZE`]
    /// bytes remain.
    pub fn get<B: Buf>(buf: &mut B) -> Self {
        Oid {
            volid: buf.get_i16_le(),
            pageid: buf.get_i32_le(),
            slotid: buf.get_i16_le(),
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.volid, self.pageid, self.slotid)
    }
}

/// Identifies the heap a class stores its instances in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Hfid(pub u32);

impl Hfid {
    /// Heap of the root class, where class records live.
    pub const ROOT: Hfid = Hfid(0);

    /// The instance heap of the class stored at `class_oid`. Temporary classes
    /// have no heap yet.
    pub fn of_class(class_oid: Oid) -> Option<Hfid> {
        if class_oid.is_root() {
            return Some(Hfid::ROOT);
        }
        if !class_oid.is_permanent() {
            return None;
        }
        let page = class_oid.pageid as u32;
        let slot = class_oid.slotid as u16 as u32;
        Some(Hfid(((page << 8) | (slot & 0xff)).wrapping_add(1)))
    }
}

/// Hands out temporary oids for newly created objects.
///
/// The counter space is finite. Once [`TempOidGenerator::next`] returns `None`
/// every live temporary has to be flushed before [`TempOidGenerator::reset`]
/// may reuse the space.
#[derive(Debug)]
pub struct TempOidGenerator {
    next: u32,
    limit: u32,
}

impl TempOidGenerator {
    pub fn new(limit: u32) -> Self {
        TempOidGenerator {
            next: 1,
            limit: limit.clamp(1, i32::MAX as u32 - 2),
        }
    }

    pub fn next(&mut self) -> Option<Oid> {
        if self.next > self.limit {
            return None;
        }
        let oid = Oid::temporary(self.next);
        self.next += 1;
        Some(oid)
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }

    pub fn issued(&self) -> u32 {
        self.next - 1
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_null_and_root() {
        assert!(Oid::NULL.is_null());
        assert!(!Oid::NULL.is_temp());
        assert!(!Oid::NULL.is_permanent());
        assert!(Oid::ROOT.is_permanent());
        assert!(Oid::ROOT.is_root());
    }

    #[test]
    fn test_temporaries_are_distinct() {
        let mut gen = TempOidGenerator::new(100);
        let a = gen.next().unwrap();
        let b = gen.next().unwrap();
        assert!(a.is_temp());
        assert!(b.is_temp());
        assert_ne!(a, b);
        assert_eq!(gen.issued(), 2);
    }

    #[test]
    fn test_generator_exhaustion_and_reset() {
        let mut gen = TempOidGenerator::new(2);
        let first = gen.next().unwrap();
        assert!(gen.next().is_some());
        assert!(gen.next().is_none(), "counter space must be finite");

        gen.reset();
        assert_eq!(gen.next(), Some(first));
    }

    #[test]
    fn test_wire_encoding() {
        let oid = Oid::new(3, 1_024, 7);
        let mut buf = BytesMut::new();
        oid.put(&mut buf);
        assert_eq!(buf.len(), OID_SIZE);

        let mut bytes = buf.freeze();
        assert_eq!(Oid::get(&mut bytes), oid);
    }

    #[test]
    fn test_class_heaps() {
        assert_eq!(Hfid::of_class(Oid::ROOT), Some(Hfid::ROOT));
        assert_eq!(Hfid::of_class(Oid::NULL), None);

        let mut gen = TempOidGenerator::new(10);
        assert_eq!(Hfid::of_class(gen.next().unwrap()), None);

        let a = Hfid::of_class(Oid::new(0, 1, 0)).unwrap();
        let b = Hfid::of_class(Oid::new(0, 1, 1)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, Hfid::ROOT);
    }
}
