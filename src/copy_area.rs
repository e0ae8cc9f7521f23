// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use crc32fast::Hasher;
use getset::CopyGetters;
use tracing::instrument;

use crate::{
    errs::LocatorError,
    oid::{
        Hfid,
        Oid,
    },
};

/// count + payload length + payload checksum.
pub const AREA_HEADER_SIZE: usize = 3 * size_of::<u32>();
/// op(1) + pad(3) + hfid(4) + oid(8) + class oid(8) + offset(4) + length(4)
pub const DESCRIPTOR_SIZE: usize = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert  = 1,
    Update  = 2,
    Delete  = 3,
    /// An object the server sends back to the client.
    Fetch   = 4,
    /// The server could not find the object named by the descriptor.
    Missing = 5,
}

impl Operation {
    fn from_u8(val: u8) -> Option<Operation> {
        match val {
            | 1 => Some(Operation::Insert),
            | 2 => Some(Operation::Update),
            | 3 => Some(Operation::Delete),
            | 4 => Some(Operation::Fetch),
            | 5 => Some(Operation::Missing),
            | _ => None,
        }
    }
}

/// Per-object directory entry of a [`CopyArea`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Descriptor {
    operation: Operation,
    hfid: Hfid,
    oid: Oid,
    class_oid: Oid,
    /// Offset of the object bytes from the start of the payload.
    offset: u32,
    length: u32,
}

impl Descriptor {
    pub fn new(operation: Operation, hfid: Hfid, oid: Oid, class_oid: Oid) -> Self {
        Descriptor {
            operation,
            hfid,
            oid,
            class_oid,
            offset: 0,
            length: 0,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.operation as u8);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.hfid.0);
        self.oid.put(buf);
        self.class_oid.put(buf);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.length);
    }

    fn get(buf: &mut Bytes) -> Result<Self, LocatorError> {
        let operation = Operation::from_u8(buf.get_u8())
            .ok_or_else(|| LocatorError::InvalidHeaderFormat("unknown descriptor operation".into()))?;
        buf.advance(3);
        Ok(Descriptor {
            operation,
            hfid: Hfid(buf.get_u32_le()),
            oid: Oid::get(buf),
            class_oid: Oid::get(buf),
            offset: buf.get_u32_le(),
            length: buf.get_u32_le(),
        })
    }
}

/// The buffer objects travel in between the client and the server.
///
/// It is a directory of [`Descriptor`]s followed by the object bytes, each
/// entry starting on an `alignment` boundary. The area never holds more than
/// its capacity: appends that do not fit are refused with
/// [`LocatorError::BufferTooSmall`] and the caller decides whether to force the
/// area or to grow it.
#[derive(Debug, Clone)]
pub struct CopyArea {
    descriptors: Vec<Descriptor>,
    payload: BytesMut,
    initial_capacity: usize,
    capacity: usize,
    max_capacity: usize,
    alignment: usize,
}

impl CopyArea {
    pub fn new(capacity: usize, max_capacity: usize, alignment: usize) -> Self {
        let capacity = capacity.max(AREA_HEADER_SIZE + DESCRIPTOR_SIZE);
        CopyArea {
            descriptors: vec![],
            payload: BytesMut::with_capacity(capacity - AREA_HEADER_SIZE),
            initial_capacity: capacity,
            capacity,
            max_capacity: max_capacity.max(capacity),
            alignment: alignment.max(1),
        }
    }

    /// An area without a practical size limit, used to build replies.
    pub fn unbounded() -> Self {
        CopyArea {
            descriptors: vec![],
            payload: BytesMut::new(),
            initial_capacity: usize::MAX / 2,
            capacity: usize::MAX / 2,
            max_capacity: usize::MAX / 2,
            alignment: 8,
        }
    }

    #[inline]
    fn align_up(&self, len: usize) -> usize {
        len.div_ceil(self.alignment) * self.alignment
    }

    /// Encoded size of the area as it stands.
    pub fn used(&self) -> usize {
        AREA_HEADER_SIZE + self.descriptors.len() * DESCRIPTOR_SIZE + self.payload.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// How many object bytes the next append can take.
    pub fn room(&self) -> usize {
        let reserved = AREA_HEADER_SIZE +
            (self.descriptors.len() + 1) * DESCRIPTOR_SIZE +
            self.align_up(self.payload.len());
        self.capacity.saturating_sub(reserved)
    }

    /// Whether nothing beyond an empty object fits anymore.
    pub fn is_exhausted(&self) -> bool {
        self.room() < self.alignment
    }

    /// Append an object, returning the index of its descriptor.
    #[instrument(level = "trace", skip(self, bytes), fields(len = bytes.len()))]
    pub fn append(&mut self, mut desc: Descriptor, bytes: &[u8]) -> Result<usize, LocatorError> {
        if bytes.len() > self.room() {
            return Err(LocatorError::BufferTooSmall {
                needed: AREA_HEADER_SIZE +
                    (self.descriptors.len() + 1) * DESCRIPTOR_SIZE +
                    self.align_up(self.payload.len()) +
                    bytes.len(),
                capacity: self.capacity,
            });
        }

        let start = self.align_up(self.payload.len());
        self.payload.resize(start, 0);
        self.payload.put_slice(bytes);

        desc.offset = start as u32;
        desc.length = bytes.len() as u32;
        self.descriptors.push(desc);
        Ok(self.descriptors.len() - 1)
    }

    /// Resize the area so that an object of `object_len` bytes fits in it
    /// alone. This is the single growth step a flush may take per object.
    pub fn grow_to_fit(&mut self, object_len: usize) -> Result<usize, LocatorError> {
        let requested = AREA_HEADER_SIZE + DESCRIPTOR_SIZE + self.align_up(object_len);
        if requested > self.max_capacity {
            return Err(LocatorError::OutOfMemory {
                requested,
                limit: self.max_capacity,
            });
        }
        if requested > self.capacity {
            self.payload.reserve(requested - self.capacity);
            self.capacity = requested;
        }
        Ok(self.capacity)
    }

    /// Drop every entry and shrink back to the initial capacity.
    pub fn reset(&mut self) {
        self.descriptors.clear();
        self.payload.clear();
        self.capacity = self.initial_capacity;
    }

    pub fn descriptor(&self, idx: usize) -> Option<&Descriptor> {
        self.descriptors.get(idx)
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn set_operation(&mut self, idx: usize, operation: Operation) {
        if let Some(desc) = self.descriptors.get_mut(idx) {
            desc.operation = operation;
        }
    }

    pub fn set_oid(&mut self, idx: usize, oid: Oid) {
        if let Some(desc) = self.descriptors.get_mut(idx) {
            desc.oid = oid;
        }
    }

    /// The object bytes of entry `idx`.
    pub fn object(&self, idx: usize) -> Option<Bytes> {
        let desc = self.descriptors.get(idx)?;
        let start = desc.offset as usize;
        let end = start + desc.length as usize;
        Some(Bytes::copy_from_slice(&self.payload[start..end]))
    }

    /// Iterate over `(descriptor, object bytes)` in append order.
    pub fn entries(&self) -> impl Iterator<Item = (&Descriptor, Bytes)> + '_ {
        self.descriptors.iter().enumerate().filter_map(move |(idx, desc)| {
            self.object(idx).map(|bytes| (desc, bytes))
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut hasher = Hasher::new();
        hasher.update(&self.payload);
        let checksum = hasher.finalize();

        let mut buf = BytesMut::with_capacity(self.used());
        buf.put_u32_le(self.descriptors.len() as u32);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(checksum);
        for desc in self.descriptors.iter() {
            desc.put(&mut buf);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode and validate an area received off the wire.
    pub fn decode(mut bytes: Bytes) -> Result<Self, LocatorError> {
        let total = bytes.len();
        if total < AREA_HEADER_SIZE {
            return Err(LocatorError::InvalidHeaderFormat("copy area too short".into()));
        }

        let count = bytes.get_u32_le() as usize;
        let payload_len = bytes.get_u32_le() as usize;
        let checksum = bytes.get_u32_le();

        let directory_len = count
            .checked_mul(DESCRIPTOR_SIZE)
            .ok_or_else(|| LocatorError::InvalidHeaderFormat("descriptor count overflows".into()))?;
        if bytes.remaining() != directory_len + payload_len {
            return Err(LocatorError::InvalidHeaderFormat(format!(
                "expected {} bytes after the header, found {}",
                directory_len + payload_len,
                bytes.remaining()
            )));
        }

        let mut descriptors = Vec::with_capacity(count);
        for _ in 0..count {
            let desc = Descriptor::get(&mut bytes)?;
            if desc.offset as usize + desc.length as usize > payload_len {
                return Err(LocatorError::InvalidHeaderFormat(format!(
                    "object {} lies outside of the payload",
                    desc.oid
                )));
            }
            descriptors.push(desc);
        }

        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        if hasher.finalize() != checksum {
            return Err(LocatorError::InvalidHeaderFormat("payload checksum mismatch".into()));
        }

        Ok(CopyArea {
            descriptors,
            payload: BytesMut::from(bytes.as_ref()),
            initial_capacity: total,
            capacity: total,
            max_capacity: total,
            alignment: 1,
        })
    }
}
