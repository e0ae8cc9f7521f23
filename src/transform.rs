// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use tracing::instrument;

use crate::{
    errs::TransformError,
    object::{
        AttrKind,
        Attribute,
        ClassDef,
        Instance,
        ObjectData,
        Value,
    },
    oid::{
        Oid,
        OID_SIZE,
    },
    workspace::HandleId,
};

const TAG_CLASS: u8 = 0xC1;
const TAG_INSTANCE: u8 = 0x1A;
const TAG_NULL: u8 = 0;

/// Maps a handle to the oid that should be written in its place.
pub trait OidResolver {
    fn resolve(&self, handle: HandleId) -> Option<Oid>;
}

/// Maps an oid read off the wire to a handle, creating the handle if needed.
pub trait OidInterner {
    fn intern_ref(&mut self, oid: Oid) -> HandleId;
}

/// Converts cached objects to their disk format and back.
pub trait Transformer {
    /// Encode `obj`. If the encoding would not fit into `room` bytes the
    /// transformer returns [`TransformError::RetryLarger`] with the exact size
    /// it needs.
    fn to_disk(
        &self,
        obj: &ObjectData,
        resolver: &dyn OidResolver,
        room: usize,
    ) -> Result<Bytes, TransformError>;

    /// Decode `bytes`. `class` is the cached definition of the object's class,
    /// if the client has one; class records pass `None`.
    fn to_memory(
        &self,
        class: Option<&ClassDef>,
        bytes: Bytes,
        interner: &mut dyn OidInterner,
    ) -> Result<ObjectData, TransformError>;

    /// A cheap upper bound on the encoded size, used when reserving space on
    /// the server ahead of a flush.
    fn size_hint(&self, obj: &ObjectData) -> usize;
}

/// The default tagged little-endian object format.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireTransformer;

impl WireTransformer {
    fn value_size(val: &Value) -> usize {
        1 + match val {
            | Value::Null => 0,
            | Value::Int(_) | Value::Float(_) => size_of::<u64>(),
            | Value::Str(s) => size_of::<u32>() + s.len(),
            | Value::Bytes(b) => size_of::<u32>() + b.len(),
            | Value::Ref(_) => OID_SIZE,
        }
    }

    fn put_str(buf: &mut BytesMut, s: &str) {
        buf.put_u32_le(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    fn get_str(bytes: &mut Bytes) -> Result<String, TransformError> {
        let raw = Self::get_blob(bytes)?;
        String::from_utf8(raw.to_vec()).map_err(|_| TransformError::Malformed("string is not utf-8".into()))
    }

    fn get_blob(bytes: &mut Bytes) -> Result<Bytes, TransformError> {
        ensure(bytes, size_of::<u32>())?;
        let len = bytes.get_u32_le() as usize;
        ensure(bytes, len)?;
        Ok(bytes.split_to(len))
    }
}

fn ensure(bytes: &Bytes, needed: usize) -> Result<(), TransformError> {
    if bytes.remaining() < needed {
        return Err(TransformError::Malformed(format!(
            "needed {} bytes, {} left",
            needed,
            bytes.remaining()
        )));
    }
    Ok(())
}

impl Transformer for WireTransformer {
    #[instrument(level = "trace", skip(self, resolver))]
    fn to_disk(
        &self,
        obj: &ObjectData,
        resolver: &dyn OidResolver,
        room: usize,
    ) -> Result<Bytes, TransformError> {
        let needed = self.size_hint(obj);
        if needed > room {
            return Err(TransformError::RetryLarger { needed });
        }

        let mut buf = BytesMut::with_capacity(needed);
        match obj {
            | ObjectData::Class(def) => {
                buf.put_u8(TAG_CLASS);
                buf.put_u16_le(def.repr_id());
                Self::put_str(&mut buf, def.name());
                buf.put_u16_le(def.attributes().len() as u16);
                for attr in def.attributes() {
                    buf.put_u8(attr.kind() as u8);
                    Self::put_str(&mut buf, attr.name());
                }
            },
            | ObjectData::Instance(inst) => {
                buf.put_u8(TAG_INSTANCE);
                buf.put_u16_le(inst.repr_id());
                buf.put_u16_le(inst.values().len() as u16);
                for val in inst.values() {
                    match val {
                        | Value::Null => buf.put_u8(TAG_NULL),
                        | Value::Int(v) => {
                            buf.put_u8(AttrKind::Int as u8);
                            buf.put_i64_le(*v);
                        },
                        | Value::Float(v) => {
                            buf.put_u8(AttrKind::Float as u8);
                            buf.put_f64_le(*v);
                        },
                        | Value::Str(s) => {
                            buf.put_u8(AttrKind::Str as u8);
                            Self::put_str(&mut buf, s);
                        },
                        | Value::Bytes(b) => {
                            buf.put_u8(AttrKind::Bytes as u8);
                            buf.put_u32_le(b.len() as u32);
                            buf.put_slice(b);
                        },
                        | Value::Ref(handle) => {
                            // a reference that was dropped before it ever
                            // became durable is written as null
                            let oid = resolver.resolve(*handle).unwrap_or(Oid::NULL);
                            if oid.is_temp() {
                                return Err(TransformError::UnresolvedReference);
                            }
                            buf.put_u8(AttrKind::Ref as u8);
                            oid.put(&mut buf);
                        },
                    }
                }
            },
        }

        debug_assert_eq!(buf.len(), needed);
        Ok(buf.freeze())
    }

    #[instrument(level = "trace", skip(self, bytes, interner))]
    fn to_memory(
        &self,
        class: Option<&ClassDef>,
        mut bytes: Bytes,
        interner: &mut dyn OidInterner,
    ) -> Result<ObjectData, TransformError> {
        ensure(&bytes, 1 + size_of::<u16>())?;
        let tag = bytes.get_u8();
        let repr_id = bytes.get_u16_le();

        match tag {
            | TAG_CLASS => {
                let name = Self::get_str(&mut bytes)?;
                ensure(&bytes, size_of::<u16>())?;
                let count = bytes.get_u16_le() as usize;
                let mut attributes = Vec::with_capacity(count);
                for _ in 0..count {
                    ensure(&bytes, 1)?;
                    let kind = AttrKind::from_u8(bytes.get_u8())
                        .ok_or_else(|| TransformError::Malformed("unknown attribute kind".into()))?;
                    attributes.push(Attribute::new(Self::get_str(&mut bytes)?, kind));
                }
                Ok(ObjectData::Class(ClassDef::new(name, attributes).with_repr_id(repr_id)))
            },
            | TAG_INSTANCE => {
                if let Some(def) = class {
                    if def.repr_id() != repr_id {
                        return Err(TransformError::SchemaMismatch {
                            expected: def.repr_id(),
                            found: repr_id,
                        });
                    }
                }

                ensure(&bytes, size_of::<u16>())?;
                let count = bytes.get_u16_le() as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    ensure(&bytes, 1)?;
                    let val = match bytes.get_u8() {
                        | TAG_NULL => Value::Null,
                        | tag => match AttrKind::from_u8(tag) {
                            | Some(AttrKind::Int) => {
                                ensure(&bytes, size_of::<i64>())?;
                                Value::Int(bytes.get_i64_le())
                            },
                            | Some(AttrKind::Float) => {
                                ensure(&bytes, size_of::<f64>())?;
                                Value::Float(bytes.get_f64_le())
                            },
                            | Some(AttrKind::Str) => Value::Str(Self::get_str(&mut bytes)?),
                            | Some(AttrKind::Bytes) => Value::Bytes(Self::get_blob(&mut bytes)?),
                            | Some(AttrKind::Ref) => {
                                ensure(&bytes, OID_SIZE)?;
                                let oid = Oid::get(&mut bytes);
                                if oid.is_null() {
                                    Value::Null
                                } else {
                                    Value::Ref(interner.intern_ref(oid))
                                }
                            },
                            | None => return Err(TransformError::Malformed(format!("unknown value tag {}", tag))),
                        },
                    };
                    values.push(val);
                }

                if let Some(def) = class {
                    if !def.accepts(&values) {
                        return Err(TransformError::Malformed(format!(
                            "instance does not match class {}",
                            def.name()
                        )));
                    }
                }

                Ok(ObjectData::Instance(Instance::new(repr_id, values)))
            },
            | other => Err(TransformError::Malformed(format!("unknown object tag {:#x}", other))),
        }
    }

    fn size_hint(&self, obj: &ObjectData) -> usize {
        let header = 1 + size_of::<u16>();
        match obj {
            | ObjectData::Class(def) => {
                header +
                    size_of::<u32>() +
                    def.name().len() +
                    size_of::<u16>() +
                    def.attributes()
                        .iter()
                        .map(|attr| 1 + size_of::<u32>() + attr.name().len())
                        .sum::<usize>()
            },
            | ObjectData::Instance(inst) => {
                header + size_of::<u16>() + inst.values().iter().map(Self::value_size).sum::<usize>()
            },
        }
    }
}
