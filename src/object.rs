// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use bytes::Bytes;
use getset::{
    CopyGetters,
    Getters,
};

use crate::workspace::HandleId;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    /// A reference to another object, by its client-local handle.
    Ref(HandleId),
}

impl Value {
    /// Whether the value may be stored in an attribute of `kind`. Null fits
    /// everywhere.
    pub fn fits(&self, kind: AttrKind) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _) |
                (Value::Int(_), AttrKind::Int) |
                (Value::Float(_), AttrKind::Float) |
                (Value::Str(_), AttrKind::Str) |
                (Value::Bytes(_), AttrKind::Bytes) |
                (Value::Ref(_), AttrKind::Ref)
        )
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Int   = 1,
    Float = 2,
    Str   = 3,
    Bytes = 4,
    Ref   = 5,
}

impl AttrKind {
    pub fn from_u8(val: u8) -> Option<AttrKind> {
        match val {
            | 1 => Some(AttrKind::Int),
            | 2 => Some(AttrKind::Float),
            | 3 => Some(AttrKind::Str),
            | 4 => Some(AttrKind::Bytes),
            | 5 => Some(AttrKind::Ref),
            | _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Attribute {
    #[getset(get = "pub")]
    name: String,
    #[getset(get_copy = "pub")]
    kind: AttrKind,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Attribute {
            name: name.into(),
            kind,
        }
    }
}

/// The schema of a class as cached on the client.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct ClassDef {
    #[getset(get = "pub")]
    name: String,
    #[getset(get = "pub")]
    attributes: Vec<Attribute>,
    /// Bumped on every schema change so stale instances can be detected.
    #[getset(get_copy = "pub")]
    repr_id: u16,
}

impl ClassDef {
    pub fn new(name: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        ClassDef {
            name: name.into(),
            attributes,
            repr_id: 0,
        }
    }

    pub(crate) fn with_repr_id(mut self, repr_id: u16) -> Self {
        self.repr_id = repr_id;
        self
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Check `values` against the attribute list.
    pub fn accepts(&self, values: &[Value]) -> bool {
        values.len() == self.attributes.len() &&
            values
                .iter()
                .zip(self.attributes.iter())
                .all(|(val, attr)| val.fits(attr.kind))
    }
}

#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct Instance {
    #[getset(get_copy = "pub")]
    repr_id: u16,
    #[getset(get = "pub")]
    values: Vec<Value>,
}

impl Instance {
    pub fn new(repr_id: u16, values: Vec<Value>) -> Self {
        Instance { repr_id, values }
    }

    pub(crate) fn values_mut(&mut self) -> &mut Vec<Value> {
        &mut self.values
    }
}

/// The cached representation behind a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectData {
    Class(ClassDef),
    Instance(Instance),
}

impl ObjectData {
    pub fn as_class(&self) -> Option<&ClassDef> {
        match self {
            | ObjectData::Class(def) => Some(def),
            | ObjectData::Instance(_) => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            | ObjectData::Instance(inst) => Some(inst),
            | ObjectData::Class(_) => None,
        }
    }

    /// Every handle this object embeds by reference, in attribute order.
    pub fn references(&self) -> Vec<HandleId> {
        match self {
            | ObjectData::Class(_) => vec![],
            | ObjectData::Instance(inst) => inst
                .values
                .iter()
                .filter_map(|val| match val {
                    | Value::Ref(handle) => Some(*handle),
                    | _ => None,
                })
                .collect(),
        }
    }
}
