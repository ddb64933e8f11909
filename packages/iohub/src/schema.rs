// Record schema registry
//
// Record types are declared with a builder at startup. A derived type's
// field list is its parent's list followed by its own fields, so the
// leading fields (and their byte offsets) of a base type never move.
// Every registered type carries a packed little-endian layout used to turn
// a values tuple into bytes for storage and back.

use crate::value::Value;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("record type '{0}' is already registered")]
    DuplicateType(String),

    #[error("record type '{record}' extends unknown parent '{parent}'")]
    UnknownParent { record: String, parent: String },

    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error("field '{field}' of '{record}' collides with a field inherited from '{inherited_from}'")]
    InheritedFieldCollision {
        record: String,
        field: String,
        inherited_from: String,
    },

    #[error("field '{field}' is declared twice in '{record}'")]
    DuplicateField { record: String, field: String },

    #[error("field '{field}' of '{record}' has zero width")]
    ZeroWidth { record: String, field: String },

    #[error("'{record}' expects {expected} values, got {actual}")]
    Arity {
        record: String,
        expected: usize,
        actual: usize,
    },

    #[error("field '{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("value for field '{field}' does not fit {width} bytes")]
    Overflow { field: String, width: usize },

    #[error("'{record}' rows are {expected} bytes, got {actual}")]
    RowSize {
        record: String,
        expected: usize,
        actual: usize,
    },

    #[error("field '{field}' does not hold valid UTF-8")]
    InvalidUtf8 { field: String },

    #[error("event type {0} is already mapped")]
    DuplicateEventType(u16),
}

/// Semantic type of one field, with its packed width implied or explicit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// UTF-8 text, NUL padded to a fixed byte width
    Str(usize),
    /// Raw bytes, NUL padded to a fixed width
    Bytes(usize),
}

impl FieldType {
    pub fn width(&self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::U64 | FieldType::I64 | FieldType::F64 => 8,
            FieldType::Str(w) | FieldType::Bytes(w) => *w,
        }
    }

    /// numpy-style type code, handy when exporting layouts to columnar tools.
    pub fn type_code(&self) -> String {
        match self {
            FieldType::U8 => "u1".into(),
            FieldType::U16 => "u2".into(),
            FieldType::U32 => "u4".into(),
            FieldType::U64 => "u8".into(),
            FieldType::I8 => "i1".into(),
            FieldType::I16 => "i2".into(),
            FieldType::I32 => "i4".into(),
            FieldType::I64 => "i8".into(),
            FieldType::F32 => "f4".into(),
            FieldType::F64 => "f8".into(),
            FieldType::Str(w) => format!("S{}", w),
            FieldType::Bytes(w) => format!("V{}", w),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FieldType::F32 | FieldType::F64 => "float",
            FieldType::Str(_) => "str",
            FieldType::Bytes(_) => "bytes",
            _ => "int",
        }
    }

    fn int_range(&self) -> Option<(i128, i128)> {
        let range = match self {
            FieldType::U8 => (0, u8::MAX as i128),
            FieldType::U16 => (0, u16::MAX as i128),
            FieldType::U32 => (0, u32::MAX as i128),
            FieldType::U64 => (0, i64::MAX as i128),
            FieldType::I8 => (i8::MIN as i128, i8::MAX as i128),
            FieldType::I16 => (i16::MIN as i128, i16::MAX as i128),
            FieldType::I32 => (i32::MIN as i128, i32::MAX as i128),
            FieldType::I64 => (i64::MIN as i128, i64::MAX as i128),
            _ => return None,
        };
        Some(range)
    }
}

/// One declared field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A named, flattened, ordered field list with its packed layout
#[derive(Debug, Clone, Serialize)]
pub struct RecordType {
    name: String,
    parent: Option<String>,
    fields: Vec<FieldDescriptor>,
    /// Owner (declaring type) of every field, parallel to `fields`
    declared_in: Vec<String>,
    offsets: Vec<usize>,
    row_size: usize,
}

impl RecordType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == field)
    }

    /// Byte offset of a field inside a packed row.
    pub fn offset_of(&self, field: &str) -> Option<usize> {
        self.index_of(field).map(|i| self.offsets[i])
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Name of the type that declared `field`.
    pub fn declared_in(&self, field: &str) -> Option<&str> {
        self.index_of(field).map(|i| self.declared_in[i].as_str())
    }

    /// (name, type code) pairs, in field order.
    pub fn type_codes(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.type_code()))
            .collect()
    }

    /// Pair each value with its field name (a structured row).
    pub fn to_row<'a>(&'a self, values: &'a [Value]) -> Result<Vec<(&'a str, &'a Value)>, SchemaError> {
        self.check_arity(values.len())?;
        Ok(self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .zip(values.iter())
            .collect())
    }

    fn check_arity(&self, actual: usize) -> Result<(), SchemaError> {
        if actual != self.fields.len() {
            return Err(SchemaError::Arity {
                record: self.name.clone(),
                expected: self.fields.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Pack a values tuple into a fixed-size little-endian row.
    pub fn pack(&self, values: &[Value]) -> Result<Vec<u8>, SchemaError> {
        self.check_arity(values.len())?;
        let mut row = vec![0u8; self.row_size];
        for ((field, offset), value) in self.fields.iter().zip(&self.offsets).zip(values) {
            let slot = &mut row[*offset..*offset + field.field_type.width()];
            pack_field(field, value, slot)?;
        }
        Ok(row)
    }

    /// Check that every value fits its field's type and width.
    pub fn validate(&self, values: &[Value]) -> Result<(), SchemaError> {
        self.pack(values).map(|_| ())
    }

    /// Unpack a row produced by [`RecordType::pack`].
    pub fn unpack(&self, row: &[u8]) -> Result<Vec<Value>, SchemaError> {
        if row.len() != self.row_size {
            return Err(SchemaError::RowSize {
                record: self.name.clone(),
                expected: self.row_size,
                actual: row.len(),
            });
        }
        self.fields
            .iter()
            .zip(&self.offsets)
            .map(|(field, offset)| {
                unpack_field(field, &row[*offset..*offset + field.field_type.width()])
            })
            .collect()
    }
}

fn mismatch(field: &FieldDescriptor, value: &Value) -> SchemaError {
    SchemaError::TypeMismatch {
        field: field.name.clone(),
        expected: field.field_type.label(),
        actual: value.kind(),
    }
}

fn pack_field(field: &FieldDescriptor, value: &Value, slot: &mut [u8]) -> Result<(), SchemaError> {
    let overflow = || SchemaError::Overflow {
        field: field.name.clone(),
        width: field.field_type.width(),
    };
    match field.field_type {
        FieldType::F32 => {
            let v = value.as_f64().ok_or_else(|| mismatch(field, value))?;
            slot.copy_from_slice(&(v as f32).to_le_bytes());
        }
        FieldType::F64 => {
            let v = value.as_f64().ok_or_else(|| mismatch(field, value))?;
            slot.copy_from_slice(&v.to_le_bytes());
        }
        FieldType::Str(width) => {
            let s = value.as_str().ok_or_else(|| mismatch(field, value))?;
            if s.len() > width {
                return Err(overflow());
            }
            slot[..s.len()].copy_from_slice(s.as_bytes());
        }
        FieldType::Bytes(width) => {
            let bytes = match value {
                Value::Bytes(b) => b.as_slice(),
                Value::Str(s) => s.as_bytes(),
                _ => return Err(mismatch(field, value)),
            };
            if bytes.len() > width {
                return Err(overflow());
            }
            slot[..bytes.len()].copy_from_slice(bytes);
        }
        int_type => {
            let v = match value {
                Value::Int(v) => *v,
                Value::Bool(b) => *b as i64,
                _ => return Err(mismatch(field, value)),
            };
            let (min, max) = int_type.int_range().ok_or_else(|| mismatch(field, value))?;
            if (v as i128) < min || (v as i128) > max {
                return Err(overflow());
            }
            let bytes = v.to_le_bytes();
            slot.copy_from_slice(&bytes[..int_type.width()]);
        }
    }
    Ok(())
}

fn unpack_field(field: &FieldDescriptor, slot: &[u8]) -> Result<Value, SchemaError> {
    // Only strings are NUL-padded; byte fields keep the whole slot.
    let trimmed = |bytes: &[u8]| {
        let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        bytes[..end].to_vec()
    };
    let value = match field.field_type {
        FieldType::U8 => Value::Int(slot[0] as i64),
        FieldType::I8 => Value::Int(slot[0] as i8 as i64),
        FieldType::U16 => Value::Int(u16::from_le_bytes([slot[0], slot[1]]) as i64),
        FieldType::I16 => Value::Int(i16::from_le_bytes([slot[0], slot[1]]) as i64),
        FieldType::U32 => Value::Int(u32::from_le_bytes(le4(slot)) as i64),
        FieldType::I32 => Value::Int(i32::from_le_bytes(le4(slot)) as i64),
        FieldType::U64 | FieldType::I64 => Value::Int(i64::from_le_bytes(le8(slot))),
        FieldType::F32 => Value::Float(f32::from_le_bytes(le4(slot)) as f64),
        FieldType::F64 => Value::Float(f64::from_le_bytes(le8(slot))),
        FieldType::Str(_) => Value::Str(String::from_utf8(trimmed(slot)).map_err(|_| {
            SchemaError::InvalidUtf8 {
                field: field.name.clone(),
            }
        })?),
        FieldType::Bytes(_) => Value::Bytes(slot.to_vec()),
    };
    Ok(value)
}

fn le4(slot: &[u8]) -> [u8; 4] {
    [slot[0], slot[1], slot[2], slot[3]]
}

fn le8(slot: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&slot[..8]);
    out
}

/// Registry of record types and the event-type table
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    types: HashMap<String, Arc<RecordType>>,
    event_types: HashMap<u16, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `Device` and `DeviceEvent` chains.
    pub fn with_builtin_types() -> Result<Self, SchemaError> {
        let mut registry = Self::new();
        crate::record::register_builtin_types(&mut registry)?;
        Ok(registry)
    }

    /// Start declaring a record type.
    pub fn define(&mut self, name: impl Into<String>) -> RecordTypeBuilder<'_> {
        RecordTypeBuilder {
            registry: self,
            name: name.into(),
            parent: None,
            fields: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RecordType>> {
        self.types.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Bind an event type id to the record type describing its tuples.
    pub fn map_event_type(&mut self, event_type: u16, record: &str) -> Result<(), SchemaError> {
        if !self.types.contains_key(record) {
            return Err(SchemaError::UnknownType(record.to_string()));
        }
        if self.event_types.contains_key(&event_type) {
            return Err(SchemaError::DuplicateEventType(event_type));
        }
        self.event_types.insert(event_type, record.to_string());
        Ok(())
    }

    pub fn record_for_event(&self, event_type: u16) -> Option<Arc<RecordType>> {
        self.event_types
            .get(&event_type)
            .and_then(|name| self.types.get(name))
            .cloned()
    }

    fn insert(&mut self, record: RecordType) -> Arc<RecordType> {
        let record = Arc::new(record);
        self.types.insert(record.name.clone(), Arc::clone(&record));
        record
    }
}

/// Builder for one record type declaration
pub struct RecordTypeBuilder<'a> {
    registry: &'a mut SchemaRegistry,
    name: String,
    parent: Option<String>,
    fields: Vec<FieldDescriptor>,
}

impl<'a> RecordTypeBuilder<'a> {
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDescriptor::new(name, field_type));
        self
    }

    /// Flatten, validate and register the declaration.
    pub fn register(self) -> Result<Arc<RecordType>, SchemaError> {
        let RecordTypeBuilder {
            registry,
            name,
            parent,
            fields: own_fields,
        } = self;

        if registry.types.contains_key(&name) {
            return Err(SchemaError::DuplicateType(name));
        }

        let (mut fields, mut declared_in, mut offsets, mut row_size) = match &parent {
            Some(parent_name) => {
                let base = registry.types.get(parent_name).ok_or_else(|| {
                    SchemaError::UnknownParent {
                        record: name.clone(),
                        parent: parent_name.clone(),
                    }
                })?;
                (
                    base.fields.clone(),
                    base.declared_in.clone(),
                    base.offsets.clone(),
                    base.row_size,
                )
            }
            None => (Vec::new(), Vec::new(), Vec::new(), 0),
        };

        let inherited = fields.len();
        for field in own_fields {
            if field.field_type.width() == 0 {
                return Err(SchemaError::ZeroWidth {
                    record: name,
                    field: field.name,
                });
            }
            if let Some(i) = fields.iter().position(|f| f.name == field.name) {
                if i < inherited {
                    return Err(SchemaError::InheritedFieldCollision {
                        record: name,
                        field: field.name,
                        inherited_from: declared_in[i].clone(),
                    });
                }
                return Err(SchemaError::DuplicateField {
                    record: name,
                    field: field.name,
                });
            }
            offsets.push(row_size);
            row_size += field.field_type.width();
            declared_in.push(name.clone());
            fields.push(field);
        }

        tracing::trace!(record = %name, fields = fields.len(), row_size, "Registered record type");

        Ok(registry.insert(RecordType {
            name,
            parent,
            fields,
            declared_in,
            offsets,
            row_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_and_child() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .define("BaseDevice")
            .field("a", FieldType::I32)
            .field("b", FieldType::F64)
            .register()
            .unwrap();
        registry
            .define("ChildDevice")
            .extends("BaseDevice")
            .field("c", FieldType::Str(16))
            .register()
            .unwrap();
        registry
    }

    #[test]
    fn test_child_extends_parent_fields() {
        let registry = base_and_child();
        let base = registry.get("BaseDevice").unwrap();
        let child = registry.get("ChildDevice").unwrap();

        assert_eq!(child.field_names(), vec!["a", "b", "c"]);
        assert_eq!(child.offset_of("a"), base.offset_of("a"));
        assert_eq!(child.offset_of("b"), base.offset_of("b"));
        assert_eq!(child.offset_of("c"), Some(base.row_size()));
        assert_eq!(child.row_size(), 4 + 8 + 16);
        assert_eq!(child.declared_in("a"), Some("BaseDevice"));
        assert_eq!(child.declared_in("c"), Some("ChildDevice"));
    }

    #[test]
    fn test_alias_type_without_new_fields() {
        let mut registry = base_and_child();
        let alias = registry
            .define("AliasDevice")
            .extends("ChildDevice")
            .register()
            .unwrap();
        let child = registry.get("ChildDevice").unwrap();
        assert_eq!(alias.field_names(), child.field_names());
        assert_eq!(alias.offsets(), child.offsets());
    }

    #[test]
    fn test_independent_chains_share_nothing() {
        let mut registry = base_and_child();
        let event = registry
            .define("Event")
            .field("a", FieldType::U8)
            .register()
            .unwrap();
        assert_eq!(event.field_names(), vec!["a"]);
        assert_eq!(event.offset_of("a"), Some(0));
        assert_eq!(registry.get("ChildDevice").unwrap().len(), 3);
    }

    #[test]
    fn test_inherited_collision_is_rejected() {
        let mut registry = base_and_child();
        let err = registry
            .define("Bad")
            .extends("ChildDevice")
            .field("b", FieldType::U8)
            .register()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::InheritedFieldCollision {
                record: "Bad".into(),
                field: "b".into(),
                inherited_from: "BaseDevice".into(),
            }
        );
        assert!(!registry.contains("Bad"));
    }

    #[test]
    fn test_unknown_parent_and_duplicates() {
        let mut registry = base_and_child();
        assert!(matches!(
            registry.define("X").extends("Nope").register(),
            Err(SchemaError::UnknownParent { .. })
        ));
        assert!(matches!(
            registry.define("BaseDevice").register(),
            Err(SchemaError::DuplicateType(_))
        ));
        assert!(matches!(
            registry
                .define("Y")
                .field("z", FieldType::U8)
                .field("z", FieldType::U8)
                .register(),
            Err(SchemaError::DuplicateField { .. })
        ));
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let mut registry = SchemaRegistry::new();
        let record = registry
            .define("Everything")
            .field("u8", FieldType::U8)
            .field("i16", FieldType::I16)
            .field("u32", FieldType::U32)
            .field("i64", FieldType::I64)
            .field("f32", FieldType::F32)
            .field("f64", FieldType::F64)
            .field("s", FieldType::Str(8))
            .field("raw", FieldType::Bytes(4))
            .register()
            .unwrap();

        let values = vec![
            Value::Int(255),
            Value::Int(-300),
            Value::Int(4_000_000_000),
            Value::Int(-9_000_000_000),
            Value::Float(0.5),
            Value::Float(1234.5678),
            Value::Str("hello".into()),
            Value::Bytes(vec![1, 2, 3, 4]),
        ];
        let row = record.pack(&values).unwrap();
        assert_eq!(row.len(), record.row_size());
        assert_eq!(record.unpack(&row).unwrap(), values);
    }

    #[test]
    fn test_bytes_keep_trailing_zeros() {
        let mut registry = SchemaRegistry::new();
        let record = registry
            .define("Raw")
            .field("raw", FieldType::Bytes(2))
            .field("tag", FieldType::Str(4))
            .register()
            .unwrap();

        let values = vec![Value::Bytes(vec![1, 0]), Value::Str("ab".into())];
        let row = record.pack(&values).unwrap();
        assert_eq!(record.unpack(&row).unwrap(), values);

        // Short byte values come back padded to the field width.
        let row = record.pack(&[Value::Bytes(vec![7]), Value::Str("".into())]).unwrap();
        assert_eq!(
            record.unpack(&row).unwrap(),
            vec![Value::Bytes(vec![7, 0]), Value::Str("".into())]
        );
    }

    #[test]
    fn test_pack_rejects_bad_values() {
        let registry = base_and_child();
        let child = registry.get("ChildDevice").unwrap();

        assert!(matches!(
            child.pack(&[Value::Int(1), Value::Float(1.0)]),
            Err(SchemaError::Arity { .. })
        ));
        assert!(matches!(
            child.pack(&[Value::Str("x".into()), Value::Float(1.0), Value::Str("c".into())]),
            Err(SchemaError::TypeMismatch { .. })
        ));
        assert!(matches!(
            child.pack(&[
                Value::Int(1),
                Value::Float(1.0),
                Value::Str("this string is far too long".into())
            ]),
            Err(SchemaError::Overflow { .. })
        ));
        assert!(child
            .validate(&[Value::Int(1), Value::Float(1.0), Value::Str("c".into())])
            .is_ok());
        assert!(matches!(
            child.validate(&[Value::Int(1), Value::Float(1.0), Value::Str("c".repeat(17))]),
            Err(SchemaError::Overflow { .. })
        ));
    }

    #[test]
    fn test_to_row_pairs_names() {
        let registry = base_and_child();
        let child = registry.get("ChildDevice").unwrap();
        let values = vec![Value::Int(1), Value::Float(2.0), Value::Str("x".into())];
        let row = child.to_row(&values).unwrap();
        assert_eq!(row[2], ("c", &Value::Str("x".into())));
    }
}
