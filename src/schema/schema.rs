use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use arrow::array::{ArrayBuilder, ArrayRef, BooleanBuilder, MapBuilder, StringDictionaryBuilder, UInt64Builder};
use arrow::datatypes::{Field, Int32Type, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use crate::core::error::{Error, ErrorKind, Result};

/// Physical kind of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Boolean,
    UInt64,
    Map,       // string -> string
    Int64,
    Float64,
    String,
    List,
}

impl FieldKind {
    pub fn is_supported(&self) -> bool {
        matches!(self, FieldKind::Boolean | FieldKind::UInt64 | FieldKind::Map)
    }
}

/// Borrowed view of one field of one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldRef<'a> {
    Null,
    Boolean(bool),
    UInt64(u64),
    Map(&'a BTreeMap<String, String>),
    Int64(i64),
    Float64(f64),
    String(&'a str),
    List(usize),
}

/// Rust types that can appear as record fields.
pub trait FieldValue {
    const KIND: FieldKind;
    const OPTIONAL: bool = false;

    fn as_field(&self) -> FieldRef<'_>;
}

impl FieldValue for bool {
    const KIND: FieldKind = FieldKind::Boolean;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::Boolean(*self)
    }
}

impl FieldValue for u64 {
    const KIND: FieldKind = FieldKind::UInt64;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::UInt64(*self)
    }
}

impl FieldValue for BTreeMap<String, String> {
    const KIND: FieldKind = FieldKind::Map;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::Map(self)
    }
}

impl FieldValue for i64 {
    const KIND: FieldKind = FieldKind::Int64;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::Int64(*self)
    }
}

impl FieldValue for f64 {
    const KIND: FieldKind = FieldKind::Float64;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::Float64(*self)
    }
}

impl FieldValue for String {
    const KIND: FieldKind = FieldKind::String;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::String(self)
    }
}

impl<T: FieldValue> FieldValue for Vec<T> {
    const KIND: FieldKind = FieldKind::List;
    fn as_field(&self) -> FieldRef<'_> {
        FieldRef::List(self.len())
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const KIND: FieldKind = T::KIND;
    const OPTIONAL: bool = true;
    fn as_field(&self) -> FieldRef<'_> {
        match self {
            Some(value) => value.as_field(),
            None => FieldRef::Null,
        }
    }
}

/// Compile-time description of one field of `T`.
pub struct FieldDescriptor<T> {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
    pub get: fn(&T) -> FieldRef<'_>,
}

impl<T> Clone for FieldDescriptor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FieldDescriptor<T> {}

impl<T> std::fmt::Debug for FieldDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("optional", &self.optional)
            .finish()
    }
}

/// A record type with a fixed, ordered field list. Usually implemented by [`record!`](crate::record).
pub trait Record: Sized {
    fn descriptors() -> Vec<FieldDescriptor<Self>>;
}

/// Declares a struct and implements [`Record`] for it.
///
/// ```ignore
/// tallyx::record! {
///     pub struct Event {
///         pub uid: u64,
///         pub bounce: Option<bool>,
///         pub tags: Option<BTreeMap<String, String>>,
///     }
/// }
/// ```
#[macro_export]
macro_rules! record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty ),*
        }

        impl $crate::schema::Record for $name {
            fn descriptors() -> ::std::vec::Vec<$crate::schema::FieldDescriptor<Self>> {
                ::std::vec![
                    $(
                        {
                            fn get(record: &$name) -> $crate::schema::FieldRef<'_> {
                                $crate::schema::FieldValue::as_field(&record.$field)
                            }
                            $crate::schema::FieldDescriptor {
                                name: ::std::stringify!($field),
                                kind: <$ty as $crate::schema::FieldValue>::KIND,
                                optional: <$ty as $crate::schema::FieldValue>::OPTIONAL,
                                get,
                            }
                        }
                    ),*
                ]
            }
        }
    };
}

type StringDictionary = StringDictionaryBuilder<Int32Type>;

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    UInt64(UInt64Builder),
    // Keys and values are both dictionary-encoded
    Map(MapBuilder<StringDictionary, StringDictionary>),
}

impl ColumnBuilder {
    fn new(kind: FieldKind) -> Option<Self> {
        match kind {
            FieldKind::Boolean => Some(ColumnBuilder::Boolean(BooleanBuilder::new())),
            FieldKind::UInt64 => Some(ColumnBuilder::UInt64(UInt64Builder::new())),
            FieldKind::Map => Some(ColumnBuilder::Map(MapBuilder::new(
                None,
                StringDictionary::new(),
                StringDictionary::new(),
            ))),
            _ => None,
        }
    }

    fn accepts(&self, value: &FieldRef<'_>) -> bool {
        matches!(
            (self, value),
            (_, FieldRef::Null)
                | (ColumnBuilder::Boolean(_), FieldRef::Boolean(_))
                | (ColumnBuilder::UInt64(_), FieldRef::UInt64(_))
                | (ColumnBuilder::Map(_), FieldRef::Map(_))
        )
    }

    // Caller has checked `accepts`
    fn append(&mut self, value: FieldRef<'_>) -> Result<()> {
        match (self, value) {
            (ColumnBuilder::Boolean(b), FieldRef::Boolean(v)) => b.append_value(v),
            (ColumnBuilder::Boolean(b), FieldRef::Null) => b.append_null(),
            (ColumnBuilder::UInt64(b), FieldRef::UInt64(v)) => b.append_value(v),
            (ColumnBuilder::UInt64(b), FieldRef::Null) => b.append_null(),
            (ColumnBuilder::Map(b), FieldRef::Map(map)) => {
                for (key, value) in map {
                    b.keys().append(key)?;
                    b.values().append(value)?;
                }
                b.append(true)?;
            }
            (ColumnBuilder::Map(b), FieldRef::Null) => b.append(false)?,
            (_, other) => {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("column builder cannot take {:?}", other),
                ));
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        match self {
            ColumnBuilder::Boolean(b) => b.len(),
            ColumnBuilder::UInt64(b) => b.len(),
            ColumnBuilder::Map(b) => b.len(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt64(b) => Arc::new(b.finish()),
            ColumnBuilder::Map(b) => Arc::new(b.finish()),
        }
    }
}

/// Column builders for record type `T`, validated once at construction.
pub struct Schema<T: Record> {
    fields: Vec<FieldDescriptor<T>>,
    builders: Vec<ColumnBuilder>,
    rows: usize,
}

impl<T: Record> Schema<T> {
    pub fn new() -> Result<Self> {
        let fields = T::descriptors();
        if fields.is_empty() {
            return Err(Error::new(ErrorKind::UnsupportedSchema, "record has no fields"));
        }

        let mut seen = HashSet::new();
        let mut builders = Vec::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.name) {
                return Err(Error::new(
                    ErrorKind::UnsupportedSchema,
                    format!("duplicate field {}", field.name),
                ));
            }
            if field.name.contains('=') {
                return Err(Error::new(
                    ErrorKind::UnsupportedSchema,
                    format!("field name {:?} contains '='", field.name),
                ));
            }
            let builder = ColumnBuilder::new(field.kind).ok_or_else(|| {
                Error::new(
                    ErrorKind::UnsupportedSchema,
                    format!("field {}: {:?} columns are not supported", field.name, field.kind),
                )
            })?;
            builders.push(builder);
        }

        Ok(Schema { fields, builders, rows: 0 })
    }

    pub fn fields(&self) -> &[FieldDescriptor<T>] {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// Rows appended since the last `new_record`.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Appends one row; absent optional fields become nulls.
    ///
    /// Every field is checked before any builder is touched, so a rejected
    /// record leaves all columns aligned.
    pub fn append(&mut self, record: &T) -> Result<()> {
        let mut values = Vec::with_capacity(self.fields.len());
        for (field, builder) in self.fields.iter().zip(&self.builders) {
            let value = (field.get)(record);
            if matches!(value, FieldRef::Null) && !field.optional {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("field {} is required", field.name),
                ));
            }
            if !builder.accepts(&value) {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("field {}: unexpected value {:?}", field.name, value),
                ));
            }
            values.push(value);
        }

        for (builder, value) in self.builders.iter_mut().zip(values) {
            builder.append(value)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Finishes all builders into one batch and leaves them empty for reuse.
    pub fn new_record(&mut self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut columns = Vec::with_capacity(self.fields.len());
        for (field, builder) in self.fields.iter().zip(self.builders.iter_mut()) {
            let array = builder.finish();
            fields.push(Field::new(field.name, array.data_type().clone(), true));
            columns.push(array);
        }
        self.rows = 0;

        let schema = Arc::new(ArrowSchema::new(fields));
        Ok(RecordBatch::try_new(schema, columns)?)
    }

    /// Discards buffered rows.
    pub fn reset(&mut self) {
        for builder in self.builders.iter_mut() {
            if builder.len() > 0 {
                builder.finish();
            }
        }
        self.rows = 0;
    }
}
