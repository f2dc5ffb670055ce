pub mod schema;

pub use schema::{FieldDescriptor, FieldKind, FieldRef, FieldValue, Record, Schema};
