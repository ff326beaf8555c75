//! Index schema: which document fields get indexed, and how.
//!
//! The schema is handed to tantivy when the index is created. Documents are
//! plain JSON objects; fields outside the schema are kept in the stored
//! document but never indexed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tantivy::schema::{Field, Schema, FAST, INDEXED, STORED, TEXT};

use crate::errors::IndexerError;

/// Stored form of every inserted log record.
pub type Document = Map<String, Value>;

/// Reserved tantivy field that carries the document id.
pub const ID_FIELD: &str = "_id";

/// Type of an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Tokenized full-text field.
    String,
    /// 64-bit float, range-filterable and sortable.
    Number,
    /// Equality-filterable flag.
    Boolean,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
        }
    }
}

/// Field name → kind. Ordered so that snapshots and introspection output are stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSchema(BTreeMap<String, FieldKind>);

impl Default for IndexSchema {
    /// The pino log record: `level`, `time`, `msg`, `pid`, `hostname`.
    fn default() -> Self {
        let fields = [
            ("level", FieldKind::Number),
            ("time", FieldKind::Number),
            ("msg", FieldKind::String),
            ("pid", FieldKind::Number),
            ("hostname", FieldKind::String),
        ];
        IndexSchema(
            fields
                .into_iter()
                .map(|(name, kind)| (name.to_string(), kind))
                .collect(),
        )
    }
}

impl IndexSchema {
    pub fn new(fields: BTreeMap<String, FieldKind>) -> Result<Self, IndexerError> {
        let schema = IndexSchema(fields);
        schema.check()?;
        Ok(schema)
    }

    /// Reject schemas tantivy would refuse, or that collide with the id field.
    pub fn check(&self) -> Result<(), IndexerError> {
        if self.0.is_empty() {
            return Err(IndexerError::InvalidSchema("schema has no fields".into()));
        }
        for name in self.0.keys() {
            if name == ID_FIELD {
                return Err(IndexerError::InvalidSchema(format!(
                    "`{ID_FIELD}` is reserved"
                )));
            }
            if name.is_empty() || name.starts_with('-') {
                return Err(IndexerError::InvalidSchema(format!(
                    "invalid field name {name:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<FieldKind> {
        self.0.get(name).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.0.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that `value` is an object whose schema fields carry the right JSON types.
    /// Missing and `null` fields are allowed.
    pub fn validate_document<'a>(&self, value: &'a Value) -> Result<&'a Document, IndexerError> {
        let object = value.as_object().ok_or_else(|| {
            IndexerError::InvalidDocument(format!("expected a JSON object, got {}", type_name(value)))
        })?;

        for (name, kind) in self.fields() {
            match object.get(name) {
                None | Some(Value::Null) => {}
                Some(v) if kind.accepts(v) => {}
                Some(v) => {
                    return Err(IndexerError::SchemaMismatch {
                        field: name.to_string(),
                        expected: kind.as_str(),
                        got: type_name(v).to_string(),
                    })
                }
            }
        }
        Ok(object)
    }

    /// Validate `value` and take ownership of its object.
    pub fn into_document(&self, value: Value) -> Result<Document, IndexerError> {
        self.validate_document(&value)?;
        match value {
            Value::Object(document) => Ok(document),
            other => Err(IndexerError::InvalidDocument(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Build the tantivy schema, plus field handles in schema order.
    pub fn build_tantivy(&self) -> TantivyFields {
        let mut builder = Schema::builder();

        let id = builder.add_u64_field(ID_FIELD, INDEXED | STORED | FAST);

        let fields = self
            .fields()
            .map(|(name, kind)| {
                let field = match kind {
                    // Positions are kept so that multi-token filters can run as phrases
                    FieldKind::String => builder.add_text_field(name, TEXT),
                    FieldKind::Number => builder.add_f64_field(name, INDEXED | FAST),
                    FieldKind::Boolean => builder.add_bool_field(name, INDEXED | FAST),
                };
                (name.to_string(), (field, kind))
            })
            .collect();

        TantivyFields {
            schema: builder.build(),
            id,
            fields,
        }
    }
}

/// The tantivy side of an [`IndexSchema`].
#[derive(Clone, Debug)]
pub struct TantivyFields {
    pub schema: Schema,
    pub id: Field,
    pub fields: BTreeMap<String, (Field, FieldKind)>,
}

impl TantivyFields {
    pub fn lookup(&self, name: &str) -> Result<(Field, FieldKind), IndexerError> {
        self.fields
            .get(name)
            .copied()
            .ok_or_else(|| IndexerError::UnknownField(name.to_string()))
    }

    pub fn text_fields(&self) -> Vec<Field> {
        self.fields
            .values()
            .filter(|(_, kind)| *kind == FieldKind::String)
            .map(|(field, _)| *field)
            .collect()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
