//! Row and batch value types shared by every component.
//!
//! Rows are cheap to clone: both the schema and the values live behind `Arc`s, so
//! fanning a row out to many windows or replaying a snapshot never copies data.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Ordered field names describing the layout of a [`Row`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RowMeta {
  fields: Vec<String>,
}

impl RowMeta {
  /// Creates a schema from field names.
  pub fn new<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      fields: fields.into_iter().map(Into::into).collect(),
    }
  }

  /// Returns the field names in order.
  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  /// Returns the position of a field.
  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.fields.iter().position(|f| f == name)
  }

  /// Number of fields.
  pub fn len(&self) -> usize {
    self.fields.len()
  }

  /// Returns true when the schema has no fields.
  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }
}

/// One output row: a schema plus its values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
  meta: Arc<RowMeta>,
  values: Arc<[Value]>,
}

impl Row {
  /// Creates a row. Values are positional with respect to `meta`.
  pub fn new(meta: Arc<RowMeta>, values: Vec<Value>) -> Self {
    Self {
      meta,
      values: values.into(),
    }
  }

  /// Returns the row schema.
  pub fn meta(&self) -> &Arc<RowMeta> {
    &self.meta
  }

  /// Returns the values in schema order.
  pub fn values(&self) -> &[Value] {
    &self.values
  }

  /// Looks up a value by field name.
  pub fn get(&self, field: &str) -> Option<&Value> {
    self.meta.index_of(field).and_then(|i| self.values.get(i))
  }
}

impl fmt::Display for Row {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, value) in self.values.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      match self.meta.fields().get(i) {
        Some(name) => write!(f, "{}={}", name, value)?,
        None => write!(f, "{}", value)?,
      }
    }
    write!(f, "]")
  }
}

/// The current contents of one window.
///
/// Batches are produced whole and replaced whole; nothing mutates a batch after it
/// has been published.
#[derive(Debug, Clone)]
pub struct RowBatch {
  rows: Vec<Row>,
  produced_at: DateTime<Utc>,
}

impl RowBatch {
  /// Creates a batch stamped with the current time.
  pub fn new(rows: Vec<Row>) -> Self {
    Self {
      rows,
      produced_at: Utc::now(),
    }
  }

  /// Returns the rows in stream order.
  pub fn rows(&self) -> &[Row] {
    &self.rows
  }

  /// Number of rows.
  pub fn len(&self) -> usize {
    self.rows.len()
  }

  /// Returns true when the batch holds no rows.
  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// When the aggregation produced this batch.
  pub fn produced_at(&self) -> DateTime<Utc> {
    self.produced_at
  }
}
