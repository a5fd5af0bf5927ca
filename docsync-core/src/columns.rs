//! Tabular data sources.
//!
//! A data source is any model whose `data` property is a map of column name
//! to list. Streaming and patching touch only the affected cells and emit
//! delta events, never the whole table.

use std::collections::BTreeMap;

use crate::document::{Document, DocumentError};
use crate::events::{ChangeEvent, ColumnData, ColumnPatch, ColumnPatches, PatchIndex, SetterId};
use crate::value::{ModelId, Value};

pub const DATA_ATTR: &str = "data";

impl Document {
    /// Current columns of a data source.
    pub fn column_data(&self, source: &ModelId) -> Result<ColumnData, DocumentError> {
        let model = self
            .get_model(source)
            .ok_or_else(|| DocumentError::UnknownModel(source.clone()))?;
        match model.get(DATA_ATTR) {
            None | Some(Value::Null) => Ok(ColumnData::new()),
            Some(Value::Map(columns)) => columns
                .iter()
                .map(|(name, col)| match col {
                    Value::List(items) => Ok((name.clone(), items.clone())),
                    _ => Err(invalid(format!("column {name} is not a list"))),
                })
                .collect(),
            Some(_) => Err(invalid(format!("{source} has no column data"))),
        }
    }

    /// Replace the named columns wholesale (other columns are untouched).
    pub fn set_columns(
        &mut self,
        source: &ModelId,
        new: ColumnData,
        setter: Option<SetterId>,
    ) -> Result<(), DocumentError> {
        self.check_columns(source)?;
        let columns = data_map(self, source)?;
        for (name, values) in &new {
            columns.insert(name.clone(), Value::List(values.clone()));
        }
        let cols = Some(new.keys().cloned().collect());
        self.emit(ChangeEvent::ColumnDataChanged {
            source: source.clone(),
            new,
            cols,
            setter,
        });
        Ok(())
    }

    /// Append rows to every column, then drop rows from the front so no
    /// column exceeds `rollover`.
    pub fn stream(
        &mut self,
        source: &ModelId,
        data: ColumnData,
        rollover: Option<usize>,
        setter: Option<SetterId>,
    ) -> Result<(), DocumentError> {
        self.check_stream(source, &data)?;
        let columns = data_map(self, source)?;
        for (name, rows) in &data {
            if let Some(Value::List(column)) = columns.get_mut(name) {
                column.extend(rows.iter().cloned());
                if let Some(limit) = rollover {
                    if column.len() > limit {
                        let excess = column.len() - limit;
                        column.drain(..excess);
                    }
                }
            }
        }
        self.emit(ChangeEvent::ColumnsStreamed {
            source: source.clone(),
            data,
            rollover,
            setter,
        });
        Ok(())
    }

    /// Apply sparse replacements. Validated in full before any cell changes.
    pub fn patch(
        &mut self,
        source: &ModelId,
        patches: ColumnPatches,
        setter: Option<SetterId>,
    ) -> Result<(), DocumentError> {
        let resolved = self.resolve_patches(source, &patches)?;
        let columns = data_map(self, source)?;
        for (name, targets) in resolved {
            if let Some(Value::List(column)) = columns.get_mut(&name) {
                for (indices, values) in targets {
                    for (i, v) in indices.into_iter().zip(values) {
                        column[i] = v;
                    }
                }
            }
        }
        self.emit(ChangeEvent::ColumnsPatched {
            source: source.clone(),
            patches,
            setter,
        });
        Ok(())
    }

    // ── Checks ───────────────────────────────────────────────────
    //
    // Each check accepts exactly what the matching operation accepts and
    // never mutates.

    pub fn check_columns(&self, source: &ModelId) -> Result<(), DocumentError> {
        self.existing_columns(source).map(|_| ())
    }

    pub fn check_stream(&self, source: &ModelId, data: &ColumnData) -> Result<(), DocumentError> {
        let empty = BTreeMap::new();
        let columns = self.existing_columns(source)?.unwrap_or(&empty);
        if !columns.keys().eq(data.keys()) {
            return Err(invalid("must stream updates to all existing columns".into()));
        }
        let mut lengths = data.values().map(Vec::len);
        if let Some(first) = lengths.next() {
            if lengths.any(|len| len != first) {
                return Err(invalid("all streaming column updates must be the same length".into()));
            }
        }
        if columns.values().any(|column| !matches!(column, Value::List(_))) {
            return Err(invalid("streaming into a non-list column".into()));
        }
        Ok(())
    }

    pub fn check_patch(&self, source: &ModelId, patches: &ColumnPatches) -> Result<(), DocumentError> {
        self.resolve_patches(source, patches).map(|_| ())
    }

    /// Target cells of every patch, or the first reason one cannot apply.
    fn resolve_patches(&self, source: &ModelId, patches: &ColumnPatches) -> Result<ResolvedPatches, DocumentError> {
        let empty = BTreeMap::new();
        let columns = self.existing_columns(source)?.unwrap_or(&empty);
        let mut resolved = Vec::with_capacity(patches.len());
        for (name, column_patches) in patches {
            let len = match columns.get(name) {
                Some(Value::List(items)) => items.len(),
                _ => return Err(invalid(format!("cannot patch unknown column {name}"))),
            };
            let mut targets = Vec::with_capacity(column_patches.len());
            for ColumnPatch(index, value) in column_patches {
                targets.push(resolve_patch(name, len, index, value)?);
            }
            resolved.push((name.clone(), targets));
        }
        Ok(resolved)
    }

    /// Column map of a reachable source. `None` while it has no data yet.
    fn existing_columns(&self, source: &ModelId) -> Result<Option<&BTreeMap<String, Value>>, DocumentError> {
        let model = self
            .get_model(source)
            .ok_or_else(|| DocumentError::UnknownModel(source.clone()))?;
        match model.get(DATA_ATTR) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Map(columns)) => Ok(Some(columns)),
            Some(_) => Err(invalid(format!("{source} has no column data"))),
        }
    }
}

type ResolvedPatches = Vec<(String, Vec<(Vec<usize>, Vec<Value>)>)>;

fn invalid(msg: String) -> DocumentError {
    DocumentError::InvalidColumnData(msg)
}

/// Mutable column map, created on first write. Call only after a check.
fn data_map<'a>(
    doc: &'a mut Document,
    source: &ModelId,
) -> Result<&'a mut BTreeMap<String, Value>, DocumentError> {
    let model = doc.model_mut(source)?;
    let entry = model
        .properties
        .entry(DATA_ATTR.to_string())
        .or_insert_with(|| Value::Map(BTreeMap::new()));
    if matches!(entry, Value::Null) {
        *entry = Value::Map(BTreeMap::new());
    }
    match entry {
        Value::Map(columns) => Ok(columns),
        _ => Err(invalid(format!("{source} has no column data"))),
    }
}

fn resolve_patch(
    name: &str,
    len: usize,
    index: &PatchIndex,
    value: &Value,
) -> Result<(Vec<usize>, Vec<Value>), DocumentError> {
    match index {
        PatchIndex::Index(i) if *i < len => Ok((vec![*i], vec![value.clone()])),
        PatchIndex::Index(i) => Err(invalid(format!(
            "out-of-range index ({i}) in patch for column: {name}"
        ))),
        PatchIndex::Slice(slice) => {
            let indices = slice
                .indices(len)
                .ok_or_else(|| invalid(format!("out-of-range slice in patch for column: {name}")))?;
            let values = value
                .as_list()
                .ok_or_else(|| invalid(format!("slice patch for column {name} needs a list")))?;
            if values.len() != indices.len() {
                return Err(invalid(format!(
                    "slice patch for column {name} covers {} rows but has {} values",
                    indices.len(),
                    values.len()
                )));
            }
            Ok((indices, values.to_vec()))
        }
    }
}
