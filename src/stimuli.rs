//! Stimulus tables
//!
//! Stimuli live in CSV files whose schema is owned by downstream tooling, so
//! a [`StimulusTable`] keeps every column as text, in order, and only adds or
//! replaces whole columns. [`StimulusItem`] is the typed view the effect
//! aggregator works on.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::error::TableError;

/// Suffix of per-model surprisal columns
pub const SURPRISAL_SUFFIX: &str = "_surprisal";

/// Column holding a model's surprisal scores
pub fn surprisal_column(model_id: &str) -> String {
    format!("{model_id}{SURPRISAL_SUFFIX}")
}

/// Model identifier of a surprisal column, if it is one
pub fn model_from_column(column: &str) -> Option<&str> {
    column
        .strip_suffix(SURPRISAL_SUFFIX)
        .filter(|model| !model.is_empty())
}

/// A CSV table of stimuli, kept as text
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusTable {
    name: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl StimulusTable {
    /// Build a table in memory
    pub fn new(name: &str, headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.to_string(),
            headers,
            rows,
        }
    }

    /// Load a CSV file with a header row
    pub fn load(path: &Path) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| TableError::csv(path, e))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| TableError::csv(path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| TableError::csv(path, e))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        debug!(
            "Loaded {} rows x {} columns from {}",
            rows.len(),
            headers.len(),
            path.display()
        );

        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            headers,
            rows,
        })
    }

    /// Write the table, replacing `path` only once the whole file is written
    pub fn save(&self, path: &Path) -> Result<(), TableError> {
        write_csv_atomic(path, &self.headers, &self.rows)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column)
    }

    /// Fail with a schema error naming every missing column
    pub fn require_columns(&self, columns: &[&str]) -> Result<(), TableError> {
        let missing: Vec<String> = columns
            .iter()
            .filter(|c| !self.has_column(c))
            .map(|c| (*c).to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TableError::Schema {
                table: self.name.clone(),
                missing,
            })
        }
    }

    /// All values of a column, as text
    pub fn column(&self, column: &str) -> Result<Vec<String>, TableError> {
        let idx = self.index_or_schema_error(column)?;
        Ok(self
            .rows
            .iter()
            .map(|row| row.get(idx).cloned().unwrap_or_default())
            .collect())
    }

    /// Value of a column in one row
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx).map(String::as_str)
    }

    /// A numeric column; empty cells are `None`
    pub fn numeric_column(&self, column: &str) -> Result<Vec<Option<f64>>, TableError> {
        let idx = self.index_or_schema_error(column)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(row, values)| {
                let raw = values.get(idx).map(|v| v.trim()).unwrap_or_default();
                if raw.is_empty() {
                    return Ok(None);
                }
                raw.parse::<f64>()
                    .map(Some)
                    .map_err(|_| TableError::InvalidNumber {
                        row,
                        column: column.to_string(),
                        value: raw.to_string(),
                    })
            })
            .collect()
    }

    /// Add a column at the end, or overwrite it in place if it exists
    pub fn set_column(&mut self, column: &str, values: Vec<String>) -> Result<(), TableError> {
        if values.len() != self.rows.len() {
            return Err(TableError::RaggedColumn {
                column: column.to_string(),
                got: values.len(),
                expected: self.rows.len(),
            });
        }

        let idx = match self.column_index(column) {
            Some(idx) => idx,
            None => {
                self.headers.push(column.to_string());
                self.headers.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            if row.len() <= idx {
                row.resize(idx + 1, String::new());
            }
            row[idx] = value;
        }
        Ok(())
    }

    /// Add or overwrite a numeric column
    pub fn set_numeric_column(&mut self, column: &str, values: &[f64]) -> Result<(), TableError> {
        self.set_column(column, values.iter().map(|v| v.to_string()).collect())
    }

    /// Columns named `{model}_surprisal`, in table order
    pub fn surprisal_columns(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| model_from_column(h).is_some())
            .cloned()
            .collect()
    }

    /// Typed rows for contrast computation.
    ///
    /// Requires `item`; `condition` is required only when `require_condition`
    /// is set. Every surprisal column is parsed.
    pub fn items(&self, require_condition: bool) -> Result<Vec<StimulusItem>, TableError> {
        let mut required = vec!["item"];
        if require_condition {
            required.push("condition");
        }
        self.require_columns(&required)?;

        let mut surprisals: Vec<(String, Vec<Option<f64>>)> = Vec::new();
        for column in self.surprisal_columns() {
            let values = self.numeric_column(&column)?;
            let model = model_from_column(&column).unwrap_or(&column).to_string();
            surprisals.push((model, values));
        }

        let text = |row: usize, column: &str| self.value(row, column).map(str::to_string);

        Ok((0..self.rows.len())
            .map(|row| StimulusItem {
                item: text(row, "item").unwrap_or_default(),
                condition: text(row, "condition"),
                sentence: text(row, "sentence"),
                target: text(row, "target"),
                agent: text(row, "agent"),
                patient: text(row, "patient"),
                context: text(row, "context"),
                tgt_cloze: text(row, "tgt_cloze"),
                surprisals: surprisals
                    .iter()
                    .filter_map(|(model, values)| values[row].map(|v| (model.clone(), v)))
                    .collect(),
            })
            .collect())
    }

    fn index_or_schema_error(&self, column: &str) -> Result<usize, TableError> {
        self.column_index(column).ok_or_else(|| TableError::Schema {
            table: self.name.clone(),
            missing: vec![column.to_string()],
        })
    }
}

/// One stimulus row with its per-model surprisal scores
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StimulusItem {
    pub item: String,
    pub condition: Option<String>,
    pub sentence: Option<String>,
    pub target: Option<String>,
    pub agent: Option<String>,
    pub patient: Option<String>,
    pub context: Option<String>,
    pub tgt_cloze: Option<String>,
    /// Surprisal per model identifier (column name without `_surprisal`)
    pub surprisals: BTreeMap<String, f64>,
}

impl StimulusItem {
    pub fn surprisal(&self, model: &str) -> Option<f64> {
        self.surprisals.get(model).copied()
    }

    pub fn is_condition(&self, condition: &str) -> bool {
        self.condition.as_deref() == Some(condition)
    }
}

/// Write a CSV to a sibling temp file, then rename it over `path`
pub fn write_csv_atomic(
    path: &Path,
    headers: &[String],
    rows: &[Vec<String>],
) -> Result<(), TableError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table.csv".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    {
        let mut writer = csv::Writer::from_path(&tmp_path).map_err(|e| TableError::csv(&tmp_path, e))?;
        writer
            .write_record(headers)
            .map_err(|e| TableError::csv(&tmp_path, e))?;
        for row in rows {
            writer
                .write_record(row)
                .map_err(|e| TableError::csv(&tmp_path, e))?;
        }
        writer
            .flush()
            .map_err(|e| TableError::io(&tmp_path, e))?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| TableError::io(path, e))?;
    Ok(())
}
