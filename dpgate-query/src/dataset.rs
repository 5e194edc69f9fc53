use serde::{Deserialize, Serialize};

use crate::{errors::DataError, schema::ColumnRef};

/// One record as delivered by the dataset provider. Every cell stays a
/// string until a predicate or aggregation needs it, so parse failures
/// surface at use time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(pub Vec<String>);

impl Row {
    pub fn cell(&self, column: &ColumnRef<'_>) -> Result<&str, DataError> {
        self.0
            .get(column.index)
            .map(String::as_str)
            .ok_or_else(|| DataError::MissingCell {
                column: column.name().to_owned(),
                index: column.index,
                width: self.0.len(),
            })
    }

    pub fn numeric(&self, column: &ColumnRef<'_>) -> Result<f64, DataError> {
        let raw = self.cell(column)?;
        raw.trim()
            .parse::<f64>()
            .map_err(|_| DataError::NotNumeric {
                column: column.name().to_owned(),
                value: raw.to_owned(),
            })
    }
}

impl<S: Into<String>> FromIterator<S> for Row {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Row(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    rows: Vec<Row>,
}

impl Dataset {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Builds a dataset from CSV-shaped records whose first record is the
    /// header row.
    pub fn from_records_with_header(mut records: Vec<Vec<String>>) -> Self {
        if !records.is_empty() {
            records.remove(0);
        }
        Self {
            rows: records.into_iter().map(Row).collect(),
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
