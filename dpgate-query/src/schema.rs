use serde::{Deserialize, Serialize};

use crate::errors::StructuralError;

/// Declared type of a column. Bounds on the numeric variants come from the
/// dataset owner and are what aggregations clamp to; they are never derived
/// from the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum ColumnType {
    #[serde(rename = "Int")]
    BoundedInt { low: i64, high: i64 },
    #[serde(rename = "Double")]
    BoundedDouble { low: f64, high: f64 },
    #[serde(rename = "Enum")]
    Enum {
        #[serde(default)]
        labels: Vec<String>,
    },
    #[serde(rename = "Text")]
    Text,
}

impl ColumnType {
    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnType::BoundedInt { .. } => "Int",
            ColumnType::BoundedDouble { .. } => "Double",
            ColumnType::Enum { .. } => "Enum",
            ColumnType::Text => "Text",
        }
    }

    /// Only bounded numeric columns may feed numeric aggregations or bins.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::BoundedInt { .. } | ColumnType::BoundedDouble { .. }
        )
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            ColumnType::BoundedInt { low, high } => Some((*low as f64, *high as f64)),
            ColumnType::BoundedDouble { low, high } => Some((*low, *high)),
            ColumnType::Enum { .. } | ColumnType::Text => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Self {
        Self::new(name, ColumnType::BoundedInt { low, high })
    }

    pub fn double(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self::new(name, ColumnType::BoundedDouble { low, high })
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }
}

/// A column resolved against a schema: its position in every row plus its
/// declared type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColumnRef<'s> {
    pub index: usize,
    pub column: &'s Column,
}

impl<'s> ColumnRef<'s> {
    pub fn name(&self) -> &'s str {
        &self.column.name
    }

    pub fn require_numeric(&self, operation: &'static str) -> Result<(f64, f64), StructuralError> {
        self.column
            .ty
            .bounds()
            .ok_or_else(|| StructuralError::IneligibleColumn {
                column: self.column.name.clone(),
                operation,
                type_name: self.column.ty.type_name(),
            })
    }
}

/// Ordered column descriptors; names are unique.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self, StructuralError> {
        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].iter().any(|seen| seen.name == column.name) {
                return Err(StructuralError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Result<ColumnRef<'_>, StructuralError> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, column)| column.name == name)
            .map(|(index, column)| ColumnRef { index, column })
            .ok_or_else(|| StructuralError::UnknownColumn(name.to_owned()))
    }
}

impl TryFrom<Vec<Column>> for Schema {
    type Error = StructuralError;

    fn try_from(columns: Vec<Column>) -> Result<Self, Self::Error> {
        Schema::new(columns)
    }
}

impl From<Schema> for Vec<Column> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_schema_json() {
        let raw = r#"[
            {"name": "name", "type": {"name": "Text"}},
            {"name": "age", "type": {"name": "Int", "low": 0, "high": 100}},
            {"name": "income", "type": {"name": "Double", "low": 0, "high": 250000}},
            {"name": "city", "type": {"name": "Enum", "labels": ["a", "b"]}}
        ]"#;
        let schema: Schema = serde_json::from_str(raw).unwrap();
        assert_eq!(schema.len(), 4);
        let age = schema.resolve("age").unwrap();
        assert_eq!(age.index, 1);
        assert_eq!(age.column.ty.bounds(), Some((0.0, 100.0)));
        assert!(!schema.resolve("city").unwrap().column.ty.is_numeric());
        assert_eq!(
            schema.resolve("zip").unwrap_err(),
            StructuralError::UnknownColumn("zip".into())
        );
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Schema::new(vec![Column::text("a"), Column::int("a", 0, 1)]).unwrap_err();
        assert_eq!(err, StructuralError::DuplicateColumn("a".into()));
        let raw = r#"[{"name":"a","type":{"name":"Text"}},{"name":"a","type":{"name":"Text"}}]"#;
        assert!(serde_json::from_str::<Schema>(raw).is_err());
    }

    #[test]
    fn eligibility_is_by_type() {
        let schema = Schema::new(vec![Column::text("name"), Column::double("score", -1.0, 1.0)]).unwrap();
        let err = schema.resolve("name").unwrap().require_numeric("sum").unwrap_err();
        assert!(matches!(err, StructuralError::IneligibleColumn { type_name: "Text", .. }));
        assert_eq!(
            schema.resolve("score").unwrap().require_numeric("sum").unwrap(),
            (-1.0, 1.0)
        );
    }
}
