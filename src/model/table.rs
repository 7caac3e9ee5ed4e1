//! Table Description Types
//!
//! Column lists, keys and indexes of a table, either fetched from a live
//! database or rebuilt from a trigger history.

use serde::{Deserialize, Serialize};

/// Generic column type, enough to tell large objects from plain values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    BigInt,
    Numeric,
    Double,
    Boolean,
    Char,
    Varchar,
    Clob,
    Blob,
    Date,
    Time,
    Timestamp,
    Other,
}

impl ColumnType {
    /// Map a declared SQL type name to a generic column type
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();

        match base {
            "BIGINT" | "INT8" => ColumnType::BigInt,
            "BOOLEAN" | "BOOL" | "BIT" => ColumnType::Boolean,
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time,
            "DATETIME" | "TIMESTAMP" => ColumnType::Timestamp,
            "CHAR" | "NCHAR" | "CHARACTER" => ColumnType::Char,
            "CLOB" | "TEXT" | "LONGTEXT" | "MEDIUMTEXT" | "NCLOB" => ColumnType::Clob,
            "BLOB" | "LONGBLOB" | "MEDIUMBLOB" | "BYTEA" | "VARBINARY" | "BINARY" => {
                ColumnType::Blob
            }
            "REAL" | "DOUBLE" | "FLOAT" => ColumnType::Double,
            "NUMERIC" | "DECIMAL" => ColumnType::Numeric,
            _ if base.contains("INT") => ColumnType::Integer,
            _ if base.contains("CHAR") => ColumnType::Varchar,
            _ => ColumnType::Other,
        }
    }

    /// Large object types
    pub fn is_lob(&self) -> bool {
        matches!(self, ColumnType::Clob | ColumnType::Blob)
    }

    /// Binary types, encoded before being written as text
    pub fn is_binary(&self) -> bool {
        matches!(self, ColumnType::Blob)
    }
}

/// Column description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// Declared type as reported by the database
    pub type_name: String,
    pub primary_key: bool,
    pub required: bool,
    pub default_value: Option<String>,
    pub auto_increment: bool,
}

impl Column {
    /// Column known only by name, typed as a string
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Varchar,
            type_name: "VARCHAR".to_string(),
            primary_key: false,
            required: false,
            default_value: None,
            auto_increment: false,
        }
    }

    /// Column with a declared type
    pub fn typed(name: impl Into<String>, type_name: &str) -> Self {
        Self {
            column_type: ColumnType::from_declared(type_name),
            type_name: type_name.to_string(),
            ..Self::named(name)
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self
    }
}

/// One local to foreign column pairing of a foreign key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub local_column: String,
    pub foreign_column: String,
}

/// Foreign key description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub foreign_table: String,
    pub references: Vec<Reference>,
}

/// Index description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

/// A single-column foreign key pointing back at its own table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfReference {
    /// Column holding the parent's key
    pub parent_column: String,
    /// Column the parent key refers to
    pub child_column: String,
}

/// Table description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub indices: Vec<Index>,
}

impl Table {
    /// Create an empty table description
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Find a column by name, ignoring case
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_key_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn has_lob_columns(&self) -> bool {
        self.columns.iter().any(|c| c.column_type.is_lob())
    }

    /// Name qualified by catalog and schema when they are set
    pub fn qualified_name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(catalog) = &self.catalog {
            parts.push(catalog.as_str());
        }
        if let Some(schema) = &self.schema {
            parts.push(schema.as_str());
        }
        parts.push(self.name.as_str());
        parts.join(".")
    }

    /// Qualified name with each part quoted for use in SQL
    pub fn quoted_name(&self, quote: char) -> String {
        let mut parts = Vec::new();
        if let Some(catalog) = &self.catalog {
            parts.push(quote_identifier(catalog, quote));
        }
        if let Some(schema) = &self.schema {
            parts.push(quote_identifier(schema, quote));
        }
        parts.push(quote_identifier(&self.name, quote));
        parts.join(".")
    }

    /// Copy of this table restricted to, and ordered by, the given columns.
    ///
    /// Columns the table does not have are skipped, or added as plain
    /// string columns when `add_missing` is set. With `set_primary_keys`
    /// the primary key flags are taken from `pk_names`.
    pub fn copy_and_filter_columns(
        &self,
        column_names: &[String],
        pk_names: &[String],
        set_primary_keys: bool,
        add_missing: bool,
    ) -> Table {
        let mut columns = Vec::with_capacity(column_names.len());
        for name in column_names {
            let column = match self.column(name) {
                Some(column) => Some(column.clone()),
                None if add_missing => Some(Column::named(name.clone())),
                None => None,
            };
            if let Some(mut column) = column {
                if set_primary_keys {
                    column.primary_key = pk_names.iter().any(|pk| pk.eq_ignore_ascii_case(name));
                }
                columns.push(column);
            }
        }

        Table {
            catalog: self.catalog.clone(),
            schema: self.schema.clone(),
            name: self.name.clone(),
            columns,
            foreign_keys: self.foreign_keys.clone(),
            indices: self.indices.clone(),
        }
    }

    /// The table's self-referencing foreign key, if it has exactly one and
    /// that key spans a single column.
    pub fn self_reference(&self) -> Option<SelfReference> {
        let mut self_fks = self
            .foreign_keys
            .iter()
            .filter(|fk| fk.foreign_table.eq_ignore_ascii_case(&self.name));

        let fk = self_fks.next()?;
        if self_fks.next().is_some() || fk.references.len() != 1 {
            return None;
        }

        let reference = &fk.references[0];
        Some(SelfReference {
            parent_column: reference.local_column.clone(),
            child_column: reference.foreign_column.clone(),
        })
    }
}

/// Quote an identifier, doubling any embedded quote characters
pub fn quote_identifier(name: &str, quote: char) -> String {
    let doubled: String = name
        .chars()
        .flat_map(|c| {
            if c == quote {
                vec![c, c]
            } else {
                vec![c]
            }
        })
        .collect();
    format!("{}{}{}", quote, doubled, quote)
}
