//! Table definition documents carried by CREATE events

use crate::config::DefinitionOptions;
use crate::error::Result;
use crate::model::Table;

/// Serialize a table definition, leaving out the parts `options` excludes
pub fn table_definition(table: &Table, options: DefinitionOptions) -> Result<String> {
    let mut table = table.clone();

    if options.without_defaults {
        for column in &mut table.columns {
            column.default_value = None;
        }
    }
    if options.without_pks {
        for column in &mut table.columns {
            column.primary_key = false;
        }
    }
    if options.without_fks {
        table.foreign_keys.clear();
    }
    if options.without_indexes {
        table.indices.clear();
    }

    Ok(serde_json::to_string(&table)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, ForeignKey, Index, Reference};

    fn folder() -> Table {
        let mut name = Column::typed("name", "VARCHAR(50)");
        name.default_value = Some("'untitled'".into());
        let mut table = Table::new("folder")
            .with_columns(vec![Column::typed("id", "INTEGER").primary(), name])
            .with_foreign_key(ForeignKey {
                name: "fk_parent".into(),
                foreign_table: "folder".into(),
                references: vec![Reference {
                    local_column: "parent_id".into(),
                    foreign_column: "id".into(),
                }],
            });
        table.indices.push(Index {
            name: "idx_name".into(),
            unique: true,
            columns: vec!["name".into()],
        });
        table
    }

    #[test]
    fn test_full_definition() {
        let json = table_definition(&folder(), DefinitionOptions::default()).unwrap();
        let parsed: Table = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, folder());
    }

    #[test]
    fn test_stripped_definition() {
        let options = DefinitionOptions {
            without_defaults: true,
            without_fks: true,
            without_indexes: true,
            without_pks: true,
        };
        let json = table_definition(&folder(), options).unwrap();
        let parsed: Table = serde_json::from_str(&json).unwrap();

        assert!(parsed.foreign_keys.is_empty());
        assert!(parsed.indices.is_empty());
        assert!(parsed.primary_key_columns().is_empty());
        assert!(parsed.columns[1].default_value.is_none());
        assert_eq!(parsed.column_names(), vec!["id", "name"]);
    }
}
