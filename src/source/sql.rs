//! SQL builders for table extraction

use crate::model::{quote_identifier, Column, SelfReference, Table};

/// Select the given columns, optionally filtered, ordered by primary key
pub fn select_sql(table: &Table, columns: &[&Column], predicates: &[String], quote: char) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(&c.name, quote))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {} FROM {}", column_list, table.quoted_name(quote));

    let predicates: Vec<&String> = predicates.iter().filter(|p| !p.trim().is_empty()).collect();
    if !predicates.is_empty() {
        let joined = predicates
            .iter()
            .map(|p| format!("({})", p))
            .collect::<Vec<_>>()
            .join(" AND ");
        sql.push_str(" WHERE ");
        sql.push_str(&joined);
    }

    let order: Vec<String> = table
        .primary_key_columns()
        .iter()
        .map(|c| quote_identifier(&c.name, quote))
        .collect();
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    sql
}

/// Predicate selecting one level of a self-referencing table.
///
/// Level 0 holds the roots: rows without a parent or pointing at
/// themselves. Level `n` holds the rows whose parent is at level `n - 1`.
pub fn self_reference_predicate(table: &Table, reference: &SelfReference, level: u32, quote: char) -> String {
    let parent = quote_identifier(&reference.parent_column, quote);
    let child = quote_identifier(&reference.child_column, quote);

    let mut predicate = format!("{parent} IS NULL OR {parent} = {child}");
    for _ in 0..level {
        predicate = format!(
            "{parent} IN (SELECT {child} FROM {table} WHERE {predicate}) AND {parent} <> {child}",
            table = table.quoted_name(quote),
        );
    }
    predicate
}

/// Equality predicate on primary key values, used when a reload request
/// carries keys instead of a where clause
pub fn primary_key_predicate(pk_names: &[String], values: &[Option<String>], quote: char) -> String {
    pk_names
        .iter()
        .zip(values)
        .map(|(name, value)| {
            let column = quote_identifier(name, quote);
            match value {
                Some(value) => format!("{} = '{}'", column, value.replace('\'', "''")),
                None => format!("{} IS NULL", column),
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Predicate selecting rows that sort after `last` in primary key order.
///
/// Nulls sort first, so a null key value is passed by any non-null one.
pub fn keyset_predicate(pk_names: &[String], last: &[Option<String>], quote: char) -> String {
    let mut alternatives = Vec::with_capacity(pk_names.len());
    for (i, name) in pk_names.iter().enumerate() {
        let mut terms = Vec::with_capacity(i + 1);
        for (prefix, value) in pk_names.iter().zip(last).take(i) {
            let column = quote_identifier(prefix, quote);
            terms.push(match value {
                Some(value) => format!("{} = '{}'", column, value.replace('\'', "''")),
                None => format!("{} IS NULL", column),
            });
        }
        let column = quote_identifier(name, quote);
        terms.push(match last.get(i).and_then(|v| v.as_ref()) {
            Some(value) => format!("{} > '{}'", column, value.replace('\'', "''")),
            None => format!("{} IS NOT NULL", column),
        });
        alternatives.push(format!("({})", terms.join(" AND ")));
    }
    alternatives.join(" OR ")
}
