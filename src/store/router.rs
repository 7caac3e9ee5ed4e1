//! Data Routers

use std::collections::HashSet;

use super::{DataRouter, RoutingContext};
use crate::error::{Error, Result};
use crate::model::{ChangeRecord, Node, Table};

/// Routes every row to every candidate node
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDataRouter;

impl DataRouter for DefaultDataRouter {
    fn route_to_nodes(
        &self,
        _ctx: &RoutingContext<'_>,
        _record: &ChangeRecord,
        _table: &Table,
        candidates: &[Node],
    ) -> Result<HashSet<String>> {
        Ok(candidates.iter().map(|n| n.node_id.clone()).collect())
    }
}

/// Routes rows by comparing one column against a node attribute or literal.
///
/// The router expression has the form `COLUMN=:NODE_ID`,
/// `COLUMN=:EXTERNAL_ID`, `COLUMN=:NODE_GROUP_ID` or `COLUMN=value`;
/// `!=` inverts the match. Routers without an expression behave like the
/// default router.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnMatchDataRouter;

struct ColumnMatch<'a> {
    column: &'a str,
    negate: bool,
    target: &'a str,
}

impl<'a> ColumnMatch<'a> {
    fn parse(expression: &'a str) -> Result<Self> {
        let (column, target, negate) = if let Some((column, target)) = expression.split_once("!=") {
            (column, target, true)
        } else if let Some((column, target)) = expression.split_once('=') {
            (column, target, false)
        } else {
            return Err(Error::Config(format!(
                "Router expression '{}' must have the form COLUMN=VALUE",
                expression
            )));
        };
        Ok(Self {
            column: column.trim(),
            negate,
            target: target.trim(),
        })
    }

    fn expected<'n>(&self, node: &'n Node) -> &'n str
    where
        'a: 'n,
    {
        match self.target.to_uppercase().as_str() {
            ":NODE_ID" => &node.node_id,
            ":EXTERNAL_ID" => &node.external_id,
            ":NODE_GROUP_ID" => &node.node_group_id,
            _ => self.target,
        }
    }
}

impl DataRouter for ColumnMatchDataRouter {
    fn route_to_nodes(
        &self,
        ctx: &RoutingContext<'_>,
        record: &ChangeRecord,
        table: &Table,
        candidates: &[Node],
    ) -> Result<HashSet<String>> {
        let expression = match ctx.router.router_expression.as_deref() {
            Some(expr) if !expr.trim().is_empty() => expr,
            _ => return DefaultDataRouter.route_to_nodes(ctx, record, table, candidates),
        };
        let rule = ColumnMatch::parse(expression)?;

        let index = table
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(rule.column))
            .ok_or_else(|| {
                Error::Config(format!(
                    "Router {} refers to column {} which {} does not have",
                    ctx.router.router_id,
                    rule.column,
                    table.qualified_name()
                ))
            })?;

        let row = record.parsed_row_data()?;
        let value = row.get(index).cloned().flatten();

        Ok(candidates
            .iter()
            .filter(|node| {
                let matched = value.as_deref() == Some(rule.expected(node));
                matched != rule.negate
            })
            .map(|node| node.node_id.clone())
            .collect())
    }
}
