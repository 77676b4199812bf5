//! SQL generation for catalog objects
//!
//! Object and column names are validated and quoted; type expressions,
//! constraints, filters and view bodies come from the catalog as-is.

use crate::database::core::quote_identifier;
use crate::database::error::Result;
use crate::database::schema::definitions::{
    split_reference, IndexDefinition, TableDefinition, ViewDefinition,
};
use std::collections::{HashMap, HashSet};

pub fn create_table_sql(table: &TableDefinition) -> Result<String> {
    let mut lines = Vec::new();
    for (name, type_expr) in &table.columns {
        lines.push(format!("    {} {}", quote_identifier(name)?, type_expr));
    }

    let has_inline_pk = table
        .columns
        .iter()
        .any(|(_, type_expr)| type_expr.to_ascii_uppercase().contains("PRIMARY KEY"));
    if !table.primary_key.is_empty() && !has_inline_pk {
        lines.push(format!("    PRIMARY KEY ({})", quote_list(&table.primary_key)?));
    }

    for (column, reference) in &table.foreign_keys {
        if let Some((referenced, referenced_column)) = split_reference(reference) {
            let target = match referenced_column {
                Some(col) => format!(
                    "{} ({})",
                    quote_identifier(referenced)?,
                    quote_identifier(col)?
                ),
                None => quote_identifier(referenced)?,
            };
            lines.push(format!(
                "    FOREIGN KEY ({}) REFERENCES {}",
                quote_identifier(column)?,
                target
            ));
        }
    }

    for constraint in &table.constraints {
        lines.push(format!("    {}", constraint));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_identifier(&table.name)?,
        lines.join(",\n")
    ))
}

pub fn create_index_sql(index: &IndexDefinition) -> Result<String> {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let filter = match &index.where_clause {
        Some(clause) if !clause.trim().is_empty() => format!(" WHERE {}", clause),
        _ => String::new(),
    };
    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({}){}",
        unique,
        quote_identifier(&index.name)?,
        quote_identifier(&index.table)?,
        quote_list(&index.columns)?,
        filter
    ))
}

pub fn create_view_sql(view: &ViewDefinition) -> Result<String> {
    Ok(format!(
        "CREATE VIEW IF NOT EXISTS {} AS\n{}",
        quote_identifier(&view.name)?,
        view.sql.trim()
    ))
}

pub fn drop_table_sql(name: &str) -> Result<String> {
    Ok(format!("DROP TABLE IF EXISTS {}", quote_identifier(name)?))
}

pub fn drop_index_sql(name: &str) -> Result<String> {
    Ok(format!("DROP INDEX IF EXISTS {}", quote_identifier(name)?))
}

pub fn drop_view_sql(name: &str) -> Result<String> {
    Ok(format!("DROP VIEW IF EXISTS {}", quote_identifier(name)?))
}

fn quote_list(names: &[String]) -> Result<String> {
    Ok(names
        .iter()
        .map(|n| quote_identifier(n))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

/// Table names ordered so that referenced tables come first
///
/// Self-references and references to tables outside `tables` are ignored.
/// A cycle is logged and broken at the table where it is detected.
pub fn creation_order(tables: &[TableDefinition]) -> Vec<String> {
    let known: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let dependencies: HashMap<&str, Vec<&str>> = tables
        .iter()
        .map(|t| {
            let deps = t
                .referenced_tables()
                .into_iter()
                .filter(|dep| known.contains(dep))
                .collect();
            (t.name.as_str(), deps)
        })
        .collect();

    let mut ordered = Vec::with_capacity(tables.len());
    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();
    for table in tables {
        visit(
            table.name.as_str(),
            &dependencies,
            &mut visited,
            &mut visiting,
            &mut ordered,
        );
    }
    ordered
}

fn visit<'t>(
    table: &'t str,
    dependencies: &HashMap<&'t str, Vec<&'t str>>,
    visited: &mut HashSet<&'t str>,
    visiting: &mut HashSet<&'t str>,
    ordered: &mut Vec<String>,
) {
    if visited.contains(table) {
        return;
    }
    if visiting.contains(table) {
        tracing::warn!("Circular dependency detected involving table: {}", table);
        return;
    }

    visiting.insert(table);
    if let Some(deps) = dependencies.get(table) {
        for dep in deps {
            visit(*dep, dependencies, visited, visiting, ordered);
        }
    }
    visiting.remove(table);
    visited.insert(table);
    ordered.push(table.to_string());
}

/// Reverse of [`creation_order`]
pub fn drop_order(tables: &[TableDefinition]) -> Vec<String> {
    let mut order = creation_order(tables);
    order.reverse();
    order
}
