//! Table-reference extraction from workbook query SQL.
//!
//! Sigma does not expose dataset-to-table lineage directly; it has to be
//! inferred from the SQL of the queries backing workbook elements. Only the
//! references carrying an explicit catalog qualifier (`catalog.db.table`)
//! are kept; unqualified names cannot be resolved to a warehouse table
//! without the connection context, which the API does not return.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_relations, ObjectName};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{Error, Result};

/// Parses `sql` and returns every fully-qualified (three-part) table
/// reference as a dotted `catalog.db.table` name.
///
/// The generic dialect is used since the warehouse behind a dataset is not
/// known at crawl time. A parse failure is fatal to the caller; silently
/// dropping a query would under-report lineage.
pub(crate) fn tables_from_sql(sql: &str) -> Result<BTreeSet<String>> {
    let statements =
        Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| Error::Sql(e.to_string()))?;

    let mut tables = BTreeSet::new();
    for statement in &statements {
        let _ = visit_relations(statement, |name: &ObjectName| {
            if name.0.len() == 3 {
                let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();
                tables.insert(parts.join("."));
            }
            ControlFlow::<()>::Continue(())
        });
    }
    Ok(tables)
}
