//! Query model.
//!
//! A [`Query`] is an ordered list of sql statements executed in one
//! round trip. Each statement declares how many positional parameters
//! it consumes from the flat parameter list, in source order.
use std::hash::{Hash, Hasher};
use std::ops::Range;

use crate::params::Parameters;

/// A single parameterized sql statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimpleQuery {
    sql: String,
    params: usize,
}

impl SimpleQuery {
    /// Create a statement declaring `params` positional parameters.
    pub fn new(sql: impl Into<String>, params: usize) -> Self {
        Self { sql: sql.into(), params }
    }

    /// The sql text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Declared parameter count.
    pub fn param_count(&self) -> usize {
        self.params
    }
}

/// One or more sql statements submitted as a unit.
///
/// Statements execute sequentially in source order and share a single
/// protocol sync point, so a failure in one statement skips the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    statements: Vec<SimpleQuery>,
}

impl Query {
    /// A query of a single statement.
    pub fn simple(sql: impl Into<String>, params: usize) -> Self {
        Self { statements: vec![SimpleQuery::new(sql, params)] }
    }

    /// A query of multiple statements executed in one round trip.
    pub fn combined(statements: Vec<SimpleQuery>) -> Self {
        Self { statements }
    }

    /// Total declared parameter count across all statements.
    pub fn parameter_count(&self) -> usize {
        self.statements.iter().map(SimpleQuery::param_count).sum()
    }

    /// All statements in source order.
    pub fn subqueries(&self) -> &[SimpleQuery] {
        &self.statements
    }

    /// Statement by id.
    ///
    /// # Panics
    ///
    /// Panics when `id` is not below [`subqueries`][Query::subqueries] length.
    pub fn statement(&self, id: usize) -> &SimpleQuery {
        &self.statements[id]
    }

    /// An empty parameter list sized to [`parameter_count`][Query::parameter_count].
    pub fn parameters(&self) -> Parameters {
        Parameters::new(self.parameter_count())
    }

    /// The flat parameter slots consumed by statement `id`.
    pub(crate) fn param_range(&self, id: usize) -> Range<usize> {
        let start = self.statements[..id]
            .iter()
            .map(SimpleQuery::param_count)
            .sum::<usize>();
        start..start + self.statements[id].params
    }
}

impl Hash for Query {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for stmt in &self.statements {
            stmt.hash(state);
        }
    }
}
