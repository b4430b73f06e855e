//! Filter accumulation and composition.
//!
//! A [`FilterBuilder`] holds an optional base condition (set by `where_`)
//! and an ordered list of `(connector, condition)` pairs (appended by `and`
//! and `or`). [`FilterBuilder::compose`] flattens them with run-based
//! grouping: entries are scanned left to right and a group is closed exactly
//! when the connector changes. The base condition joins the first run. The
//! closed groups are then ANDed together.
//!
//! This is not SQL precedence. `where(A).and(B).and(C).or(D)` composes to
//! `AND(AND(A, B, C), OR(D))`, not `(A AND B AND C) OR D`.

use crate::expr::Expr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

impl Connector {
    fn join(self, values: Vec<Expr>) -> Expr {
        match self {
            Connector::And => Expr::And(values),
            Connector::Or => Expr::Or(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub connector: Connector,
    pub value: Expr,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterBuilder {
    base: Option<Expr>,
    filters: Vec<Filter>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base condition, replacing any previous one
    pub fn where_(mut self, condition: Expr) -> Self {
        if self.base.is_some() {
            debug!("replacing base filter condition");
        }
        self.base = Some(condition);
        self
    }

    pub fn and(mut self, condition: Expr) -> Self {
        self.filters.push(Filter {
            connector: Connector::And,
            value: condition,
        });
        self
    }

    pub fn or(mut self, condition: Expr) -> Self {
        self.filters.push(Filter {
            connector: Connector::Or,
            value: condition,
        });
        self
    }

    pub fn where_exists(self, field: impl Into<String>) -> Self {
        self.where_(Expr::exists(field))
    }

    pub fn where_not_exists(self, field: impl Into<String>) -> Self {
        self.where_(Expr::not_exists(field))
    }

    pub fn and_exists(self, field: impl Into<String>) -> Self {
        self.and(Expr::exists(field))
    }

    pub fn and_not_exists(self, field: impl Into<String>) -> Self {
        self.and(Expr::not_exists(field))
    }

    pub fn or_exists(self, field: impl Into<String>) -> Self {
        self.or(Expr::exists(field))
    }

    pub fn or_not_exists(self, field: impl Into<String>) -> Self {
        self.or(Expr::not_exists(field))
    }

    pub fn base(&self) -> Option<&Expr> {
        self.base.as_ref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_none() && self.filters.is_empty()
    }

    /// Flatten the accumulated state into one expression.
    ///
    /// Returns the base condition alone (possibly `None`) when no
    /// `and`/`or` entries were added.
    pub fn compose(&self) -> Option<Expr> {
        let Some((first, rest)) = self.filters.split_first() else {
            return self.base.clone();
        };

        let mut groups = Vec::new();
        let mut connector = first.connector;
        let mut run: Vec<Expr> = self.base.iter().cloned().collect();
        run.push(first.value.clone());

        for filter in rest {
            if filter.connector != connector {
                groups.push(connector.join(std::mem::take(&mut run)));
                connector = filter.connector;
            }
            run.push(filter.value.clone());
        }
        groups.push(connector.join(run));

        if groups.len() == 1 {
            groups.pop()
        } else {
            Some(Expr::And(groups))
        }
    }
}
