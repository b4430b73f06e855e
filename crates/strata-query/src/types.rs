use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single row or document at the store boundary
pub type DataRow = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// `1` or `-1`, the document-store sort value
    pub fn as_i32(&self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }

    /// `ASC` (any case) is ascending, everything else descending
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("asc") {
            SortOrder::Ascending
        } else {
            SortOrder::Descending
        }
    }
}

/// Ordered sort fields; the first entry is the primary sort key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec(pub Vec<(String, SortOrder)>);

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; a field already present keeps its position and takes the new order
    pub fn push(&mut self, field: impl Into<String>, order: SortOrder) {
        let field = field.into();
        match self.0.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = order,
            None => self.0.push((field, order)),
        }
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.push(field, SortOrder::Ascending);
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.push(field, SortOrder::Descending);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, SortOrder)> {
        self.0.iter()
    }
}

/// Offset and page size. A zero limit means no bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub offset: u64,
    pub limit: u64,
}

impl Paging {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// 1-based page number to offset/limit
    pub fn page(page: u64, page_size: u64) -> Self {
        Self {
            offset: page.saturating_sub(1).saturating_mul(page_size),
            limit: page_size,
        }
    }
}

/// Finalized sort and paging handed to a store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: SortSpec,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_paging(mut self, paging: Paging) -> Self {
        self.offset = paging.offset;
        self.limit = (paging.limit > 0).then_some(paging.limit);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Whether a write touches the first match or every match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteScope {
    One,
    Many,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    pub inserted_ids: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_order_parse() {
        assert_eq!(SortOrder::parse("ASC"), SortOrder::Ascending);
        assert_eq!(SortOrder::parse("asc"), SortOrder::Ascending);
        assert_eq!(SortOrder::parse("DESC"), SortOrder::Descending);
        assert_eq!(SortOrder::parse(""), SortOrder::Descending);
    }

    #[test]
    fn test_sort_spec_keeps_position() {
        let sort = SortSpec::new().asc("a").desc("b").desc("a");
        assert_eq!(
            sort.0,
            vec![
                ("a".to_string(), SortOrder::Descending),
                ("b".to_string(), SortOrder::Descending)
            ]
        );
    }

    #[test]
    fn test_paging_zero_limit_is_unbounded() {
        let opts = FindOptions::new().with_paging(Paging::new(20, 0));
        assert_eq!(opts.offset, 20);
        assert_eq!(opts.limit, None);
        assert_eq!(Paging::page(3, 10), Paging::new(20, 10));
        assert_eq!(Paging::page(0, 10), Paging::new(0, 10));
    }
}
