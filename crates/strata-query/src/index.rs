//! Entity index declarations.
//!
//! Index names are synthesized from the index type and the ordered field
//! list, so the same declaration always yields the same name and repeated
//! creation is a no-op on the store side.

use crate::error::{DataError, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    Primary,
    Unique,
    Index,
    /// MySQL FULLTEXT, MongoDB text
    FullText,
    Spatial,
    Spatial2D,
    Spatial2DSphere,
    Hashed,
}

impl IndexType {
    /// One-letter name prefix. Primary uses the reserved name `PRIMARY`.
    pub fn prefix(&self) -> &'static str {
        match self {
            IndexType::Primary => "PRIMARY",
            IndexType::Unique => "U",
            IndexType::Index => "I",
            IndexType::FullText => "F",
            IndexType::Spatial => "S",
            IndexType::Spatial2D => "G",
            IndexType::Spatial2DSphere => "R",
            IndexType::Hashed => "H",
        }
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, IndexType::Primary | IndexType::Unique)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub field: String,
    /// Descending unless set
    pub asc: bool,
    /// Default language for full-text indexes
    pub language: Option<String>,
}

impl IndexColumn {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            asc: false,
            language: None,
        }
    }

    pub fn asc(mut self) -> Self {
        self.asc = true;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub index_type: IndexType,
    pub columns: Vec<IndexColumn>,
}

/// Document-store index creation request
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentIndexModel {
    pub name: String,
    /// Ordered `(field, 1 | -1 | "text" | "hashed" | "2d" | "2dsphere")`
    pub keys: Vec<(String, Value)>,
    pub unique: bool,
    pub default_language: Option<String>,
}

impl IndexSpec {
    pub fn declare<I, S>(index_type: IndexType, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            index_type,
            columns: fields.into_iter().map(IndexColumn::new).collect(),
        }
    }

    pub fn with_columns(index_type: IndexType, columns: Vec<IndexColumn>) -> Self {
        Self {
            index_type,
            columns,
        }
    }

    pub fn primary<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Primary, fields)
    }

    pub fn unique<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Unique, fields)
    }

    pub fn index<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Index, fields)
    }

    pub fn full_text<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::FullText, fields)
    }

    pub fn spatial<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Spatial, fields)
    }

    pub fn spatial_2d<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Spatial2D, fields)
    }

    pub fn spatial_2dsphere<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Spatial2DSphere, fields)
    }

    pub fn hashed<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::declare(IndexType::Hashed, fields)
    }

    /// Mark every column ascending
    pub fn asc(mut self) -> Self {
        for column in &mut self.columns {
            column.asc = true;
        }
        self
    }

    pub fn fields(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.field.clone()).collect()
    }

    /// `PRIMARY`, or the type prefix followed by `_field` per column with
    /// underscores stripped from each field name (`U_userid_email`).
    pub fn name(&self) -> String {
        if self.index_type == IndexType::Primary {
            return IndexType::Primary.prefix().to_string();
        }
        let mut name = String::from(self.index_type.prefix());
        for column in &self.columns {
            name.push('_');
            name.extend(column.field.chars().filter(|c| *c != '_'));
        }
        name
    }

    pub fn to_document_model(&self) -> DocumentIndexModel {
        let mut default_language = None;
        let keys = self
            .columns
            .iter()
            .map(|column| {
                let kind = match self.index_type {
                    IndexType::FullText => {
                        if default_language.is_none() {
                            default_language = column.language.clone();
                        }
                        json!("text")
                    }
                    IndexType::Hashed => json!("hashed"),
                    IndexType::Spatial2D => json!("2d"),
                    IndexType::Spatial2DSphere => json!("2dsphere"),
                    _ if column.asc => json!(1),
                    _ => json!(-1),
                };
                (column.field.clone(), kind)
            })
            .collect();

        DocumentIndexModel {
            name: self.name(),
            keys,
            unique: self.index_type.is_unique(),
            default_language,
        }
    }
}

/// The full set of indexes an entity declares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Indexes(pub Vec<IndexSpec>);

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: IndexSpec) -> Self {
        self.0.push(spec);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexSpec> {
        self.0.iter().filter(|spec| !spec.columns.is_empty())
    }

    /// Fields of the primary index, empty when none is declared
    pub fn primary(&self) -> Vec<String> {
        self.iter()
            .find(|spec| spec.index_type == IndexType::Primary)
            .map(IndexSpec::fields)
            .unwrap_or_default()
    }

    /// The single primary column
    pub fn primary_key(&self) -> Result<String> {
        let mut fields = self.primary();
        match fields.len() {
            1 => Ok(fields.remove(0)),
            0 => Err(DataError::invalid_argument("no primary key declared")),
            n => Err(DataError::invalid_argument(format!(
                "primary key is composite ({} columns)",
                n
            ))),
        }
    }

    /// Field lists of every index of the given types, keyed by index name
    pub fn list(&self, types: &[IndexType]) -> BTreeMap<String, Vec<String>> {
        self.iter()
            .filter(|spec| types.contains(&spec.index_type))
            .map(|spec| (spec.name(), spec.fields()))
            .collect()
    }

    pub fn to_document_models(&self) -> Vec<DocumentIndexModel> {
        self.iter().map(IndexSpec::to_document_model).collect()
    }
}

impl FromIterator<IndexSpec> for Indexes {
    fn from_iter<T: IntoIterator<Item = IndexSpec>>(iter: T) -> Self {
        Indexes(iter.into_iter().collect())
    }
}
