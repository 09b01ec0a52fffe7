//! Documents, chunks and search results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Component, RagoError, RagoResult};

/// String to value mapping; ordering carries no meaning
pub type Metadata = BTreeMap<String, Value>;

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// Ingested document
///
/// Immutable once ingested. Deleting a document removes every chunk that
/// names it as parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Externally assigned or generated at ingest
    #[serde(default)]
    pub id: String,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            content_type: default_content_type(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Document whose id is assigned at ingest
    pub fn anonymous(content: impl Into<String>) -> Self {
        Self::new(String::new(), content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn validate(&self) -> RagoResult<()> {
        if self.content.trim().is_empty() {
            return Err(RagoError::bad_request(format!(
                "document '{}' has empty content",
                self.id
            ))
            .at(Component::Rag, "ingest"));
        }
        Ok(())
    }
}

/// Deterministic chunk id; zero padded so lexical order matches index order
pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{}#{:05}", document_id, index)
}

/// Bounded slice of a document, individually embedded and indexed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// 0-based, dense within a document
    pub index: usize,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub vector: Vec<f32>,
    /// Character offset of the first character in the parent document
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    /// SHA-256 hex digest of `content`
    #[serde(default)]
    pub hash: String,
}

/// Metadata and id constraints applied to store queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<BTreeSet<String>>,
    /// Top-level metadata equality constraints
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self {
            document_ids: Some(BTreeSet::from([id.into()])),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.document_ids.is_none() && self.metadata.is_empty()
    }

    pub fn matches(&self, document_id: &str, metadata: &Metadata) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.contains(document_id) {
                return false;
            }
        }
        self.metadata
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Ranked search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f32,
    /// Component scores for hybrid results (normalized)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_ids_sort_by_index() {
        let mut ids: Vec<String> = [10, 2, 0].iter().map(|i| chunk_id("doc", *i)).collect();
        ids.sort();
        assert_eq!(ids, vec!["doc#00000", "doc#00002", "doc#00010"]);
    }

    #[test]
    fn test_filter_matches() {
        let mut meta = Metadata::new();
        meta.insert("lang".into(), json!("en"));

        assert!(SearchFilter::new().matches("d1", &meta));
        assert!(SearchFilter::document("d1").matches("d1", &meta));
        assert!(!SearchFilter::document("d2").matches("d1", &meta));
        assert!(SearchFilter::new().with_metadata("lang", "en").matches("d1", &meta));
        assert!(!SearchFilter::new().with_metadata("lang", "fr").matches("d1", &meta));
    }

    #[test]
    fn test_document_defaults_from_json() {
        let doc: Document = serde_json::from_value(json!({"id": "d1", "content": "x"})).unwrap();
        assert_eq!(doc.content_type, "text/plain");
        assert!(doc.metadata.is_empty());
    }

    #[test]
    fn test_empty_document_rejected() {
        let err = Document::new("d1", "  \n").validate().unwrap_err();
        assert_eq!(err.status(), "bad-request");
    }
}
