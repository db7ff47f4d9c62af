//! Core data structures for the knowledge document model.
//!
//! These structs are the shared language between the repository layer (SQL),
//! the store facade, the CLI layer (clap), and the output layer (serde_json).
//! They are plain data with no business logic.

use serde::Serialize;
use std::collections::BTreeSet;

/// Top-level container for a forest of pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A titled document node in a knowledge base's outline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub id: String,
    pub kb_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub sort_order: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A unit of content within a page, orderable and nestable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: String,
    pub page_id: String,
    pub parent_id: Option<String>,
    pub block_type: BlockType,
    /// Opaque editor text. May embed `[[page:<id>]]` references.
    pub content: String,
    /// Structured payload the editor attaches to the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub order_index: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockType {
    Paragraph,
    Heading,
    List,
    Code,
    Image,
    Quote,
    Divider,
}

impl BlockType {
    pub const ALL: [BlockType; 7] = [
        Self::Paragraph,
        Self::Heading,
        Self::List,
        Self::Code,
        Self::Image,
        Self::Quote,
        Self::Divider,
    ];

    /// Parse from a stored or CLI string. Returns None for unrecognized types.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "paragraph" => Some(Self::Paragraph),
            "heading" => Some(Self::Heading),
            "list" => Some(Self::List),
            "code" => Some(Self::Code),
            "image" => Some(Self::Image),
            "quote" => Some(Self::Quote),
            "divider" => Some(Self::Divider),
            _ => None,
        }
    }

    /// The string stored in SQLite and displayed in output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Heading => "heading",
            Self::List => "list",
            Self::Code => "code",
            Self::Image => "image",
            Self::Quote => "quote",
            Self::Divider => "divider",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A derived directed edge: the source page's content references the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub id: String,
    pub source_page_id: String,
    pub target_page_id: String,
    pub created_at: i64,
}

/// A file attached to a knowledge base and referenced from block content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub id: String,
    pub knowledge_base_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub file_path: String,
    pub created_at: i64,
}

// =============================================================================
// Creation inputs
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct NewKnowledgeBase {
    pub id: Option<String>,
    pub name: String,
    pub icon: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewPage {
    /// Caller-supplied id; generated when absent.
    pub id: Option<String>,
    pub kb_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    /// Explicit sibling key; appended after the last sibling when absent.
    pub sort_order: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewBlock {
    pub id: Option<String>,
    pub page_id: String,
    pub parent_id: Option<String>,
    pub block_type: BlockType,
    pub content: String,
    pub data: Option<serde_json::Value>,
    pub order_index: Option<i64>,
}

impl NewBlock {
    pub fn new(page_id: impl Into<String>, block_type: BlockType, content: impl Into<String>) -> Self {
        Self {
            id: None,
            page_id: page_id.into(),
            parent_id: None,
            block_type,
            content: content.into(),
            data: None,
            order_index: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewResource {
    pub id: Option<String>,
    pub knowledge_base_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub file_path: String,
}

// =============================================================================
// Partial updates
// =============================================================================

/// Fields left as `None` are unchanged. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBasePatch {
    pub name: Option<String>,
    pub icon: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct PagePatch {
    pub title: Option<String>,
    /// Reparent (`Some(None)` moves to the root).
    pub parent_id: Option<Option<String>>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockPatch {
    pub block_type: Option<BlockType>,
    pub content: Option<String>,
    pub data: Option<Option<serde_json::Value>>,
    pub parent_id: Option<Option<String>>,
    pub order_index: Option<i64>,
}

// =============================================================================
// Hierarchy and graph views
// =============================================================================

/// What happens to a deleted page's descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Delete every descendant page and its blocks.
    Cascade,
    /// Re-parent immediate children to the deleted page's former parent, in
    /// the deleted page's position, preserving their relative order.
    Promote,
}

impl DeletePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cascade" => Some(Self::Cascade),
            "promote" => Some(Self::Promote),
            _ => None,
        }
    }
}

/// Ids actually removed by a delete operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Removed {
    pub knowledge_bases: Vec<String>,
    pub pages: Vec<String>,
    pub blocks: Vec<String>,
    /// `(source_page_id, target_page_id)` pairs.
    pub links: Vec<(String, String)>,
    pub resources: Vec<String>,
}

/// A sibling group addressed by its owner and parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiblingGroup {
    Pages { kb_id: String, parent_id: Option<String> },
    Blocks { page_id: String, parent_id: Option<String> },
}

/// A page with its depth in the outline (roots are depth 0).
#[derive(Debug, Clone, Serialize)]
pub struct TreeEntry<T> {
    pub depth: usize,
    #[serde(flatten)]
    pub node: T,
}

/// A page that links to the queried page, with the blocks that carry the
/// reference (for previews).
#[derive(Debug, Clone, Serialize)]
pub struct Backlink {
    pub page: Page,
    pub block_ids: Vec<String>,
}

/// Edges added and removed by one `resync`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl LinkDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Row counts of live entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub knowledge_bases: i64,
    pub pages: i64,
    pub blocks: i64,
    pub links: i64,
    pub resources: i64,
}

// =============================================================================
// Search
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchField {
    Title,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchOrder {
    /// Title matches before content matches, then most recently updated.
    Relevance,
    UpdatedAt,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Restrict to this page and its descendants.
    pub scope: Option<String>,
    pub search_in: BTreeSet<SearchField>,
    pub limit: usize,
    pub offset: usize,
    pub order_by: SearchOrder,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            scope: None,
            search_in: [SearchField::Title, SearchField::Content].into_iter().collect(),
            limit: 20,
            offset: 0,
            order_by: SearchOrder::Relevance,
        }
    }
}

/// One match: a page title or a block's content.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub field: SearchField,
    pub page_id: String,
    pub page_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// The matched text in context.
    pub excerpt: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Matches across all pages of results.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
