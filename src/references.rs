//! Extraction of inter-page references from block content.
//!
//! The editor encodes a page reference as `[[page:<id>]]` or
//! `[[page:<id>|display text]]`. References are addressed by id, never by
//! display text, so renaming a page never breaks a link.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static PAGE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[page:([A-Za-z0-9_-]+)(?:\|[^\]]*)?\]\]").expect("page reference pattern")
});

/// Returns the distinct page ids referenced in `content`.
pub fn extract_page_refs(content: &str) -> BTreeSet<String> {
    PAGE_REF
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// True when `content` references `page_id`.
pub fn references_page(content: &str, page_id: &str) -> bool {
    PAGE_REF
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .any(|m| m.as_str() == page_id)
}

/// Renders the reference token for a page.
pub fn page_ref(page_id: &str) -> String {
    format!("[[page:{page_id}]]")
}
