//! Output formatting for the kbgraph CLI.
//!
//! This module provides two output modes:
//! - **JSON**: Compact machine-readable output (default)
//! - **Pretty**: Human-readable formatted output (enabled via `--pretty` flag)
//!
//! JSON serializes the models directly so the shape on stdout is the shape
//! of the library types. Pretty output favors labeled fields for single
//! entities and one line per entry for lists.

use kbgraph::models::{
    Backlink, Block, KnowledgeBase, Page, Removed, Resource, SearchField, SearchResults, Stats, TreeEntry,
};
use kbgraph::KbError;
use serde::Serialize;

/// Output mode for CLI results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Compact JSON output.
    Json,
    /// Human-readable formatted output.
    Pretty,
}

/// Serialize a value to compact JSON and print to stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), KbError> {
    let json = serde_json::to_string(value).map_err(std::io::Error::from)?;
    println!("{}", json);
    Ok(())
}

/// Renders epoch milliseconds as RFC 3339 in UTC, or the raw number if it is
/// out of range.
pub fn format_millis(ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        None => ms.to_string(),
    }
}

/// Print a knowledge base in human-readable format.
///
/// Format:
/// ```text
/// 📚 Engineering
/// ID:      <uuid>
/// Desc:    Team notes
/// Created: 2024-01-15T10:00:00Z
/// Updated: 2024-01-15T10:00:00Z
/// ```
pub fn print_pretty_kb(kb: &KnowledgeBase) {
    match kb.icon {
        Some(ref icon) => println!("{} {}", icon, kb.name),
        None => println!("{}", kb.name),
    }
    println!("ID:      {}", kb.id);
    if let Some(ref desc) = kb.description {
        println!("Desc:    {}", desc);
    }
    println!("Created: {}", format_millis(kb.created_at));
    println!("Updated: {}", format_millis(kb.updated_at));
}

pub fn print_pretty_kbs(kbs: &[KnowledgeBase]) {
    if kbs.is_empty() {
        println!("(no knowledge bases)");
        return;
    }
    for kb in kbs {
        println!("{} | {}", kb.id, kb.name);
    }
}

pub fn print_pretty_page(page: &Page) {
    println!("Title:   {}", page.title);
    println!("ID:      {}", page.id);
    println!("KB:      {}", page.kb_id);
    println!("Parent:  {}", page.parent_id.as_deref().unwrap_or("(root)"));
    println!("Order:   {}", page.sort_order);
    println!("Created: {}", format_millis(page.created_at));
    println!("Updated: {}", format_millis(page.updated_at));
}

/// One page per line: `<id> | <title>`.
pub fn print_pretty_pages(pages: &[Page]) {
    if pages.is_empty() {
        println!("(no pages)");
        return;
    }
    for page in pages {
        println!("{} | {}", page.id, page.title);
    }
}

/// Indented outline of a page tree, two spaces per level.
pub fn print_pretty_page_tree(tree: &[TreeEntry<Page>]) {
    if tree.is_empty() {
        println!("(no pages)");
        return;
    }
    for entry in tree {
        println!("{}{}  [{}]", "  ".repeat(entry.depth), entry.node.title, entry.node.id);
    }
}

/// `Home / Projects / Roadmap`
pub fn print_pretty_breadcrumb(pages: &[Page]) {
    let titles: Vec<&str> = pages.iter().map(|p| p.title.as_str()).collect();
    println!("{}", titles.join(" / "));
}

pub fn print_pretty_block(block: &Block) {
    println!("ID:      {}", block.id);
    println!("Page:    {}", block.page_id);
    if let Some(ref parent) = block.parent_id {
        println!("Parent:  {}", parent);
    }
    println!("Type:    {}", block.block_type);
    println!("Order:   {}", block.order_index);
    println!("Updated: {}", format_millis(block.updated_at));
    println!();
    println!("{}", block.content);
}

pub fn print_pretty_block_tree(tree: &[TreeEntry<Block>]) {
    if tree.is_empty() {
        println!("(no blocks)");
        return;
    }
    for entry in tree {
        let indent = "  ".repeat(entry.depth);
        let first_line = entry.node.content.lines().next().unwrap_or("");
        println!("{}- [{}] {}  ({})", indent, entry.node.block_type, first_line, entry.node.id);
    }
}

pub fn print_pretty_backlinks(backlinks: &[Backlink]) {
    if backlinks.is_empty() {
        println!("(no backlinks)");
        return;
    }
    for backlink in backlinks {
        println!(
            "{} | {} | {} block(s)",
            backlink.page.id,
            backlink.page.title,
            backlink.block_ids.len()
        );
    }
}

pub fn print_pretty_search_results(results: &SearchResults) {
    if results.hits.is_empty() {
        println!("(no results)");
        return;
    }

    for (i, hit) in results.hits.iter().enumerate() {
        if i > 0 {
            println!();
        }
        let field = match hit.field {
            SearchField::Title => "title",
            SearchField::Content => "content",
        };
        println!("Page:   {} ({})", hit.page_title, hit.page_id);
        if let Some(ref block_id) = hit.block_id {
            println!("Block:  {}", block_id);
        }
        println!("Field:  {}", field);
        println!("Match:  {}", hit.excerpt);
    }

    let shown = results.offset + results.hits.len();
    println!();
    println!("Showing {}-{} of {}", results.offset + 1, shown, results.total);
}

pub fn print_pretty_resources(resources: &[Resource]) {
    if resources.is_empty() {
        println!("(no resources)");
        return;
    }
    for r in resources {
        println!("{} | {} | {} | {} bytes", r.id, r.name, r.mime_type, r.size);
    }
}

pub fn print_pretty_removed(removed: &Removed) {
    println!(
        "Removed {} knowledge base(s), {} page(s), {} block(s), {} link(s), {} resource(s)",
        removed.knowledge_bases.len(),
        removed.pages.len(),
        removed.blocks.len(),
        removed.links.len(),
        removed.resources.len()
    );
}

pub fn print_pretty_stats(stats: &Stats) {
    println!("Knowledge bases: {}", stats.knowledge_bases);
    println!("Pages:           {}", stats.pages);
    println!("Blocks:          {}", stats.blocks);
    println!("Links:           {}", stats.links);
    println!("Resources:       {}", stats.resources);
}

/// Generic output dispatcher that handles both JSON and Pretty modes.
///
/// ```ignore
/// print(mode, &page, || print_pretty_page(&page))?;
/// ```
pub fn print<T: Serialize>(mode: OutputMode, value: &T, pretty_fn: impl FnOnce()) -> Result<(), KbError> {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Pretty => {
            pretty_fn();
            Ok(())
        }
    }
}
