//! Link graph index: forward links and backlinks derived from block content.
//!
//! Links are never written directly by callers. `resync` rebuilds a page's
//! outgoing edges from the references embedded in its blocks, touching only
//! the edges that actually changed.

use crate::db::KbError;
use crate::models::{Backlink, LinkDiff, Page};
use crate::references::{extract_page_refs, references_page};
use crate::repo::{self, PAGE_COLUMNS};
use rusqlite::Connection;
use std::collections::BTreeSet;
use tracing::debug;

fn page_exists(conn: &Connection, id: &str) -> Result<bool, KbError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pages WHERE id = ?1 AND deleted = 0)",
        [id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Reconciles the outgoing links of `page_id` with the references currently
/// embedded in its blocks. References to pages that don't exist are dropped.
/// Unchanged edges keep their row and `created_at`.
pub fn resync(conn: &Connection, page_id: &str) -> Result<LinkDiff, KbError> {
    repo::get_page(conn, page_id)?;

    let mut referenced = BTreeSet::new();
    for block in repo::list_all_blocks(conn, page_id)? {
        referenced.extend(extract_page_refs(&block.content));
    }
    let mut desired = BTreeSet::new();
    for target in referenced {
        if page_exists(conn, &target)? {
            desired.insert(target);
        }
    }

    let existing: BTreeSet<String> = repo::list_outgoing_links(conn, page_id)?
        .into_iter()
        .map(|l| l.target_page_id)
        .collect();

    let diff = LinkDiff {
        added: desired.difference(&existing).cloned().collect(),
        removed: existing.difference(&desired).cloned().collect(),
    };
    for target in &diff.added {
        repo::insert_link(conn, page_id, target)?;
    }
    for target in &diff.removed {
        repo::remove_link(conn, page_id, target)?;
    }

    if !diff.is_empty() {
        debug!(page_id, added = diff.added.len(), removed = diff.removed.len(), "links resynced");
    }
    Ok(diff)
}

/// Resyncs every live page of `kb_id` whose blocks mention `target_id`.
/// Used when a page is created with an id that content may already
/// reference. Returns the non-empty diffs by source page.
pub fn resync_referrers(conn: &Connection, target_id: &str, kb_id: &str) -> Result<Vec<(String, LinkDiff)>, KbError> {
    let mut diffs = Vec::new();
    for (source, source_kb) in repo::pages_mentioning(conn, target_id)? {
        if source_kb != kb_id {
            continue;
        }
        let diff = resync(conn, &source)?;
        if !diff.is_empty() {
            diffs.push((source, diff));
        }
    }
    Ok(diffs)
}

/// Pages referenced from `page_id`, by title.
pub fn forward_links(conn: &Connection, page_id: &str) -> Result<Vec<Page>, KbError> {
    repo::get_page(conn, page_id)?;
    let columns = PAGE_COLUMNS
        .split(", ")
        .map(|c| format!("p.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {columns} FROM links l
         JOIN pages p ON p.id = l.target_page_id
         WHERE l.source_page_id = ?1 AND p.deleted = 0
         ORDER BY p.title, p.id"
    ))?;
    let pages = stmt
        .query_map([page_id], repo::row_to_page)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}

/// Pages linking to `page_id`, each with the ids of the blocks that carry
/// the reference.
pub fn backlinks(conn: &Connection, page_id: &str) -> Result<Vec<Backlink>, KbError> {
    repo::get_page(conn, page_id)?;

    let mut out = Vec::new();
    for link in repo::list_incoming_links(conn, page_id)? {
        let page = repo::get_page(conn, &link.source_page_id)?;
        let block_ids = repo::list_all_blocks(conn, &page.id)?
            .into_iter()
            .filter(|b| references_page(&b.content, page_id))
            .map(|b| b.id)
            .collect();
        out.push(Backlink { page, block_ids });
    }
    out.sort_by(|a, b| a.page.title.cmp(&b.page.title).then_with(|| a.page.id.cmp(&b.page.id)));
    Ok(out)
}
