//! Repository layer: all SQL for entity CRUD.
//!
//! This module provides plain functions that execute SQL statements using
//! `rusqlite::Connection`. Each function takes a database connection (usually
//! a transaction opened by the store) as its first parameter and returns a
//! `Result<T, KbError>`.
//!
//! Deleted pages, blocks, and knowledge bases are tombstoned (`deleted = 1`)
//! and purged later in batches. Every read here filters tombstones, so a
//! tombstoned row is indistinguishable from a missing one.

use crate::db::{not_found, KbError};
use crate::hierarchy;
use crate::ids::{new_id, now_millis};
use crate::models::{
    Block, BlockPatch, BlockType, KnowledgeBase, KnowledgeBasePatch, Link, NewBlock,
    NewKnowledgeBase, NewPage, NewResource, Page, Removed, Resource, SiblingGroup, Stats,
};
use crate::validation;
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) const KB_COLUMNS: &str = "id, name, icon, description, created_at, updated_at";
pub(crate) const PAGE_COLUMNS: &str = "id, kb_id, parent_id, title, sort_order, created_at, updated_at";
pub(crate) const BLOCK_COLUMNS: &str =
    "id, page_id, parent_id, block_type, content, data, order_index, created_at, updated_at";
const RESOURCE_COLUMNS: &str =
    "id, knowledge_base_id, name, mime_type, size, file_path, created_at";

const DEFAULT_KB_ICON: &str = "📚";

/// Escapes `%`, `_` and `\` so user text matches literally in
/// `LIKE ... ESCAPE '\'`, and wraps it for substring matching.
pub(crate) fn contains_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn row_to_kb(row: &rusqlite::Row) -> Result<KnowledgeBase, rusqlite::Error> {
    Ok(KnowledgeBase {
        id: row.get(0)?,
        name: row.get(1)?,
        icon: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Map a rusqlite Row to a Page struct.
/// Expects columns in `PAGE_COLUMNS` order.
pub(crate) fn row_to_page(row: &rusqlite::Row) -> Result<Page, rusqlite::Error> {
    Ok(Page {
        id: row.get(0)?,
        kb_id: row.get(1)?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        sort_order: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Map a rusqlite Row to a Block struct.
/// Expects columns in `BLOCK_COLUMNS` order.
pub(crate) fn row_to_block(row: &rusqlite::Row) -> Result<Block, rusqlite::Error> {
    let type_str: String = row.get(3)?;
    let block_type = BlockType::from_str(&type_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(3, "block_type".to_string(), rusqlite::types::Type::Text)
    })?;
    let data_str: Option<String> = row.get(5)?;
    let data = data_str.and_then(|s| serde_json::from_str(&s).ok());
    Ok(Block {
        id: row.get(0)?,
        page_id: row.get(1)?,
        parent_id: row.get(2)?,
        block_type,
        content: row.get(4)?,
        data,
        order_index: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_resource(row: &rusqlite::Row) -> Result<Resource, rusqlite::Error> {
    Ok(Resource {
        id: row.get(0)?,
        knowledge_base_id: row.get(1)?,
        name: row.get(2)?,
        mime_type: row.get(3)?,
        size: row.get(4)?,
        file_path: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_link(row: &rusqlite::Row) -> Result<Link, rusqlite::Error> {
    Ok(Link {
        id: row.get(0)?,
        source_page_id: row.get(1)?,
        target_page_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn data_to_json(data: Option<&serde_json::Value>) -> Result<Option<String>, KbError> {
    data.map(serde_json::to_string)
        .transpose()
        .map_err(|e| KbError::Validation(format!("Block data is not serializable: {}", e)))
}

/// Resolves the id for a new row: validates a caller-supplied one against
/// every row of the table (tombstones included), or generates one.
fn assign_id(conn: &Connection, table: &str, requested: Option<&str>) -> Result<String, KbError> {
    let Some(id) = requested else {
        return Ok(new_id());
    };
    validation::validate_id(id)?;
    let taken: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        [id],
        |row| row.get(0),
    )?;
    if taken {
        return Err(KbError::Validation(format!("Id '{}' is already in use", id)));
    }
    Ok(id.to_string())
}

/// Resolves an owner named by a create. A missing owner is bad input to the
/// create, so `NotFound` becomes `Validation`.
fn existing_owner<T>(found: Result<T, KbError>, what: impl FnOnce() -> String) -> Result<T, KbError> {
    match found {
        Err(KbError::NotFound(_)) => Err(KbError::Validation(format!("{} does not exist", what()))),
        other => other,
    }
}

// =============================================================================
// Knowledge bases
// =============================================================================

/// Creates a knowledge base. The icon defaults to a book when not given.
pub fn create_knowledge_base(conn: &Connection, new: &NewKnowledgeBase) -> Result<KnowledgeBase, KbError> {
    validation::validate_name(&new.name)?;
    if let Some(ref d) = new.description {
        validation::validate_description(d)?;
    }
    let id = assign_id(conn, "knowledge_bases", new.id.as_deref())?;
    let now = now_millis();
    let icon = new.icon.clone().or_else(|| Some(DEFAULT_KB_ICON.to_string()));

    conn.execute(
        "INSERT INTO knowledge_bases (id, name, icon, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, new.name, icon, new.description, now, now],
    )?;

    Ok(KnowledgeBase {
        id,
        name: new.name.clone(),
        icon,
        description: new.description.clone(),
        created_at: now,
        updated_at: now,
    })
}

/// Retrieves a live knowledge base.
///
/// # Errors
/// Returns `KbError::NotFound` if no live knowledge base has the id.
pub fn get_knowledge_base(conn: &Connection, id: &str) -> Result<KnowledgeBase, KbError> {
    conn.query_row(
        &format!("SELECT {KB_COLUMNS} FROM knowledge_bases WHERE id = ?1 AND deleted = 0"),
        [id],
        row_to_kb,
    )
    .map_err(|e| not_found(e, || format!("Knowledge base '{}' not found", id)))
}

/// Lists all knowledge bases, newest first.
pub fn list_knowledge_bases(conn: &Connection) -> Result<Vec<KnowledgeBase>, KbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {KB_COLUMNS} FROM knowledge_bases WHERE deleted = 0 ORDER BY created_at DESC"
    ))?;
    let kbs = stmt
        .query_map([], row_to_kb)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(kbs)
}

/// Case-insensitive substring match over knowledge base names and descriptions,
/// most recently updated first. An empty query matches nothing.
pub fn search_knowledge_bases(conn: &Connection, query: &str) -> Result<Vec<KnowledgeBase>, KbError> {
    if query.trim().is_empty() {
        return Ok(vec![]);
    }
    let pattern = contains_pattern(query);
    let mut stmt = conn.prepare(&format!(
        "SELECT {KB_COLUMNS} FROM knowledge_bases
         WHERE deleted = 0
           AND (name LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\')
         ORDER BY updated_at DESC"
    ))?;
    let kbs = stmt
        .query_map([pattern], row_to_kb)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(kbs)
}

/// Merges the given fields into a knowledge base and bumps `updated_at`.
/// A patch that changes nothing leaves the row untouched.
pub fn update_knowledge_base(
    conn: &Connection,
    id: &str,
    patch: &KnowledgeBasePatch,
) -> Result<KnowledgeBase, KbError> {
    let current = get_knowledge_base(conn, id)?;
    if let Some(ref n) = patch.name {
        validation::validate_name(n)?;
    }
    if let Some(Some(ref d)) = patch.description {
        validation::validate_description(d)?;
    }

    let name = patch.name.clone().unwrap_or_else(|| current.name.clone());
    let icon = patch.icon.clone().unwrap_or_else(|| current.icon.clone());
    let description = patch.description.clone().unwrap_or_else(|| current.description.clone());

    if name == current.name && icon == current.icon && description == current.description {
        return Ok(current);
    }

    let now = now_millis();
    conn.execute(
        "UPDATE knowledge_bases SET name = ?1, icon = ?2, description = ?3, updated_at = ?4 WHERE id = ?5",
        params![name, icon, description, now, id],
    )?;

    Ok(KnowledgeBase {
        name,
        icon,
        description,
        updated_at: now,
        ..current
    })
}

/// Tombstones a knowledge base with all its pages and blocks, and removes
/// every link touching those pages and every resource it owns.
pub fn tombstone_knowledge_base(conn: &Connection, id: &str) -> Result<Removed, KbError> {
    get_knowledge_base(conn, id)?;

    let page_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM pages WHERE kb_id = ?1 AND deleted = 0")?;
        let ids = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        ids
    };

    let mut removed = tombstone_pages(conn, &page_ids)?;

    let resource_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM resources WHERE knowledge_base_id = ?1")?;
        let ids = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        ids
    };
    conn.execute("DELETE FROM resources WHERE knowledge_base_id = ?1", [id])?;
    removed.resources = resource_ids;

    conn.execute(
        "UPDATE knowledge_bases SET deleted = 1, updated_at = ?1 WHERE id = ?2",
        params![now_millis(), id],
    )?;
    removed.knowledge_bases.push(id.to_string());

    Ok(removed)
}

// =============================================================================
// Pages
// =============================================================================

/// Creates a page. The parent, if given, must be a live page of the same
/// knowledge base. Without an explicit `sort_order` the page is appended
/// after its last sibling.
///
/// # Errors
/// Returns `KbError::Validation` for missing fields, a knowledge base or
/// parent that doesn't exist, a parent in another knowledge base, a taken
/// id, or a taken sibling key.
pub fn create_page(conn: &Connection, new: &NewPage) -> Result<Page, KbError> {
    validation::require("kb_id", &new.kb_id)?;
    validation::validate_title(&new.title)?;
    existing_owner(get_knowledge_base(conn, &new.kb_id), || {
        format!("Knowledge base '{}'", new.kb_id)
    })?;

    if let Some(ref parent_id) = new.parent_id {
        let parent = existing_owner(get_page(conn, parent_id), || format!("Parent page '{}'", parent_id))?;
        if parent.kb_id != new.kb_id {
            return Err(KbError::Validation(format!(
                "Parent page '{}' belongs to a different knowledge base",
                parent_id
            )));
        }
    }

    let id = assign_id(conn, "pages", new.id.as_deref())?;
    let group = SiblingGroup::Pages {
        kb_id: new.kb_id.clone(),
        parent_id: new.parent_id.clone(),
    };
    let sort_order = match new.sort_order {
        Some(key) => {
            hierarchy::ensure_key_free(conn, &group, key, None)?;
            key
        }
        None => hierarchy::append_key(conn, &group)?,
    };
    let now = now_millis();

    conn.execute(
        "INSERT INTO pages (id, kb_id, parent_id, title, sort_order, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, new.kb_id, new.parent_id, new.title, sort_order, now, now],
    )?;

    Ok(Page {
        id,
        kb_id: new.kb_id.clone(),
        parent_id: new.parent_id.clone(),
        title: new.title.clone(),
        sort_order,
        created_at: now,
        updated_at: now,
    })
}

/// Retrieves a live page by its ID.
///
/// # Errors
/// Returns `KbError::NotFound` if no live page with the given ID exists.
pub fn get_page(conn: &Connection, id: &str) -> Result<Page, KbError> {
    conn.query_row(
        &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1 AND deleted = 0"),
        [id],
        row_to_page,
    )
    .map_err(|e| not_found(e, || format!("Page with ID '{}' not found", id)))
}

/// Lists the pages of one sibling group, ordered by `sort_order`.
pub fn list_pages(conn: &Connection, kb_id: &str, parent_id: Option<&str>) -> Result<Vec<Page>, KbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAGE_COLUMNS} FROM pages
         WHERE kb_id = ?1 AND parent_id IS ?2 AND deleted = 0
         ORDER BY sort_order"
    ))?;
    let pages = stmt
        .query_map(params![kb_id, parent_id], row_to_page)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}

/// Lists every live page of a knowledge base, ordered by `sort_order`.
pub fn list_all_pages(conn: &Connection, kb_id: &str) -> Result<Vec<Page>, KbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAGE_COLUMNS} FROM pages WHERE kb_id = ?1 AND deleted = 0 ORDER BY sort_order"
    ))?;
    let pages = stmt
        .query_map([kb_id], row_to_page)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}

/// The `limit` most recently updated live pages, newest first. `kb_id`
/// narrows the listing to one knowledge base; `None` spans all of them.
pub fn recent_pages(conn: &Connection, kb_id: Option<&str>, limit: usize) -> Result<Vec<Page>, KbError> {
    if let Some(kb_id) = kb_id {
        get_knowledge_base(conn, kb_id)?;
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAGE_COLUMNS} FROM pages
         WHERE deleted = 0 AND (?1 IS NULL OR kb_id = ?1)
         ORDER BY updated_at DESC, id
         LIMIT ?2"
    ))?;
    let pages = stmt
        .query_map(params![kb_id, limit as i64], row_to_page)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}

/// Ids of `root` and all its live descendant pages, root first.
pub fn subtree_page_ids(conn: &Connection, root: &str) -> Result<Vec<String>, KbError> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE subtree(id, depth) AS (
             SELECT id, 0 FROM pages WHERE id = ?1 AND deleted = 0
             UNION ALL
             SELECT p.id, s.depth + 1 FROM pages p
             JOIN subtree s ON p.parent_id = s.id
             WHERE p.deleted = 0
         )
         SELECT id FROM subtree ORDER BY depth",
    )?;
    let ids = stmt
        .query_map([root], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Renames a page. A title equal to the current one is a no-op.
pub fn rename_page(conn: &Connection, id: &str, title: &str) -> Result<Page, KbError> {
    validation::validate_title(title)?;
    let page = get_page(conn, id)?;
    if page.title == title {
        return Ok(page);
    }
    let now = now_millis();
    conn.execute(
        "UPDATE pages SET title = ?1, updated_at = ?2 WHERE id = ?3",
        params![title, now, id],
    )?;
    Ok(Page {
        title: title.to_string(),
        updated_at: now,
        ..page
    })
}

/// Writes a page's position without any validation. Callers in `hierarchy`
/// check tree invariants first.
pub(crate) fn set_page_position(
    conn: &Connection,
    id: &str,
    parent_id: Option<&str>,
    sort_order: i64,
) -> Result<(), KbError> {
    conn.execute(
        "UPDATE pages SET parent_id = ?1, sort_order = ?2, updated_at = ?3 WHERE id = ?4",
        params![parent_id, sort_order, now_millis(), id],
    )?;
    Ok(())
}

/// Tombstones the given pages and their blocks, and deletes every link where
/// one of them is source or target.
pub fn tombstone_pages(conn: &Connection, page_ids: &[String]) -> Result<Removed, KbError> {
    let mut removed = Removed::default();
    if page_ids.is_empty() {
        return Ok(removed);
    }
    let now = now_millis();

    let mut links_stmt = conn.prepare(
        "SELECT source_page_id, target_page_id FROM links
         WHERE source_page_id = ?1 OR target_page_id = ?1",
    )?;
    let mut blocks_stmt = conn.prepare("SELECT id FROM blocks WHERE page_id = ?1 AND deleted = 0")?;

    for page_id in page_ids {
        // Each page's links are deleted before the next page is visited, so
        // an edge between two doomed pages is reported once.
        for pair in links_stmt.query_map([page_id], |row| Ok((row.get(0)?, row.get(1)?)))? {
            removed.links.push(pair?);
        }
        for block_id in blocks_stmt.query_map([page_id], |row| row.get::<_, String>(0))? {
            removed.blocks.push(block_id?);
        }

        conn.execute(
            "DELETE FROM links WHERE source_page_id = ?1 OR target_page_id = ?1",
            [page_id],
        )?;
        conn.execute(
            "UPDATE blocks SET deleted = 1, updated_at = ?1 WHERE page_id = ?2 AND deleted = 0",
            params![now, page_id],
        )?;
        conn.execute(
            "UPDATE pages SET deleted = 1, updated_at = ?1 WHERE id = ?2",
            params![now, page_id],
        )?;
        removed.pages.push(page_id.clone());
    }

    Ok(removed)
}

/// Walks `page_id`'s parent chain (excluding itself), nearest ancestor first.
///
/// The walk is bounded by the number of pages in the knowledge base, so a
/// corrupted chain fails with a validation error instead of looping.
pub fn page_ancestors(conn: &Connection, page_id: &str) -> Result<Vec<Page>, KbError> {
    let page = get_page(conn, page_id)?;
    let bound: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pages WHERE kb_id = ?1 AND deleted = 0",
        [&page.kb_id],
        |row| row.get(0),
    )?;

    let mut ancestors = Vec::new();
    let mut next = page.parent_id.clone();
    while let Some(id) = next {
        if ancestors.len() as i64 >= bound || id == page.id {
            return Err(KbError::Validation(format!(
                "Parent chain of page '{}' contains a cycle",
                page_id
            )));
        }
        let parent = get_page(conn, &id)?;
        next = parent.parent_id.clone();
        ancestors.push(parent);
    }
    Ok(ancestors)
}

// =============================================================================
// Blocks
// =============================================================================

/// Creates a block on a live page. A parent block must live on the same page.
pub fn create_block(conn: &Connection, new: &NewBlock) -> Result<Block, KbError> {
    validation::require("page_id", &new.page_id)?;
    validation::validate_content(&new.content)?;
    existing_owner(get_page(conn, &new.page_id), || format!("Page '{}'", new.page_id))?;

    if let Some(ref parent_id) = new.parent_id {
        let parent = existing_owner(get_block(conn, parent_id), || format!("Parent block '{}'", parent_id))?;
        if parent.page_id != new.page_id {
            return Err(KbError::Validation(format!(
                "Parent block '{}' is on a different page",
                parent_id
            )));
        }
    }

    let id = assign_id(conn, "blocks", new.id.as_deref())?;
    let group = SiblingGroup::Blocks {
        page_id: new.page_id.clone(),
        parent_id: new.parent_id.clone(),
    };
    let order_index = match new.order_index {
        Some(key) => {
            hierarchy::ensure_key_free(conn, &group, key, None)?;
            key
        }
        None => hierarchy::append_key(conn, &group)?,
    };
    let data_json = data_to_json(new.data.as_ref())?;
    let now = now_millis();

    conn.execute(
        "INSERT INTO blocks (id, page_id, parent_id, block_type, content, data, order_index, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            new.page_id,
            new.parent_id,
            new.block_type.as_str(),
            new.content,
            data_json,
            order_index,
            now,
            now,
        ],
    )?;

    Ok(Block {
        id,
        page_id: new.page_id.clone(),
        parent_id: new.parent_id.clone(),
        block_type: new.block_type,
        content: new.content.clone(),
        data: new.data.clone(),
        order_index,
        created_at: now,
        updated_at: now,
    })
}

/// Retrieves a live block by its ID.
pub fn get_block(conn: &Connection, id: &str) -> Result<Block, KbError> {
    conn.query_row(
        &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = ?1 AND deleted = 0"),
        [id],
        row_to_block,
    )
    .map_err(|e| not_found(e, || format!("Block with ID '{}' not found", id)))
}

/// Lists one sibling group of blocks, ordered by `order_index`.
pub fn list_blocks(conn: &Connection, page_id: &str, parent_id: Option<&str>) -> Result<Vec<Block>, KbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BLOCK_COLUMNS} FROM blocks
         WHERE page_id = ?1 AND parent_id IS ?2 AND deleted = 0
         ORDER BY order_index"
    ))?;
    let blocks = stmt
        .query_map(params![page_id, parent_id], row_to_block)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(blocks)
}

/// Lists every live block on a page, ordered by `order_index`.
pub fn list_all_blocks(conn: &Connection, page_id: &str) -> Result<Vec<Block>, KbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BLOCK_COLUMNS} FROM blocks WHERE page_id = ?1 AND deleted = 0 ORDER BY order_index"
    ))?;
    let blocks = stmt
        .query_map([page_id], row_to_block)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(blocks)
}

/// Outcome of a block update.
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    pub block: Block,
    /// `content` changed, so the page's links need a resync.
    pub content_changed: bool,
    /// Parent or order changed.
    pub moved: bool,
}

/// Merges the given fields into a block and bumps `updated_at` when anything
/// changed. Reparenting and reordering go through the hierarchy checks.
pub fn update_block(conn: &Connection, id: &str, patch: &BlockPatch) -> Result<BlockUpdate, KbError> {
    let current = get_block(conn, id)?;
    if let Some(ref c) = patch.content {
        validation::validate_content(c)?;
    }

    let block_type = patch.block_type.unwrap_or(current.block_type);
    let content = patch.content.clone().unwrap_or_else(|| current.content.clone());
    let data = patch.data.clone().unwrap_or_else(|| current.data.clone());
    let content_changed = content != current.content;
    let fields_changed = content_changed || block_type != current.block_type || data != current.data;

    let parent_id = patch.parent_id.clone().unwrap_or_else(|| current.parent_id.clone());
    let position_changed =
        parent_id != current.parent_id || patch.order_index.is_some_and(|k| k != current.order_index);

    if position_changed {
        let order_index =
            hierarchy::validate_block_position(conn, &current, parent_id.as_deref(), patch.order_index)?;
        conn.execute(
            "UPDATE blocks SET parent_id = ?1, order_index = ?2 WHERE id = ?3",
            params![parent_id, order_index, id],
        )?;
    }

    if !fields_changed && !position_changed {
        return Ok(BlockUpdate {
            block: current,
            content_changed: false,
            moved: false,
        });
    }

    let now = now_millis();
    let data_json = data_to_json(data.as_ref())?;
    conn.execute(
        "UPDATE blocks SET block_type = ?1, content = ?2, data = ?3, updated_at = ?4 WHERE id = ?5",
        params![block_type.as_str(), content, data_json, now, id],
    )?;

    Ok(BlockUpdate {
        block: get_block(conn, id)?,
        content_changed,
        moved: position_changed,
    })
}

/// Writes a block's position without validation.
pub(crate) fn set_block_position(
    conn: &Connection,
    id: &str,
    parent_id: Option<&str>,
    order_index: i64,
) -> Result<(), KbError> {
    conn.execute(
        "UPDATE blocks SET parent_id = ?1, order_index = ?2, updated_at = ?3 WHERE id = ?4",
        params![parent_id, order_index, now_millis(), id],
    )?;
    Ok(())
}

/// Deletes a block and its nested blocks.
pub fn delete_block(conn: &Connection, id: &str) -> Result<Removed, KbError> {
    get_block(conn, id)?;
    let mut stmt = conn.prepare(
        "WITH RECURSIVE subtree(id) AS (
             SELECT id FROM blocks WHERE id = ?1 AND deleted = 0
             UNION ALL
             SELECT b.id FROM blocks b JOIN subtree s ON b.parent_id = s.id WHERE b.deleted = 0
         )
         SELECT id FROM subtree",
    )?;
    let ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    for block_id in &ids {
        conn.execute("DELETE FROM blocks WHERE id = ?1", [block_id])?;
    }

    Ok(Removed {
        blocks: ids,
        ..Removed::default()
    })
}

/// Live pages with a block whose content mentions `page_id` in a reference
/// marker, as `(page_id, kb_id)`. A textual prefilter; callers re-parse the
/// content.
pub fn pages_mentioning(conn: &Connection, page_id: &str) -> Result<Vec<(String, String)>, KbError> {
    let pattern = contains_pattern(&format!("[[page:{}", page_id));
    let mut stmt = conn.prepare(
        "SELECT DISTINCT b.page_id, p.kb_id FROM blocks b
         JOIN pages p ON p.id = b.page_id
         WHERE b.deleted = 0 AND p.deleted = 0 AND b.content LIKE ?1 ESCAPE '\\'
         ORDER BY p.kb_id, b.page_id",
    )?;
    let pages = stmt
        .query_map([pattern], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}

// =============================================================================
// Links
// =============================================================================

/// Retrieves a link by its ID.
pub fn get_link(conn: &Connection, id: &str) -> Result<Link, KbError> {
    conn.query_row(
        "SELECT id, source_page_id, target_page_id, created_at FROM links WHERE id = ?1",
        [id],
        row_to_link,
    )
    .map_err(|e| not_found(e, || format!("Link with ID '{}' not found", id)))
}

/// Lists the links whose source is `page_id`.
pub fn list_outgoing_links(conn: &Connection, page_id: &str) -> Result<Vec<Link>, KbError> {
    let mut stmt = conn.prepare(
        "SELECT id, source_page_id, target_page_id, created_at FROM links
         WHERE source_page_id = ?1 ORDER BY created_at, target_page_id",
    )?;
    let links = stmt
        .query_map([page_id], row_to_link)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

/// Lists the links whose target is `page_id`.
pub fn list_incoming_links(conn: &Connection, page_id: &str) -> Result<Vec<Link>, KbError> {
    let mut stmt = conn.prepare(
        "SELECT id, source_page_id, target_page_id, created_at FROM links
         WHERE target_page_id = ?1 ORDER BY created_at, source_page_id",
    )?;
    let links = stmt
        .query_map([page_id], row_to_link)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

/// Inserts an edge. The pair must not already exist.
pub(crate) fn insert_link(conn: &Connection, source: &str, target: &str) -> Result<Link, KbError> {
    let link = Link {
        id: new_id(),
        source_page_id: source.to_string(),
        target_page_id: target.to_string(),
        created_at: now_millis(),
    };
    conn.execute(
        "INSERT INTO links (id, source_page_id, target_page_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![link.id, link.source_page_id, link.target_page_id, link.created_at],
    )?;
    Ok(link)
}

pub(crate) fn remove_link(conn: &Connection, source: &str, target: &str) -> Result<bool, KbError> {
    let rows = conn.execute(
        "DELETE FROM links WHERE source_page_id = ?1 AND target_page_id = ?2",
        params![source, target],
    )?;
    Ok(rows > 0)
}

// =============================================================================
// Resources
// =============================================================================

pub fn create_resource(conn: &Connection, new: &NewResource) -> Result<Resource, KbError> {
    validation::require("knowledge_base_id", &new.knowledge_base_id)?;
    validation::require("name", &new.name)?;
    validation::require("mime_type", &new.mime_type)?;
    validation::require("file_path", &new.file_path)?;
    if new.size < 0 {
        return Err(KbError::Validation("Resource size must not be negative".to_string()));
    }
    existing_owner(get_knowledge_base(conn, &new.knowledge_base_id), || {
        format!("Knowledge base '{}'", new.knowledge_base_id)
    })?;

    let id = assign_id(conn, "resources", new.id.as_deref())?;
    let now = now_millis();
    conn.execute(
        "INSERT INTO resources (id, knowledge_base_id, name, mime_type, size, file_path, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, new.knowledge_base_id, new.name, new.mime_type, new.size, new.file_path, now],
    )?;

    Ok(Resource {
        id,
        knowledge_base_id: new.knowledge_base_id.clone(),
        name: new.name.clone(),
        mime_type: new.mime_type.clone(),
        size: new.size,
        file_path: new.file_path.clone(),
        created_at: now,
    })
}

pub fn get_resource(conn: &Connection, id: &str) -> Result<Resource, KbError> {
    conn.query_row(
        &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = ?1"),
        [id],
        row_to_resource,
    )
    .map_err(|e| not_found(e, || format!("Resource with ID '{}' not found", id)))
}

pub fn list_resources(conn: &Connection, kb_id: &str) -> Result<Vec<Resource>, KbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources WHERE knowledge_base_id = ?1 ORDER BY created_at"
    ))?;
    let resources = stmt
        .query_map([kb_id], row_to_resource)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(resources)
}

pub fn delete_resource(conn: &Connection, id: &str) -> Result<Removed, KbError> {
    let rows = conn.execute("DELETE FROM resources WHERE id = ?1", [id])?;
    if rows == 0 {
        return Err(KbError::NotFound(format!("Resource with ID '{}' not found", id)));
    }
    Ok(Removed {
        resources: vec![id.to_string()],
        ..Removed::default()
    })
}

// =============================================================================
// Maintenance
// =============================================================================

/// Physically removes up to `batch` tombstoned rows of one knowledge base:
/// blocks first, then pages, then the knowledge base itself once its pages
/// are gone. Returns the number of rows removed; zero means nothing is left.
pub fn purge_tombstones(conn: &Connection, kb_id: &str, batch: usize) -> Result<usize, KbError> {
    let limit = batch as i64;

    let blocks = conn.execute(
        "DELETE FROM blocks WHERE rowid IN (
             SELECT b.rowid FROM blocks b JOIN pages p ON p.id = b.page_id
             WHERE b.deleted = 1 AND p.kb_id = ?1 LIMIT ?2
         )",
        params![kb_id, limit],
    )?;
    if blocks > 0 {
        return Ok(blocks);
    }

    let pages = conn.execute(
        "DELETE FROM pages WHERE rowid IN (
             SELECT rowid FROM pages WHERE deleted = 1 AND kb_id = ?1 LIMIT ?2
         )",
        params![kb_id, limit],
    )?;
    if pages > 0 {
        return Ok(pages);
    }

    let kbs = conn.execute(
        "DELETE FROM knowledge_bases WHERE id = ?1 AND deleted = 1
           AND NOT EXISTS (SELECT 1 FROM pages WHERE pages.kb_id = ?1)",
        [kb_id],
    )?;
    Ok(kbs)
}

/// Knowledge base that owns a live page.
pub fn kb_of_page(conn: &Connection, page_id: &str) -> Result<String, KbError> {
    conn.query_row(
        "SELECT kb_id FROM pages WHERE id = ?1 AND deleted = 0",
        [page_id],
        |row| row.get(0),
    )
    .map_err(|e| not_found(e, || format!("Page with ID '{}' not found", page_id)))
}

/// Knowledge base and page that own a live block.
pub fn owner_of_block(conn: &Connection, block_id: &str) -> Result<(String, String), KbError> {
    conn.query_row(
        "SELECT p.kb_id, b.page_id FROM blocks b JOIN pages p ON p.id = b.page_id
         WHERE b.id = ?1 AND b.deleted = 0 AND p.deleted = 0",
        [block_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(|e| not_found(e, || format!("Block with ID '{}' not found", block_id)))
}

/// Knowledge base of a resource, if the resource exists.
pub fn kb_of_resource(conn: &Connection, resource_id: &str) -> Result<Option<String>, KbError> {
    let kb = conn
        .query_row(
            "SELECT knowledge_base_id FROM resources WHERE id = ?1",
            [resource_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(kb)
}

/// Counts of live entities.
pub fn stats(conn: &Connection) -> Result<Stats, KbError> {
    let count = |sql: &str| -> Result<i64, KbError> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
    Ok(Stats {
        knowledge_bases: count("SELECT COUNT(*) FROM knowledge_bases WHERE deleted = 0")?,
        pages: count("SELECT COUNT(*) FROM pages WHERE deleted = 0")?,
        blocks: count("SELECT COUNT(*) FROM blocks WHERE deleted = 0")?,
        links: count("SELECT COUNT(*) FROM links")?,
        resources: count("SELECT COUNT(*) FROM resources")?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn setup_kb(conn: &Connection) -> KnowledgeBase {
        create_knowledge_base(
            conn,
            &NewKnowledgeBase {
                name: "Notes".to_string(),
                ..Default::default()
            },
        )
        .expect("Failed to create knowledge base")
    }

    fn page(conn: &Connection, kb: &str, parent: Option<&str>, title: &str) -> Page {
        create_page(
            conn,
            &NewPage {
                kb_id: kb.to_string(),
                parent_id: parent.map(str::to_string),
                title: title.to_string(),
                ..Default::default()
            },
        )
        .expect("Failed to create page")
    }

    #[test]
    fn test_create_and_get_knowledge_base() {
        let conn = open_in_memory();
        let kb = create_knowledge_base(
            &conn,
            &NewKnowledgeBase {
                name: "Research".to_string(),
                description: Some("Papers".to_string()),
                ..Default::default()
            },
        )
        .expect("Failed to create knowledge base");

        assert_eq!(kb.icon.as_deref(), Some("📚"));
        assert_eq!(kb.created_at, kb.updated_at);

        let retrieved = get_knowledge_base(&conn, &kb.id).expect("Failed to get knowledge base");
        assert_eq!(retrieved, kb);
    }

    #[test]
    fn test_get_knowledge_base_not_found() {
        let conn = open_in_memory();
        let result = get_knowledge_base(&conn, "missing");
        assert!(matches!(result, Err(KbError::NotFound(_))));
    }

    #[test]
    fn test_create_knowledge_base_requires_name() {
        let conn = open_in_memory();
        let result = create_knowledge_base(&conn, &NewKnowledgeBase::default());
        assert!(matches!(result, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_list_knowledge_bases_newest_first() {
        let conn = open_in_memory();
        let first = setup_kb(&conn);
        let second = setup_kb(&conn);
        let kbs = list_knowledge_bases(&conn).expect("list");
        assert_eq!(kbs.len(), 2);
        assert_eq!(kbs[0].id, second.id);
        assert_eq!(kbs[1].id, first.id);
    }

    #[test]
    fn test_update_knowledge_base_merges_fields() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);

        let updated = update_knowledge_base(
            &conn,
            &kb.id,
            &KnowledgeBasePatch {
                description: Some(Some("All my notes".to_string())),
                ..Default::default()
            },
        )
        .expect("update");

        assert_eq!(updated.name, "Notes");
        assert_eq!(updated.description.as_deref(), Some("All my notes"));
        assert!(updated.updated_at > kb.updated_at);
    }

    #[test]
    fn test_update_knowledge_base_noop_keeps_timestamp() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let same = update_knowledge_base(
            &conn,
            &kb.id,
            &KnowledgeBasePatch {
                name: Some("Notes".to_string()),
                ..Default::default()
            },
        )
        .expect("update");
        assert_eq!(same.updated_at, kb.updated_at);
    }

    #[test]
    fn test_search_knowledge_bases_escapes_wildcards() {
        let conn = open_in_memory();
        create_knowledge_base(
            &conn,
            &NewKnowledgeBase {
                name: "100% Rust".to_string(),
                ..Default::default()
            },
        )
        .expect("create");
        create_knowledge_base(
            &conn,
            &NewKnowledgeBase {
                name: "Gardening".to_string(),
                ..Default::default()
            },
        )
        .expect("create");

        assert_eq!(search_knowledge_bases(&conn, "%").expect("search").len(), 1);
        assert_eq!(search_knowledge_bases(&conn, "rust").expect("search").len(), 1);
        assert_eq!(search_knowledge_bases(&conn, "_").expect("search").len(), 0);
        assert!(search_knowledge_bases(&conn, "").expect("search").is_empty());
    }

    #[test]
    fn test_create_page_appends_to_siblings() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);

        let a = page(&conn, &kb.id, None, "A");
        let b = page(&conn, &kb.id, None, "B");
        let child = page(&conn, &kb.id, Some(&a.id), "A.1");

        assert_eq!(a.sort_order, 0);
        assert_eq!(b.sort_order, 1000);
        assert_eq!(child.sort_order, 0);

        let roots = list_pages(&conn, &kb.id, None).expect("list");
        let titles: Vec<&str> = roots.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn test_create_page_with_explicit_id_and_order() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let created = create_page(
            &conn,
            &NewPage {
                id: Some("home".to_string()),
                kb_id: kb.id.clone(),
                title: "Home".to_string(),
                sort_order: Some(1000),
                ..Default::default()
            },
        )
        .expect("create");
        assert_eq!(created.id, "home");
        assert_eq!(created.sort_order, 1000);

        let dup_id = create_page(
            &conn,
            &NewPage {
                id: Some("home".to_string()),
                kb_id: kb.id.clone(),
                title: "Other".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(dup_id, Err(KbError::Validation(_))));

        let dup_key = create_page(
            &conn,
            &NewPage {
                kb_id: kb.id.clone(),
                title: "Other".to_string(),
                sort_order: Some(1000),
                ..Default::default()
            },
        );
        assert!(matches!(dup_key, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_create_page_rejects_missing_owner() {
        let conn = open_in_memory();
        let result = create_page(
            &conn,
            &NewPage {
                kb_id: "nope".to_string(),
                title: "Orphan".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(KbError::Validation(_))));

        let kb = setup_kb(&conn);
        let ghost_parent = create_page(
            &conn,
            &NewPage {
                kb_id: kb.id.clone(),
                parent_id: Some("ghost".to_string()),
                title: "Orphan".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(ghost_parent, Err(KbError::Validation(_))));

        let empty = create_page(
            &conn,
            &NewPage {
                title: "Orphan".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(empty, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_create_page_rejects_parent_in_other_kb() {
        let conn = open_in_memory();
        let kb1 = setup_kb(&conn);
        let kb2 = setup_kb(&conn);
        let foreign = page(&conn, &kb2.id, None, "Foreign");

        let result = create_page(
            &conn,
            &NewPage {
                kb_id: kb1.id.clone(),
                parent_id: Some(foreign.id.clone()),
                title: "Child".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_rename_page_bumps_updated_at() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let p = page(&conn, &kb.id, None, "Draft");

        let renamed = rename_page(&conn, &p.id, "Final").expect("rename");
        assert_eq!(renamed.title, "Final");
        assert!(renamed.updated_at > p.updated_at);

        let same = rename_page(&conn, &p.id, "Final").expect("rename");
        assert_eq!(same.updated_at, renamed.updated_at);
    }

    #[test]
    fn test_recent_pages_newest_first() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let other = setup_kb(&conn);
        let a = page(&conn, &kb.id, None, "A");
        let b = page(&conn, &kb.id, None, "B");
        let c = page(&conn, &other.id, None, "C");
        rename_page(&conn, &a.id, "A2").expect("rename");

        let ids = |pages: Vec<Page>| pages.into_iter().map(|p| p.id).collect::<Vec<_>>();
        let everywhere = recent_pages(&conn, None, 10).expect("recent");
        assert_eq!(ids(everywhere), vec![a.id.clone(), c.id.clone(), b.id.clone()]);

        let one_kb = recent_pages(&conn, Some(&kb.id), 10).expect("recent");
        assert_eq!(ids(one_kb), vec![a.id.clone(), b.id.clone()]);

        let limited = recent_pages(&conn, None, 1).expect("recent");
        assert_eq!(ids(limited), vec![a.id.clone()]);

        tombstone_pages(&conn, &[a.id.clone()]).expect("tombstone");
        let live = recent_pages(&conn, Some(&kb.id), 10).expect("recent");
        assert_eq!(ids(live), vec![b.id.clone()]);

        let missing = recent_pages(&conn, Some("nope"), 10);
        assert!(matches!(missing, Err(KbError::NotFound(_))));
    }

    #[test]
    fn test_subtree_and_ancestors() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let root = page(&conn, &kb.id, None, "Root");
        let mid = page(&conn, &kb.id, Some(&root.id), "Mid");
        let leaf = page(&conn, &kb.id, Some(&mid.id), "Leaf");
        page(&conn, &kb.id, None, "Other");

        let ids = subtree_page_ids(&conn, &root.id).expect("subtree");
        assert_eq!(ids, vec![root.id.clone(), mid.id.clone(), leaf.id.clone()]);

        let ancestors = page_ancestors(&conn, &leaf.id).expect("ancestors");
        let titles: Vec<&str> = ancestors.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Mid", "Root"]);
    }

    #[test]
    fn test_tombstoned_pages_are_invisible() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let a = page(&conn, &kb.id, None, "A");
        let b = page(&conn, &kb.id, None, "B");
        create_block(&conn, &NewBlock::new(&a.id, BlockType::Paragraph, "hello")).expect("block");
        insert_link(&conn, &b.id, &a.id).expect("link");

        let removed = tombstone_pages(&conn, &[a.id.clone()]).expect("tombstone");
        assert_eq!(removed.pages, vec![a.id.clone()]);
        assert_eq!(removed.blocks.len(), 1);
        assert_eq!(removed.links, vec![(b.id.clone(), a.id.clone())]);

        assert!(matches!(get_page(&conn, &a.id), Err(KbError::NotFound(_))));
        assert!(matches!(get_block(&conn, &removed.blocks[0]), Err(KbError::NotFound(_))));
        assert!(list_outgoing_links(&conn, &b.id).expect("links").is_empty());
        assert_eq!(list_pages(&conn, &kb.id, None).expect("list").len(), 1);
    }

    #[test]
    fn test_tombstone_reports_shared_link_once() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let a = page(&conn, &kb.id, None, "A");
        let b = page(&conn, &kb.id, None, "B");
        insert_link(&conn, &a.id, &b.id).expect("link");

        let removed = tombstone_pages(&conn, &[a.id.clone(), b.id.clone()]).expect("tombstone");
        assert_eq!(removed.links, vec![(a.id.clone(), b.id.clone())]);
    }

    #[test]
    fn test_purge_removes_tombstones_in_batches() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let p = page(&conn, &kb.id, None, "P");
        for i in 0..5 {
            create_block(&conn, &NewBlock::new(&p.id, BlockType::Paragraph, format!("b{i}"))).expect("block");
        }
        tombstone_knowledge_base(&conn, &kb.id).expect("tombstone");

        let mut rounds = 0;
        loop {
            let n = purge_tombstones(&conn, &kb.id, 2).expect("purge");
            if n == 0 {
                break;
            }
            assert!(n <= 2);
            rounds += 1;
        }
        // 5 blocks in 3 rounds, 1 page, 1 knowledge base.
        assert_eq!(rounds, 5);

        let remaining: i64 = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM blocks) + (SELECT COUNT(*) FROM pages) + (SELECT COUNT(*) FROM knowledge_bases)",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_create_block_checks_parent_page() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let p1 = page(&conn, &kb.id, None, "P1");
        let p2 = page(&conn, &kb.id, None, "P2");
        let list = create_block(&conn, &NewBlock::new(&p1.id, BlockType::List, "")).expect("block");

        let mut nested = NewBlock::new(&p1.id, BlockType::Paragraph, "item");
        nested.parent_id = Some(list.id.clone());
        let item = create_block(&conn, &nested).expect("nested block");
        assert_eq!(item.parent_id.as_deref(), Some(list.id.as_str()));
        assert_eq!(item.order_index, 0);

        let mut wrong = NewBlock::new(&p2.id, BlockType::Paragraph, "item");
        wrong.parent_id = Some(list.id.clone());
        assert!(matches!(create_block(&conn, &wrong), Err(KbError::Validation(_))));

        let missing = create_block(&conn, &NewBlock::new("nope", BlockType::Paragraph, ""));
        assert!(matches!(missing, Err(KbError::Validation(_))));

        let mut ghost_parent = NewBlock::new(&p1.id, BlockType::Paragraph, "item");
        ghost_parent.parent_id = Some("ghost".to_string());
        assert!(matches!(create_block(&conn, &ghost_parent), Err(KbError::Validation(_))));
    }

    #[test]
    fn test_block_data_roundtrip() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let p = page(&conn, &kb.id, None, "P");
        let mut new = NewBlock::new(&p.id, BlockType::Heading, "Title");
        new.data = Some(serde_json::json!({"level": 2}));
        let block = create_block(&conn, &new).expect("block");

        let fetched = get_block(&conn, &block.id).expect("get");
        assert_eq!(fetched.data, Some(serde_json::json!({"level": 2})));
        assert_eq!(fetched.block_type, BlockType::Heading);
    }

    #[test]
    fn test_update_block_reports_content_change() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let p = page(&conn, &kb.id, None, "P");
        let block = create_block(&conn, &NewBlock::new(&p.id, BlockType::Paragraph, "old")).expect("block");

        let same = update_block(
            &conn,
            &block.id,
            &BlockPatch {
                content: Some("old".to_string()),
                ..Default::default()
            },
        )
        .expect("update");
        assert!(!same.content_changed);
        assert_eq!(same.block.updated_at, block.updated_at);

        let changed = update_block(
            &conn,
            &block.id,
            &BlockPatch {
                content: Some("new".to_string()),
                ..Default::default()
            },
        )
        .expect("update");
        assert!(changed.content_changed);
        assert!(!changed.moved);
        assert_eq!(changed.block.content, "new");
        assert!(changed.block.updated_at > block.updated_at);
    }

    #[test]
    fn test_delete_block_removes_nested_blocks() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let p = page(&conn, &kb.id, None, "P");
        let list = create_block(&conn, &NewBlock::new(&p.id, BlockType::List, "")).expect("block");
        let mut nested = NewBlock::new(&p.id, BlockType::Paragraph, "item");
        nested.parent_id = Some(list.id.clone());
        let item = create_block(&conn, &nested).expect("nested");
        let keep = create_block(&conn, &NewBlock::new(&p.id, BlockType::Divider, "")).expect("block");

        let removed = delete_block(&conn, &list.id).expect("delete");
        assert_eq!(removed.blocks.len(), 2);
        assert!(removed.blocks.contains(&item.id));
        assert!(get_block(&conn, &keep.id).is_ok());
        assert!(matches!(get_block(&conn, &item.id), Err(KbError::NotFound(_))));
    }

    #[test]
    fn test_pages_mentioning_prefilter() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let a = page(&conn, &kb.id, None, "A");
        let b = page(&conn, &kb.id, None, "B");
        create_block(&conn, &NewBlock::new(&a.id, BlockType::Paragraph, "see [[page:target_1]]")).expect("block");
        create_block(&conn, &NewBlock::new(&b.id, BlockType::Paragraph, "see targetX1")).expect("block");

        assert_eq!(
            pages_mentioning(&conn, "target_1").expect("mentions"),
            vec![(a.id.clone(), kb.id.clone())]
        );
        assert!(pages_mentioning(&conn, "target%").expect("mentions").is_empty());
    }

    #[test]
    fn test_resources_lifecycle() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let res = create_resource(
            &conn,
            &NewResource {
                knowledge_base_id: kb.id.clone(),
                name: "diagram.png".to_string(),
                mime_type: "image/png".to_string(),
                size: 2048,
                file_path: "/tmp/diagram.png".to_string(),
                ..Default::default()
            },
        )
        .expect("resource");

        assert_eq!(get_resource(&conn, &res.id).expect("get"), res);
        assert_eq!(list_resources(&conn, &kb.id).expect("list").len(), 1);
        assert_eq!(kb_of_resource(&conn, &res.id).expect("kb"), Some(kb.id.clone()));

        delete_resource(&conn, &res.id).expect("delete");
        assert!(matches!(get_resource(&conn, &res.id), Err(KbError::NotFound(_))));
        assert!(matches!(delete_resource(&conn, &res.id), Err(KbError::NotFound(_))));
    }

    #[test]
    fn test_resource_validation() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let result = create_resource(
            &conn,
            &NewResource {
                knowledge_base_id: kb.id.clone(),
                name: "x".to_string(),
                mime_type: "text/plain".to_string(),
                size: -1,
                file_path: "/x".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(KbError::Validation(_))));

        let no_kb = create_resource(
            &conn,
            &NewResource {
                knowledge_base_id: "nope".to_string(),
                name: "x".to_string(),
                mime_type: "text/plain".to_string(),
                size: 1,
                file_path: "/x".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(no_kb, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_stats_counts_live_rows() {
        let conn = open_in_memory();
        let kb = setup_kb(&conn);
        let a = page(&conn, &kb.id, None, "A");
        let b = page(&conn, &kb.id, None, "B");
        create_block(&conn, &NewBlock::new(&a.id, BlockType::Paragraph, "x")).expect("block");
        insert_link(&conn, &a.id, &b.id).expect("link");
        tombstone_pages(&conn, &[b.id.clone()]).expect("tombstone");

        let stats = stats(&conn).expect("stats");
        assert_eq!(
            stats,
            Stats {
                knowledge_bases: 1,
                pages: 1,
                blocks: 1,
                links: 0,
                resources: 0,
            }
        );
    }

    #[test]
    fn test_contains_pattern_escapes() {
        assert_eq!(contains_pattern("a%b_c\\d"), "%a\\%b\\_c\\\\d%");
        assert_eq!(contains_pattern(""), "%%");
    }
}
