//! Tree-consistent placement of pages and blocks.
//!
//! Pages and blocks live in flat tables keyed by id; `parent_id` is a lookup,
//! not an owning pointer. Sibling order comes from sparse integer keys
//! (`sort_order` for pages, `order_index` for blocks). Inserting between two
//! siblings takes the midpoint of their keys; only when two neighbors are
//! adjacent does the whole group get renumbered.

use crate::db::KbError;
use crate::ids::{key_between, now_millis, spaced_keys, ORDER_GAP};
use crate::models::{Block, DeletePolicy, Page, PagePatch, Removed, SiblingGroup, TreeEntry};
use crate::repo;
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Table and column names behind a sibling group.
struct GroupSql<'a> {
    table: &'static str,
    owner_col: &'static str,
    key_col: &'static str,
    owner: &'a str,
    parent: Option<&'a str>,
}

impl SiblingGroup {
    fn sql(&self) -> GroupSql<'_> {
        match self {
            SiblingGroup::Pages { kb_id, parent_id } => GroupSql {
                table: "pages",
                owner_col: "kb_id",
                key_col: "sort_order",
                owner: kb_id,
                parent: parent_id.as_deref(),
            },
            SiblingGroup::Blocks { page_id, parent_id } => GroupSql {
                table: "blocks",
                owner_col: "page_id",
                key_col: "order_index",
                owner: page_id,
                parent: parent_id.as_deref(),
            },
        }
    }

    fn parent_id(&self) -> Option<&str> {
        match self {
            SiblingGroup::Pages { parent_id, .. } | SiblingGroup::Blocks { parent_id, .. } => parent_id.as_deref(),
        }
    }
}

/// Live members of a sibling group as `(id, key)`, in key order.
pub fn group_members(conn: &Connection, group: &SiblingGroup) -> Result<Vec<(String, i64)>, KbError> {
    let g = group.sql();
    let mut stmt = conn.prepare(&format!(
        "SELECT id, {key} FROM {table}
         WHERE {owner} = ?1 AND parent_id IS ?2 AND deleted = 0
         ORDER BY {key}",
        key = g.key_col,
        table = g.table,
        owner = g.owner_col,
    ))?;
    let members = stmt
        .query_map(params![g.owner, g.parent], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

/// Fails with a validation error when another live sibling already holds `key`.
pub(crate) fn ensure_key_free(
    conn: &Connection,
    group: &SiblingGroup,
    key: i64,
    except: Option<&str>,
) -> Result<(), KbError> {
    let taken = group_members(conn, group)?
        .into_iter()
        .any(|(id, k)| k == key && Some(id.as_str()) != except);
    if taken {
        return Err(KbError::Validation(format!("Sibling order {} is already taken", key)));
    }
    Ok(())
}

/// Key for a new last sibling. An empty group starts at 0.
pub(crate) fn append_key(conn: &Connection, group: &SiblingGroup) -> Result<i64, KbError> {
    let members = group_members(conn, group)?;
    let last = members.last().map(|(_, k)| *k);
    if let Some(key) = key_between(last, None) {
        return Ok(key);
    }
    let order: Vec<String> = members.into_iter().map(|(id, _)| id).collect();
    let keys = renumber(conn, group, &order)?;
    key_between(keys.last().copied(), None)
        .ok_or_else(|| KbError::Conflict("No room to append to sibling group".to_string()))
}

fn set_key(conn: &Connection, group: &SiblingGroup, id: &str, key: i64) -> Result<(), KbError> {
    let g = group.sql();
    conn.execute(
        &format!("UPDATE {} SET {} = ?1 WHERE id = ?2", g.table, g.key_col),
        params![key, id],
    )?;
    Ok(())
}

/// `count` keys that collide neither with the group's current keys nor with
/// `0..=reserved_max`: below the lowest key when there is room, else above
/// the highest.
fn parking_keys(members: &[(String, i64)], count: usize, reserved_max: i64) -> Result<Vec<i64>, KbError> {
    let n = count as i64;
    let low = members.iter().map(|(_, k)| *k).min().unwrap_or(0).min(0);
    let high = members.iter().map(|(_, k)| *k).max().unwrap_or(0).max(reserved_max);

    if let Some(base) = low.checked_sub(n) {
        return Ok((0..n).map(|i| base + i).collect());
    }
    if high.checked_add(n).is_some() {
        return Ok((1..=n).map(|i| high + i).collect());
    }
    Err(KbError::Conflict("Sibling keys exhausted in both directions".to_string()))
}

/// Reassigns evenly spaced keys to a whole group in the given order and
/// returns them. Every row is first parked on a temporary key outside the
/// final range so the unique index never sees a duplicate.
fn renumber(conn: &Connection, group: &SiblingGroup, ordered: &[String]) -> Result<Vec<i64>, KbError> {
    let members = group_members(conn, group)?;
    let finals: Vec<i64> = spaced_keys(ordered.len()).collect();
    let reserved_max = finals.last().copied().unwrap_or(0);

    for (id, key) in ordered.iter().zip(parking_keys(&members, ordered.len(), reserved_max)?) {
        set_key(conn, group, id, key)?;
    }
    for (id, key) in ordered.iter().zip(&finals) {
        set_key(conn, group, id, *key)?;
    }

    info!(siblings = ordered.len(), parent = ?group.parent_id(), "renumbered sibling group");
    Ok(finals)
}

/// Key that places `moving_id` right after `after` (first when `None`) in
/// `group`, renumbering the group when the neighbors leave no room.
fn place_after(
    conn: &Connection,
    group: &SiblingGroup,
    moving_id: &str,
    after: Option<&str>,
) -> Result<i64, KbError> {
    let members = group_members(conn, group)?;
    let others: Vec<&(String, i64)> = members.iter().filter(|(id, _)| id != moving_id).collect();

    let insert_at = match after {
        None => 0,
        Some(a) => others
            .iter()
            .position(|(id, _)| id == a)
            .map(|i| i + 1)
            .ok_or_else(|| KbError::Conflict(format!("Sibling '{}' is not in the target group", a)))?,
    };

    let prev = insert_at.checked_sub(1).map(|i| others[i].1);
    let next = others.get(insert_at).map(|(_, k)| *k);
    if let Some(key) = key_between(prev, next) {
        return Ok(key);
    }

    let mut order: Vec<String> = others.iter().map(|(id, _)| id.clone()).collect();
    if others.len() != members.len() {
        order.insert(insert_at, moving_id.to_string());
        let keys = renumber(conn, group, &order)?;
        return Ok(keys[insert_at]);
    }

    let keys = renumber(conn, group, &order)?;
    let prev = insert_at.checked_sub(1).map(|i| keys[i]);
    let next = keys.get(insert_at).copied();
    key_between(prev, next).ok_or_else(|| KbError::Conflict("No room in sibling group".to_string()))
}

// =============================================================================
// Pages
// =============================================================================

/// Checks that `new_parent` may become the parent of `page`: it exists, shares
/// the knowledge base, and is neither the page nor one of its descendants.
fn check_page_parent(conn: &Connection, page: &Page, new_parent: Option<&str>) -> Result<(), KbError> {
    let Some(parent_id) = new_parent else {
        return Ok(());
    };
    if parent_id == page.id {
        return Err(KbError::Validation("Cannot move a page into itself".to_string()));
    }
    let parent = repo::get_page(conn, parent_id)?;
    if parent.kb_id != page.kb_id {
        return Err(KbError::Validation(format!(
            "Parent page '{}' belongs to a different knowledge base",
            parent_id
        )));
    }
    if repo::page_ancestors(conn, parent_id)?.iter().any(|p| p.id == page.id) {
        return Err(KbError::Validation(
            "Cannot move a page into one of its own descendants".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PageMove {
    pub page: Page,
    pub old_parent: Option<String>,
    /// False when the page was already in the requested position.
    pub moved: bool,
}

/// Moves a page under `new_parent` (root when `None`), right after the
/// sibling `after` (first when `None`).
///
/// # Errors
/// `Validation` for cycles, a parent in another knowledge base, or an
/// `after` naming the page itself. `NotFound` for a missing page or parent,
/// `Conflict` when `after` is not a live sibling in the target group.
pub fn move_page(
    conn: &Connection,
    page_id: &str,
    new_parent: Option<&str>,
    after: Option<&str>,
) -> Result<PageMove, KbError> {
    if after == Some(page_id) {
        return Err(KbError::Validation("Cannot place a page after itself".to_string()));
    }
    let page = repo::get_page(conn, page_id)?;
    check_page_parent(conn, &page, new_parent)?;

    let group = SiblingGroup::Pages {
        kb_id: page.kb_id.clone(),
        parent_id: new_parent.map(str::to_string),
    };

    if new_parent == page.parent_id.as_deref() && already_after(conn, &group, page_id, after)? {
        debug!(page_id, "move to current position ignored");
        return Ok(PageMove {
            old_parent: page.parent_id.clone(),
            page,
            moved: false,
        });
    }

    let key = place_after(conn, &group, page_id, after)?;
    repo::set_page_position(conn, page_id, new_parent, key)?;
    info!(page_id, old_parent = ?page.parent_id, new_parent = ?new_parent, sort_order = key, "page moved");

    Ok(PageMove {
        page: repo::get_page(conn, page_id)?,
        old_parent: page.parent_id,
        moved: true,
    })
}

/// True when `id` already sits directly after `after` in `group`.
fn already_after(conn: &Connection, group: &SiblingGroup, id: &str, after: Option<&str>) -> Result<bool, KbError> {
    let members = group_members(conn, group)?;
    let Some(idx) = members.iter().position(|(m, _)| m == id) else {
        return Ok(false);
    };
    let predecessor = idx.checked_sub(1).map(|i| members[i].0.as_str());
    Ok(predecessor == after)
}

/// Partial update of a page: title and/or position. Position changes go
/// through the same checks as `move_page`; an explicit `sort_order` must be
/// free in the target group.
pub fn update_page(conn: &Connection, page_id: &str, patch: &PagePatch) -> Result<PageMove, KbError> {
    let mut page = repo::get_page(conn, page_id)?;
    let old_parent = page.parent_id.clone();

    if let Some(ref title) = patch.title {
        page = repo::rename_page(conn, page_id, title)?;
    }

    let new_parent = match patch.parent_id {
        Some(ref p) => p.clone(),
        None => page.parent_id.clone(),
    };
    let parent_changed = new_parent != page.parent_id;
    let key_changed = patch.sort_order.is_some_and(|k| k != page.sort_order);
    if !parent_changed && !key_changed {
        return Ok(PageMove {
            page,
            old_parent,
            moved: false,
        });
    }

    check_page_parent(conn, &page, new_parent.as_deref())?;
    let group = SiblingGroup::Pages {
        kb_id: page.kb_id.clone(),
        parent_id: new_parent.clone(),
    };
    let key = match patch.sort_order {
        Some(k) => {
            ensure_key_free(conn, &group, k, Some(page_id))?;
            k
        }
        None => append_key(conn, &group)?,
    };
    repo::set_page_position(conn, page_id, new_parent.as_deref(), key)?;

    Ok(PageMove {
        page: repo::get_page(conn, page_id)?,
        old_parent,
        moved: true,
    })
}

#[derive(Debug, Clone)]
pub struct PageDeletion {
    pub kb_id: String,
    pub parent_id: Option<String>,
    pub removed: Removed,
    /// Children re-parented under `parent_id` by the promote policy, in order.
    pub promoted: Vec<String>,
}

/// Deletes a page under the given policy.
///
/// `Cascade` tombstones the page, every descendant and all their blocks.
/// `Promote` moves the immediate children into the page's slot among its
/// former siblings, keeping their relative order, then tombstones only the
/// page and its blocks. Links touching tombstoned pages are removed.
pub fn delete_page_subtree(conn: &Connection, page_id: &str, policy: DeletePolicy) -> Result<PageDeletion, KbError> {
    let page = repo::get_page(conn, page_id)?;

    let (removed, promoted) = match policy {
        DeletePolicy::Cascade => {
            let ids = repo::subtree_page_ids(conn, page_id)?;
            (repo::tombstone_pages(conn, &ids)?, Vec::new())
        }
        DeletePolicy::Promote => {
            let children: Vec<String> = repo::list_pages(conn, &page.kb_id, Some(page_id))?
                .into_iter()
                .map(|p| p.id)
                .collect();
            let removed = repo::tombstone_pages(conn, &[page.id.clone()])?;
            promote_children(conn, &page, &children)?;
            (removed, children)
        }
    };

    info!(
        page_id,
        ?policy,
        pages = removed.pages.len(),
        blocks = removed.blocks.len(),
        links = removed.links.len(),
        "page subtree deleted"
    );

    Ok(PageDeletion {
        kb_id: page.kb_id,
        parent_id: page.parent_id,
        removed,
        promoted,
    })
}

/// Re-parents `children` of the (already tombstoned) `page` into its former
/// sibling group at its old position.
fn promote_children(conn: &Connection, page: &Page, children: &[String]) -> Result<(), KbError> {
    if children.is_empty() {
        return Ok(());
    }
    let group = SiblingGroup::Pages {
        kb_id: page.kb_id.clone(),
        parent_id: page.parent_id.clone(),
    };
    let siblings = group_members(conn, &group)?;

    let insert_at = siblings.iter().take_while(|(_, k)| *k < page.sort_order).count();
    let mut order: Vec<String> = siblings.iter().map(|(id, _)| id.clone()).collect();
    order.splice(insert_at..insert_at, children.iter().cloned());

    let now = now_millis();
    let parked = parking_keys(&siblings, children.len(), (order.len() as i64) * ORDER_GAP)?;
    for (child, key) in children.iter().zip(parked) {
        conn.execute(
            "UPDATE pages SET parent_id = ?1, sort_order = ?2, updated_at = ?3 WHERE id = ?4",
            params![page.parent_id, key, now, child],
        )?;
    }
    renumber(conn, &group, &order)?;
    Ok(())
}

/// Assigns keys to a whole sibling group so that reading it back yields
/// exactly `ordered`. Returns false when the group was already in that order.
///
/// # Errors
/// `Validation` when `ordered` has duplicates or differs from the live
/// sibling set. `NotFound` when the group's owner or parent is missing.
pub fn reorder_siblings(conn: &Connection, group: &SiblingGroup, ordered: &[String]) -> Result<bool, KbError> {
    match group {
        SiblingGroup::Pages { kb_id, parent_id } => {
            repo::get_knowledge_base(conn, kb_id)?;
            if let Some(p) = parent_id {
                if repo::get_page(conn, p)?.kb_id != *kb_id {
                    return Err(KbError::Validation(format!("Page '{}' is not in knowledge base '{}'", p, kb_id)));
                }
            }
        }
        SiblingGroup::Blocks { page_id, parent_id } => {
            repo::get_page(conn, page_id)?;
            if let Some(b) = parent_id {
                if repo::get_block(conn, b)?.page_id != *page_id {
                    return Err(KbError::Validation(format!("Block '{}' is not on page '{}'", b, page_id)));
                }
            }
        }
    }

    let members = group_members(conn, group)?;
    let requested: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
    if requested.len() != ordered.len() {
        return Err(KbError::Validation("Sibling list contains duplicate ids".to_string()));
    }
    let current: BTreeSet<&str> = members.iter().map(|(id, _)| id.as_str()).collect();
    if requested != current {
        return Err(KbError::Validation(
            "Sibling list does not match the current siblings".to_string(),
        ));
    }

    let unchanged = members.iter().map(|(id, _)| id).eq(ordered.iter());
    if unchanged {
        return Ok(false);
    }

    renumber(conn, group, ordered)?;

    let g = group.sql();
    let now = now_millis();
    for (idx, id) in ordered.iter().enumerate() {
        if members[idx].0 != *id {
            conn.execute(
                &format!("UPDATE {} SET updated_at = ?1 WHERE id = ?2", g.table),
                params![now, id],
            )?;
        }
    }
    Ok(true)
}

// =============================================================================
// Blocks
// =============================================================================

/// Checks that `new_parent` may become the parent of `block`: a live block on
/// the same page that is neither the block nor nested inside it.
fn check_block_parent(conn: &Connection, block: &Block, new_parent: Option<&str>) -> Result<(), KbError> {
    let Some(parent_id) = new_parent else {
        return Ok(());
    };
    if parent_id == block.id {
        return Err(KbError::Validation("Cannot nest a block inside itself".to_string()));
    }
    let parent = repo::get_block(conn, parent_id)?;
    if parent.page_id != block.page_id {
        return Err(KbError::Validation(format!(
            "Parent block '{}' is on a different page",
            parent_id
        )));
    }

    let bound: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocks WHERE page_id = ?1 AND deleted = 0",
        [&block.page_id],
        |row| row.get(0),
    )?;
    let mut next = parent.parent_id;
    let mut steps = 0;
    while let Some(id) = next {
        if id == block.id {
            return Err(KbError::Validation(
                "Cannot nest a block inside one of its own children".to_string(),
            ));
        }
        steps += 1;
        if steps > bound {
            return Err(KbError::Validation("Block parent chain contains a cycle".to_string()));
        }
        next = repo::get_block(conn, &id)?.parent_id;
    }
    Ok(())
}

/// Resolves the key for a patch-driven block reposition. Used by
/// `repo::update_block`.
pub(crate) fn validate_block_position(
    conn: &Connection,
    block: &Block,
    new_parent: Option<&str>,
    order_index: Option<i64>,
) -> Result<i64, KbError> {
    check_block_parent(conn, block, new_parent)?;
    let group = SiblingGroup::Blocks {
        page_id: block.page_id.clone(),
        parent_id: new_parent.map(str::to_string),
    };
    match order_index {
        Some(k) => {
            ensure_key_free(conn, &group, k, Some(&block.id))?;
            Ok(k)
        }
        None if new_parent != block.parent_id.as_deref() => append_key(conn, &group),
        None => Ok(block.order_index),
    }
}

#[derive(Debug, Clone)]
pub struct BlockMove {
    pub block: Block,
    pub moved: bool,
}

/// Moves a block under `new_parent` (top level when `None`) on the same page,
/// right after `after` (first when `None`).
pub fn move_block(
    conn: &Connection,
    block_id: &str,
    new_parent: Option<&str>,
    after: Option<&str>,
) -> Result<BlockMove, KbError> {
    if after == Some(block_id) {
        return Err(KbError::Validation("Cannot place a block after itself".to_string()));
    }
    let block = repo::get_block(conn, block_id)?;
    check_block_parent(conn, &block, new_parent)?;

    let group = SiblingGroup::Blocks {
        page_id: block.page_id.clone(),
        parent_id: new_parent.map(str::to_string),
    };
    if new_parent == block.parent_id.as_deref() && already_after(conn, &group, block_id, after)? {
        return Ok(BlockMove { block, moved: false });
    }

    let key = place_after(conn, &group, block_id, after)?;
    repo::set_block_position(conn, block_id, new_parent, key)?;
    debug!(block_id, order_index = key, "block moved");

    Ok(BlockMove {
        block: repo::get_block(conn, block_id)?,
        moved: true,
    })
}

// =============================================================================
// Tree views
// =============================================================================

/// A node addressable in a flat parent-linked table.
trait TreeNode {
    fn node_id(&self) -> &str;
    fn parent(&self) -> Option<&str>;
}

impl TreeNode for Page {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn parent(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
}

impl TreeNode for Block {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn parent(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }
}

/// Orders `nodes` depth-first, siblings in the order given. Nodes whose parent
/// is not among `nodes` are unreachable and left out.
fn depth_first<T: TreeNode>(nodes: Vec<T>) -> Vec<TreeEntry<T>> {
    let mut children: HashMap<Option<String>, Vec<T>> = HashMap::new();
    for node in nodes {
        children.entry(node.parent().map(str::to_string)).or_default().push(node);
    }

    let mut out = Vec::new();
    let mut stack: Vec<(usize, T)> = children
        .remove(&None)
        .unwrap_or_default()
        .into_iter()
        .rev()
        .map(|n| (0, n))
        .collect();

    while let Some((depth, node)) = stack.pop() {
        if let Some(kids) = children.remove(&Some(node.node_id().to_string())) {
            stack.extend(kids.into_iter().rev().map(|k| (depth + 1, k)));
        }
        out.push(TreeEntry { depth, node });
    }
    out
}

/// Every live page of a knowledge base, depth-first in sibling order.
pub fn page_tree(conn: &Connection, kb_id: &str) -> Result<Vec<TreeEntry<Page>>, KbError> {
    repo::get_knowledge_base(conn, kb_id)?;
    let pages = repo::list_all_pages(conn, kb_id)?;
    Ok(depth_first(pages))
}

/// Every live block of a page, depth-first in sibling order.
pub fn block_tree(conn: &Connection, page_id: &str) -> Result<Vec<TreeEntry<Block>>, KbError> {
    repo::get_page(conn, page_id)?;
    let blocks = repo::list_all_blocks(conn, page_id)?;
    Ok(depth_first(blocks))
}

/// The chain from the root down to `page_id`, inclusive.
pub fn breadcrumb(conn: &Connection, page_id: &str) -> Result<Vec<Page>, KbError> {
    let page = repo::get_page(conn, page_id)?;
    let mut chain = repo::page_ancestors(conn, page_id)?;
    chain.reverse();
    chain.push(page);
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::models::{BlockType, NewBlock, NewKnowledgeBase, NewPage};

    fn kb(conn: &Connection) -> String {
        repo::create_knowledge_base(
            conn,
            &NewKnowledgeBase {
                name: "KB1".to_string(),
                ..Default::default()
            },
        )
        .expect("kb")
        .id
    }

    fn page_at(conn: &Connection, kb_id: &str, parent: Option<&str>, title: &str, order: Option<i64>) -> String {
        repo::create_page(
            conn,
            &NewPage {
                kb_id: kb_id.to_string(),
                parent_id: parent.map(str::to_string),
                title: title.to_string(),
                sort_order: order,
                ..Default::default()
            },
        )
        .expect("page")
        .id
    }

    fn titles(conn: &Connection, kb_id: &str, parent: Option<&str>) -> Vec<String> {
        repo::list_pages(conn, kb_id, parent)
            .expect("list")
            .into_iter()
            .map(|p| p.title)
            .collect()
    }

    fn pages_group(kb_id: &str, parent: Option<&str>) -> SiblingGroup {
        SiblingGroup::Pages {
            kb_id: kb_id.to_string(),
            parent_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn test_scenario_move_after_sibling() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let home = page_at(&conn, &kb1, None, "Home", Some(1000));
        let a = page_at(&conn, &kb1, Some(&home), "A", Some(1000));
        let b = page_at(&conn, &kb1, Some(&home), "B", Some(2000));

        let result = move_page(&conn, &b, Some(&home), Some(&a)).expect("move");
        assert!(!result.moved);
        assert_eq!(titles(&conn, &kb1, Some(&home)), vec!["A", "B"]);
    }

    #[test]
    fn test_move_to_same_position_keeps_timestamp() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let before = repo::get_page(&conn, &a).expect("get");

        let result = move_page(&conn, &a, None, None).expect("move");
        assert!(!result.moved);
        assert_eq!(result.page.updated_at, before.updated_at);
    }

    #[test]
    fn test_move_first_and_between() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let b = page_at(&conn, &kb1, None, "B", None);
        let c = page_at(&conn, &kb1, None, "C", None);

        let moved = move_page(&conn, &c, None, None).expect("move first");
        assert!(moved.moved);
        assert_eq!(moved.page.sort_order, -1000);
        assert_eq!(titles(&conn, &kb1, None), vec!["C", "A", "B"]);

        let moved = move_page(&conn, &c, None, Some(&a)).expect("move between");
        assert_eq!(moved.page.sort_order, 500);
        assert_eq!(titles(&conn, &kb1, None), vec!["A", "C", "B"]);

        let moved = move_page(&conn, &a, None, Some(&b)).expect("move last");
        assert_eq!(moved.page.sort_order, 2000);
        assert_eq!(titles(&conn, &kb1, None), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_move_into_adjacent_keys_renumbers() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", Some(5));
        page_at(&conn, &kb1, None, "B", Some(6));
        let c = page_at(&conn, &kb1, None, "C", Some(7));

        move_page(&conn, &c, None, Some(&a)).expect("move");
        assert_eq!(titles(&conn, &kb1, None), vec!["A", "C", "B"]);

        let keys: Vec<i64> = repo::list_pages(&conn, &kb1, None)
            .expect("list")
            .iter()
            .map(|p| p.sort_order)
            .collect();
        assert_eq!(keys, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_move_from_other_group_into_full_gap() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", Some(1));
        page_at(&conn, &kb1, None, "B", Some(2));
        let parent = page_at(&conn, &kb1, None, "P", Some(3));
        let child = page_at(&conn, &kb1, Some(&parent), "Child", None);

        move_page(&conn, &child, None, Some(&a)).expect("move");
        assert_eq!(titles(&conn, &kb1, None), vec!["A", "Child", "B", "P"]);
        assert!(titles(&conn, &kb1, Some(&parent)).is_empty());
    }

    #[test]
    fn test_append_after_max_key_renumbers() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        page_at(&conn, &kb1, None, "A", Some(i64::MAX));
        let b = page_at(&conn, &kb1, None, "B", None);
        let page = repo::get_page(&conn, &b).expect("get");
        assert_eq!(page.sort_order, 2000);
        assert_eq!(titles(&conn, &kb1, None), vec!["A", "B"]);
    }

    #[test]
    fn test_move_rejects_self_and_descendant() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let root = page_at(&conn, &kb1, None, "Root", None);
        let mid = page_at(&conn, &kb1, Some(&root), "Mid", None);
        let leaf = page_at(&conn, &kb1, Some(&mid), "Leaf", None);

        assert!(matches!(move_page(&conn, &root, Some(&root), None), Err(KbError::Validation(_))));
        assert!(matches!(move_page(&conn, &root, Some(&leaf), None), Err(KbError::Validation(_))));
        assert!(matches!(move_page(&conn, &mid, Some(&leaf), None), Err(KbError::Validation(_))));

        let moved = move_page(&conn, &leaf, None, Some(&root)).expect("move leaf to root");
        assert_eq!(moved.old_parent.as_deref(), Some(mid.as_str()));
    }

    #[test]
    fn test_move_rejects_other_kb_parent() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let kb2 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let foreign = page_at(&conn, &kb2, None, "Foreign", None);
        assert!(matches!(move_page(&conn, &a, Some(&foreign), None), Err(KbError::Validation(_))));
    }

    #[test]
    fn test_move_after_missing_sibling_conflicts() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let b = page_at(&conn, &kb1, None, "B", None);
        let child = page_at(&conn, &kb1, Some(&a), "Child", None);

        assert!(matches!(move_page(&conn, &b, None, Some("gone")), Err(KbError::Conflict(_))));
        assert!(matches!(move_page(&conn, &b, None, Some(&child)), Err(KbError::Conflict(_))));
    }

    #[test]
    fn test_move_after_itself_is_rejected() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let b = page_at(&conn, &kb1, None, "B", None);

        assert!(matches!(move_page(&conn, &b, None, Some(&b)), Err(KbError::Validation(_))));
        assert!(matches!(move_page(&conn, &b, Some(&a), Some(&b)), Err(KbError::Validation(_))));
        assert_eq!(titles(&conn, &kb1, None), vec!["A", "B"]);

        let block = repo::create_block(&conn, &NewBlock::new(&a, BlockType::Paragraph, "x")).expect("block").id;
        assert!(matches!(move_block(&conn, &block, None, Some(&block)), Err(KbError::Validation(_))));
    }

    #[test]
    fn test_accepted_moves_never_create_cycles() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let ids: Vec<String> = (0..8).map(|i| page_at(&conn, &kb1, None, &format!("P{i}"), None)).collect();

        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = |n: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % n as u64) as usize
        };

        for _ in 0..200 {
            let page = &ids[next(ids.len())];
            let parent_pick = next(ids.len() + 1);
            let parent = ids.get(parent_pick).map(String::as_str);
            let _ = move_page(&conn, page, parent, None);
        }

        for id in &ids {
            let ancestors = repo::page_ancestors(&conn, id).expect("acyclic chain");
            assert!(ancestors.len() < ids.len());
            assert!(ancestors.iter().all(|p| p.id != *id));
        }
    }

    #[test]
    fn test_update_page_reparents_and_renames() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let b = page_at(&conn, &kb1, None, "B", None);
        page_at(&conn, &kb1, Some(&a), "A1", None);

        let updated = update_page(
            &conn,
            &b,
            &PagePatch {
                title: Some("B renamed".to_string()),
                parent_id: Some(Some(a.clone())),
                sort_order: None,
            },
        )
        .expect("update");
        assert!(updated.moved);
        assert_eq!(updated.page.title, "B renamed");
        assert_eq!(updated.page.parent_id.as_deref(), Some(a.as_str()));
        assert_eq!(titles(&conn, &kb1, Some(&a)), vec!["A1", "B renamed"]);

        let cycle = update_page(
            &conn,
            &a,
            &PagePatch {
                parent_id: Some(Some(b.clone())),
                ..Default::default()
            },
        );
        assert!(matches!(cycle, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_update_page_rejects_taken_key() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        page_at(&conn, &kb1, None, "A", Some(1000));
        let b = page_at(&conn, &kb1, None, "B", Some(2000));
        let result = update_page(
            &conn,
            &b,
            &PagePatch {
                sort_order: Some(1000),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(KbError::Validation(_))));
    }

    #[test]
    fn test_delete_cascade_removes_descendants() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let root = page_at(&conn, &kb1, None, "Root", None);
        let child = page_at(&conn, &kb1, Some(&root), "Child", None);
        let grandchild = page_at(&conn, &kb1, Some(&child), "Grandchild", None);
        repo::create_block(&conn, &NewBlock::new(&grandchild, BlockType::Paragraph, "x")).expect("block");

        let deletion = delete_page_subtree(&conn, &child, DeletePolicy::Cascade).expect("delete");
        assert_eq!(deletion.removed.pages, vec![child.clone(), grandchild.clone()]);
        assert_eq!(deletion.removed.blocks.len(), 1);
        assert!(deletion.promoted.is_empty());
        assert!(matches!(repo::get_page(&conn, &grandchild), Err(KbError::NotFound(_))));
        assert!(repo::get_page(&conn, &root).is_ok());
    }

    #[test]
    fn test_delete_promote_preserves_child_order() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        page_at(&conn, &kb1, None, "Before", None);
        let doomed = page_at(&conn, &kb1, None, "Doomed", None);
        page_at(&conn, &kb1, None, "After", None);
        let c1 = page_at(&conn, &kb1, Some(&doomed), "C1", None);
        page_at(&conn, &kb1, Some(&doomed), "C2", None);
        page_at(&conn, &kb1, Some(&doomed), "C3", None);
        page_at(&conn, &kb1, Some(&c1), "C1-child", None);

        let deletion = delete_page_subtree(&conn, &doomed, DeletePolicy::Promote).expect("delete");
        assert_eq!(deletion.removed.pages, vec![doomed.clone()]);
        assert_eq!(deletion.promoted.len(), 3);

        assert_eq!(titles(&conn, &kb1, None), vec!["Before", "C1", "C2", "C3", "After"]);
        assert_eq!(titles(&conn, &kb1, Some(&c1)), vec!["C1-child"]);
    }

    #[test]
    fn test_delete_promote_nested_page() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let top = page_at(&conn, &kb1, None, "Top", None);
        let doomed = page_at(&conn, &kb1, Some(&top), "Doomed", None);
        page_at(&conn, &kb1, Some(&doomed), "X", None);
        page_at(&conn, &kb1, Some(&doomed), "Y", None);

        delete_page_subtree(&conn, &doomed, DeletePolicy::Promote).expect("delete");
        assert_eq!(titles(&conn, &kb1, Some(&top)), vec!["X", "Y"]);
    }

    #[test]
    fn test_reorder_siblings_exact_order() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "a", None);
        let b = page_at(&conn, &kb1, None, "b", None);
        let c = page_at(&conn, &kb1, None, "c", None);

        let group = pages_group(&kb1, None);
        let changed = reorder_siblings(&conn, &group, &[c.clone(), a.clone(), b.clone()]).expect("reorder");
        assert!(changed);
        assert_eq!(titles(&conn, &kb1, None), vec!["c", "a", "b"]);

        let unchanged = reorder_siblings(&conn, &group, &[c.clone(), a.clone(), b.clone()]).expect("reorder");
        assert!(!unchanged);

        reorder_siblings(&conn, &group, &[a, b, c]).expect("reorder");
        assert_eq!(titles(&conn, &kb1, None), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reorder_siblings_rejects_mismatch() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "a", None);
        let b = page_at(&conn, &kb1, None, "b", None);
        let group = pages_group(&kb1, None);

        let missing = reorder_siblings(&conn, &group, &[a.clone()]);
        assert!(matches!(missing, Err(KbError::Validation(_))));
        let extra = reorder_siblings(&conn, &group, &[a.clone(), b.clone(), "x".to_string()]);
        assert!(matches!(extra, Err(KbError::Validation(_))));
        let dup = reorder_siblings(&conn, &group, &[a.clone(), a.clone()]);
        assert!(matches!(dup, Err(KbError::Validation(_))));
        let no_kb = reorder_siblings(&conn, &pages_group("nope", None), &[]);
        assert!(matches!(no_kb, Err(KbError::NotFound(_))));
    }

    #[test]
    fn test_reorder_blocks() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let p = page_at(&conn, &kb1, None, "P", None);
        let b1 = repo::create_block(&conn, &NewBlock::new(&p, BlockType::Paragraph, "1")).expect("block").id;
        let b2 = repo::create_block(&conn, &NewBlock::new(&p, BlockType::Paragraph, "2")).expect("block").id;

        let group = SiblingGroup::Blocks {
            page_id: p.clone(),
            parent_id: None,
        };
        reorder_siblings(&conn, &group, &[b2.clone(), b1.clone()]).expect("reorder");
        let order: Vec<String> = repo::list_blocks(&conn, &p, None)
            .expect("list")
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(order, vec![b2, b1]);
    }

    #[test]
    fn test_move_block_within_page_only() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let p1 = page_at(&conn, &kb1, None, "P1", None);
        let p2 = page_at(&conn, &kb1, None, "P2", None);
        let list = repo::create_block(&conn, &NewBlock::new(&p1, BlockType::List, "")).expect("block").id;
        let item = repo::create_block(&conn, &NewBlock::new(&p1, BlockType::Paragraph, "item")).expect("block").id;
        let other = repo::create_block(&conn, &NewBlock::new(&p2, BlockType::Paragraph, "x")).expect("block").id;

        let moved = move_block(&conn, &item, Some(&list), None).expect("nest");
        assert!(moved.moved);
        assert_eq!(moved.block.parent_id.as_deref(), Some(list.as_str()));
        assert_eq!(moved.block.order_index, 0);

        assert!(matches!(move_block(&conn, &item, Some(&other), None), Err(KbError::Validation(_))));
        assert!(matches!(move_block(&conn, &list, Some(&item), None), Err(KbError::Validation(_))));
        assert!(matches!(move_block(&conn, &list, Some(&list), None), Err(KbError::Validation(_))));
    }

    #[test]
    fn test_page_tree_depth_first() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        page_at(&conn, &kb1, None, "B", None);
        let a1 = page_at(&conn, &kb1, Some(&a), "A1", None);
        page_at(&conn, &kb1, Some(&a1), "A1a", None);
        page_at(&conn, &kb1, Some(&a), "A2", None);

        let tree = page_tree(&conn, &kb1).expect("tree");
        let flat: Vec<(usize, &str)> = tree.iter().map(|e| (e.depth, e.node.title.as_str())).collect();
        assert_eq!(flat, vec![(0, "A"), (1, "A1"), (2, "A1a"), (1, "A2"), (0, "B")]);
    }

    #[test]
    fn test_block_tree_depth_first() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let p = page_at(&conn, &kb1, None, "P", None);
        let list = repo::create_block(&conn, &NewBlock::new(&p, BlockType::List, "list")).expect("block").id;
        repo::create_block(&conn, &NewBlock::new(&p, BlockType::Paragraph, "after")).expect("block");
        let mut item = NewBlock::new(&p, BlockType::Paragraph, "item");
        item.parent_id = Some(list);
        repo::create_block(&conn, &item).expect("block");

        let tree = block_tree(&conn, &p).expect("tree");
        let flat: Vec<(usize, &str)> = tree.iter().map(|e| (e.depth, e.node.content.as_str())).collect();
        assert_eq!(flat, vec![(0, "list"), (1, "item"), (0, "after")]);
    }

    #[test]
    fn test_breadcrumb_root_to_page() {
        let conn = open_in_memory();
        let kb1 = kb(&conn);
        let a = page_at(&conn, &kb1, None, "A", None);
        let b = page_at(&conn, &kb1, Some(&a), "B", None);
        let c = page_at(&conn, &kb1, Some(&b), "C", None);

        let chain: Vec<String> = breadcrumb(&conn, &c).expect("crumbs").into_iter().map(|p| p.title).collect();
        assert_eq!(chain, vec!["A", "B", "C"]);
        assert_eq!(breadcrumb(&conn, &a).expect("crumbs").len(), 1);
    }
}
