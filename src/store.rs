//! `KnowledgeStore`: the entry point to the document model.
//!
//! Every mutation runs in one immediate SQLite transaction while holding the
//! owning knowledge base's write lock, so operations on one knowledge base
//! are serialized and readers only ever see committed state. Reads open their
//! own connection and run inside a deferred transaction, which in WAL mode is
//! a point-in-time snapshot that neither blocks nor is blocked by the writer.
//!
//! Events are published after commit, still under the lock, so subscribers
//! observe them in commit order.

use crate::config::Config;
use crate::db::{Database, KbError};
use crate::graph;
use crate::hierarchy;
use crate::ids::new_id;
use crate::models::{
    Backlink, Block, BlockPatch, DeletePolicy, KnowledgeBase, KnowledgeBasePatch, Link, LinkDiff, NewBlock,
    NewKnowledgeBase, NewPage, NewResource, Page, PagePatch, Removed, Resource, SearchOptions, SearchResults,
    SiblingGroup, Stats, TreeEntry,
};
use crate::notify::{ChangeEvent, EventEnvelope, Notifier};
use crate::references::extract_page_refs;
use crate::repo;
use crate::search;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Events collected while a write runs, keyed by the knowledge base whose
/// subscribers should see them.
#[derive(Default)]
struct Outbox {
    events: Vec<(String, ChangeEvent)>,
}

impl Outbox {
    fn push(&mut self, kb_id: &str, event: ChangeEvent) {
        self.events.push((kb_id.to_string(), event));
    }

    fn link_diff(&mut self, kb_id: &str, source: &str, diff: &LinkDiff) {
        for target in &diff.added {
            self.push(
                kb_id,
                ChangeEvent::LinkAdded {
                    source: source.to_string(),
                    target: target.clone(),
                },
            );
        }
        for target in &diff.removed {
            self.push(
                kb_id,
                ChangeEvent::LinkRemoved {
                    source: source.to_string(),
                    target: target.clone(),
                },
            );
        }
    }

    /// Splits into this knowledge base's events and everyone else's, each in
    /// the order they were recorded.
    fn split(self, kb_id: &str) -> (Vec<ChangeEvent>, BTreeMap<String, Vec<ChangeEvent>>) {
        let mut own = Vec::new();
        let mut foreign: BTreeMap<String, Vec<ChangeEvent>> = BTreeMap::new();
        for (target_kb, event) in self.events {
            if target_kb == kb_id {
                own.push(event);
            } else {
                foreign.entry(target_kb).or_default().push(event);
            }
        }
        (own, foreign)
    }
}

/// Records `PageDeleted` for every removed page and `LinkRemoved` for every
/// removed edge. An edge goes to the knowledge base of its source page.
fn record_removed(conn: &Connection, kb_id: &str, removed: &Removed, outbox: &mut Outbox) -> Result<(), KbError> {
    for id in &removed.pages {
        outbox.push(kb_id, ChangeEvent::PageDeleted { id: id.clone() });
    }
    for (source, target) in &removed.links {
        let source_kb = if removed.pages.contains(source) {
            kb_id.to_string()
        } else {
            match repo::kb_of_page(conn, source) {
                Ok(kb) => kb,
                Err(KbError::NotFound(_)) => kb_id.to_string(),
                Err(e) => return Err(e),
            }
        };
        outbox.push(
            &source_kb,
            ChangeEvent::LinkRemoved {
                source: source.clone(),
                target: target.clone(),
            },
        );
    }
    Ok(())
}

pub struct KnowledgeStore {
    config: Config,
    db: Database,
    notifier: Notifier,
    /// One write lock per knowledge base, created on first use.
    kb_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KnowledgeStore {
    /// Builds a store without touching the database. The first operation
    /// initializes it.
    pub fn new(config: Config) -> Self {
        Self {
            db: Database::new(&config),
            notifier: Notifier::new(config.event_capacity, config.event_history),
            kb_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Builds a store and initializes the database up front.
    pub fn open(config: Config) -> Result<Self, KbError> {
        let store = Self::new(config);
        store.db.init()?;
        Ok(store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Structural change events for one knowledge base.
    pub fn subscribe(&self, kb_id: &str) -> broadcast::Receiver<EventEnvelope> {
        self.notifier.subscribe(kb_id)
    }

    /// Events on `kb_id` after `after_seq`, from the retained history. `None`
    /// when the gap is older than the history and state must be re-read.
    pub fn replay(&self, kb_id: &str, after_seq: u64) -> Option<Vec<EventEnvelope>> {
        self.notifier.replay(kb_id, after_seq)
    }

    /// Everything new for a subscriber that has seen up to `last_seq`,
    /// including events it lagged past. See [`Notifier::catch_up`].
    pub fn catch_up(
        &self,
        kb_id: &str,
        rx: &mut broadcast::Receiver<EventEnvelope>,
        last_seq: &mut u64,
    ) -> Option<Vec<EventEnvelope>> {
        self.notifier.catch_up(kb_id, rx, last_seq)
    }

    fn kb_lock(&self, kb_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.kb_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(kb_id.to_string()).or_default().clone()
    }

    fn read<T>(&self, op: &'static str, f: impl FnOnce(&Connection) -> Result<T, KbError>) -> Result<T, KbError> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        debug!(op, "read");
        Ok(value)
    }

    fn try_write<T>(
        &self,
        f: &mut impl FnMut(&Connection, &mut Outbox) -> Result<T, KbError>,
        outbox: &mut Outbox,
    ) -> Result<T, KbError> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx, outbox)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `f` in a transaction under `kb_id`'s write lock and publishes the
    /// events it recorded. A `Conflict` is retried once from scratch; any
    /// other error rolls back and surfaces.
    fn write<T>(
        &self,
        kb_id: &str,
        op: &'static str,
        mut f: impl FnMut(&Connection, &mut Outbox) -> Result<T, KbError>,
    ) -> Result<T, KbError> {
        let (value, foreign) = {
            let lock = self.kb_lock(kb_id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let mut attempt = 1;
            loop {
                let mut outbox = Outbox::default();
                match self.try_write(&mut f, &mut outbox) {
                    Ok(value) => {
                        let (own, foreign) = outbox.split(kb_id);
                        debug!(op, kb_id, events = own.len(), "write committed");
                        self.notifier.publish(kb_id, own);
                        break (value, foreign);
                    }
                    Err(KbError::Conflict(reason)) if attempt == 1 => {
                        warn!(op, kb_id, %reason, "conflict, retrying once");
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        for (other_kb, events) in foreign {
            let lock = self.kb_lock(&other_kb);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.notifier.publish(&other_kb, events);
        }
        Ok(value)
    }

    /// Physically removes tombstoned rows of a knowledge base, one short
    /// transaction per batch. Returns the number of rows removed.
    pub fn purge_deleted(&self, kb_id: &str) -> Result<usize, KbError> {
        let batch = self.config.purge_batch_size;
        let mut total = 0;
        loop {
            let n = self.write(kb_id, "purge", |conn, _| repo::purge_tombstones(conn, kb_id, batch))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        if total > 0 {
            info!(kb_id, rows = total, "purged deleted rows");
        }
        Ok(total)
    }

    /// Purges after a delete. The delete is already committed and its rows
    /// are invisible, so a failure here only postpones reclaiming space.
    fn purge_after_delete(&self, kb_id: &str) {
        if let Err(e) = self.purge_deleted(kb_id) {
            warn!(kb_id, error = %e, "purge after delete failed");
        }
    }

    // =========================================================================
    // Knowledge bases
    // =========================================================================

    pub fn create_knowledge_base(&self, new: &NewKnowledgeBase) -> Result<KnowledgeBase, KbError> {
        let mut new = new.clone();
        let id = new.id.get_or_insert_with(new_id).clone();
        let kb = self.write(&id, "create_knowledge_base", |conn, _| repo::create_knowledge_base(conn, &new))?;
        info!(kb_id = %kb.id, name = %kb.name, "knowledge base created");
        Ok(kb)
    }

    pub fn get_knowledge_base(&self, id: &str) -> Result<KnowledgeBase, KbError> {
        self.read("get_knowledge_base", |conn| repo::get_knowledge_base(conn, id))
    }

    pub fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>, KbError> {
        self.read("list_knowledge_bases", repo::list_knowledge_bases)
    }

    pub fn search_knowledge_bases(&self, query: &str) -> Result<Vec<KnowledgeBase>, KbError> {
        self.read("search_knowledge_bases", |conn| repo::search_knowledge_bases(conn, query))
    }

    pub fn update_knowledge_base(&self, id: &str, patch: &KnowledgeBasePatch) -> Result<KnowledgeBase, KbError> {
        self.write(id, "update_knowledge_base", |conn, _| repo::update_knowledge_base(conn, id, patch))
    }

    /// Deletes a knowledge base with every page, block, link and resource it
    /// owns, then purges the tombstones and closes its event channel.
    pub fn delete_knowledge_base(&self, id: &str) -> Result<Removed, KbError> {
        let removed = self.write(id, "delete_knowledge_base", |conn, outbox| {
            let removed = repo::tombstone_knowledge_base(conn, id)?;
            record_removed(conn, id, &removed, outbox)?;
            outbox.push(id, ChangeEvent::KnowledgeBaseDeleted { id: id.to_string() });
            Ok(removed)
        })?;
        info!(
            kb_id = id,
            pages = removed.pages.len(),
            blocks = removed.blocks.len(),
            resources = removed.resources.len(),
            "knowledge base deleted"
        );

        self.purge_after_delete(id);
        self.notifier.close(id);
        self.kb_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(removed)
    }

    // =========================================================================
    // Pages
    // =========================================================================

    fn kb_of_page(&self, page_id: &str) -> Result<String, KbError> {
        self.read("kb_of_page", |conn| repo::kb_of_page(conn, page_id))
    }

    /// Creates a page. When the caller picks the id, pages whose content
    /// already references that id gain their link.
    pub fn create_page(&self, new: &NewPage) -> Result<Page, KbError> {
        let page = self.write(&new.kb_id, "create_page", |conn, outbox| {
            let page = repo::create_page(conn, new)?;
            outbox.push(
                &page.kb_id,
                ChangeEvent::PageCreated {
                    id: page.id.clone(),
                    parent: page.parent_id.clone(),
                },
            );
            if new.id.is_some() {
                for (source, diff) in graph::resync_referrers(conn, &page.id, &page.kb_id)? {
                    outbox.link_diff(&page.kb_id, &source, &diff);
                }
            }
            Ok(page)
        })?;

        // The page is committed. A referrer left stale here is repaired by
        // its next resync.
        if new.id.is_some() {
            if let Err(e) = self.resync_foreign_referrers(&page) {
                warn!(page_id = %page.id, error = %e, "resync of referrers in other knowledge bases failed");
            }
        }
        Ok(page)
    }

    /// Resyncs referrers of `page` that live in other knowledge bases, each
    /// under its own knowledge base's lock.
    fn resync_foreign_referrers(&self, page: &Page) -> Result<(), KbError> {
        let referrers = self.read("pages_mentioning", |conn| repo::pages_mentioning(conn, &page.id))?;
        let mut by_kb: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (source, kb) in referrers {
            if kb != page.kb_id {
                by_kb.entry(kb).or_default().push(source);
            }
        }

        for (kb, sources) in by_kb {
            self.write(&kb, "resync_referrers", |conn, outbox| {
                for source in &sources {
                    match graph::resync(conn, source) {
                        Ok(diff) => outbox.link_diff(&kb, source, &diff),
                        Err(KbError::NotFound(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    pub fn get_page(&self, id: &str) -> Result<Page, KbError> {
        self.read("get_page", |conn| repo::get_page(conn, id))
    }

    /// Children of `parent_id` (roots when `None`), in sibling order.
    pub fn list_pages(&self, kb_id: &str, parent_id: Option<&str>) -> Result<Vec<Page>, KbError> {
        self.read("list_pages", |conn| {
            repo::get_knowledge_base(conn, kb_id)?;
            repo::list_pages(conn, kb_id, parent_id)
        })
    }

    /// The most recently updated pages, newest first, in one knowledge base
    /// or across all of them.
    pub fn recent_pages(&self, kb_id: Option<&str>, limit: usize) -> Result<Vec<Page>, KbError> {
        self.read("recent_pages", |conn| repo::recent_pages(conn, kb_id, limit))
    }

    pub fn page_tree(&self, kb_id: &str) -> Result<Vec<TreeEntry<Page>>, KbError> {
        self.read("page_tree", |conn| hierarchy::page_tree(conn, kb_id))
    }

    pub fn breadcrumb(&self, page_id: &str) -> Result<Vec<Page>, KbError> {
        self.read("breadcrumb", |conn| hierarchy::breadcrumb(conn, page_id))
    }

    /// Renames and/or repositions a page.
    pub fn update_page(&self, id: &str, patch: &PagePatch) -> Result<Page, KbError> {
        let kb_id = self.kb_of_page(id)?;
        self.write(&kb_id, "update_page", |conn, outbox| {
            let update = hierarchy::update_page(conn, id, patch)?;
            if update.moved {
                outbox.push(
                    &kb_id,
                    ChangeEvent::PageMoved {
                        id: id.to_string(),
                        old_parent: update.old_parent.clone(),
                        new_parent: update.page.parent_id.clone(),
                    },
                );
            }
            Ok(update.page)
        })
    }

    /// Moves a page under `new_parent`, right after `after` (first when `None`).
    pub fn move_page(&self, id: &str, new_parent: Option<&str>, after: Option<&str>) -> Result<Page, KbError> {
        let kb_id = self.kb_of_page(id)?;
        self.write(&kb_id, "move_page", |conn, outbox| {
            let result = hierarchy::move_page(conn, id, new_parent, after)?;
            if result.moved {
                outbox.push(
                    &kb_id,
                    ChangeEvent::PageMoved {
                        id: id.to_string(),
                        old_parent: result.old_parent.clone(),
                        new_parent: result.page.parent_id.clone(),
                    },
                );
            }
            Ok(result.page)
        })
    }

    /// Deletes a page under the given policy and returns what was removed.
    pub fn delete_page(&self, id: &str, policy: DeletePolicy) -> Result<Removed, KbError> {
        let kb_id = self.kb_of_page(id)?;
        let removed = self.write(&kb_id, "delete_page", |conn, outbox| {
            let deletion = hierarchy::delete_page_subtree(conn, id, policy)?;
            for child in &deletion.promoted {
                outbox.push(
                    &kb_id,
                    ChangeEvent::PageMoved {
                        id: child.clone(),
                        old_parent: Some(id.to_string()),
                        new_parent: deletion.parent_id.clone(),
                    },
                );
            }
            record_removed(conn, &kb_id, &deletion.removed, outbox)?;
            Ok(deletion.removed)
        })?;

        self.purge_after_delete(&kb_id);
        Ok(removed)
    }

    /// Reorders the children of `parent_id` (roots when `None`) to exactly `ordered`.
    pub fn reorder_pages(&self, kb_id: &str, parent_id: Option<&str>, ordered: &[String]) -> Result<(), KbError> {
        let group = SiblingGroup::Pages {
            kb_id: kb_id.to_string(),
            parent_id: parent_id.map(str::to_string),
        };
        self.write(kb_id, "reorder_pages", |conn, outbox| {
            if hierarchy::reorder_siblings(conn, &group, ordered)? {
                outbox.push(
                    kb_id,
                    ChangeEvent::PagesReordered {
                        parent: parent_id.map(str::to_string),
                    },
                );
            }
            Ok(())
        })
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    fn owner_of_block(&self, block_id: &str) -> Result<(String, String), KbError> {
        self.read("owner_of_block", |conn| repo::owner_of_block(conn, block_id))
    }

    pub fn create_block(&self, new: &NewBlock) -> Result<Block, KbError> {
        let kb_id = match self.kb_of_page(&new.page_id) {
            Err(KbError::NotFound(_)) => {
                return Err(KbError::Validation(format!("Page '{}' does not exist", new.page_id)));
            }
            other => other?,
        };
        self.write(&kb_id, "create_block", |conn, outbox| {
            let block = repo::create_block(conn, new)?;
            if !extract_page_refs(&block.content).is_empty() {
                let diff = graph::resync(conn, &block.page_id)?;
                outbox.link_diff(&kb_id, &block.page_id, &diff);
            }
            Ok(block)
        })
    }

    pub fn get_block(&self, id: &str) -> Result<Block, KbError> {
        self.read("get_block", |conn| repo::get_block(conn, id))
    }

    /// Blocks of one sibling group, in order.
    pub fn list_blocks(&self, page_id: &str, parent_id: Option<&str>) -> Result<Vec<Block>, KbError> {
        self.read("list_blocks", |conn| {
            repo::get_page(conn, page_id)?;
            repo::list_blocks(conn, page_id, parent_id)
        })
    }

    /// The whole block tree of a page, depth-first.
    pub fn list_page_blocks(&self, page_id: &str) -> Result<Vec<TreeEntry<Block>>, KbError> {
        self.read("list_page_blocks", |conn| hierarchy::block_tree(conn, page_id))
    }

    /// Updates a block. Content changes resync the page's links; position
    /// changes announce a block reorder.
    pub fn update_block(&self, id: &str, patch: &BlockPatch) -> Result<Block, KbError> {
        let (kb_id, _) = self.owner_of_block(id)?;
        self.write(&kb_id, "update_block", |conn, outbox| {
            let update = repo::update_block(conn, id, patch)?;
            let page_id = &update.block.page_id;
            if update.content_changed {
                let diff = graph::resync(conn, page_id)?;
                outbox.link_diff(&kb_id, page_id, &diff);
            }
            if update.moved {
                outbox.push(&kb_id, ChangeEvent::BlockReordered { page_id: page_id.clone() });
            }
            Ok(update.block)
        })
    }

    pub fn move_block(&self, id: &str, new_parent: Option<&str>, after: Option<&str>) -> Result<Block, KbError> {
        let (kb_id, _) = self.owner_of_block(id)?;
        self.write(&kb_id, "move_block", |conn, outbox| {
            let result = hierarchy::move_block(conn, id, new_parent, after)?;
            if result.moved {
                outbox.push(
                    &kb_id,
                    ChangeEvent::BlockReordered {
                        page_id: result.block.page_id.clone(),
                    },
                );
            }
            Ok(result.block)
        })
    }

    /// Deletes a block and its nested blocks, then resyncs the page's links.
    pub fn delete_block(&self, id: &str) -> Result<Removed, KbError> {
        let (kb_id, page_id) = self.owner_of_block(id)?;
        self.write(&kb_id, "delete_block", |conn, outbox| {
            let removed = repo::delete_block(conn, id)?;
            let diff = graph::resync(conn, &page_id)?;
            outbox.link_diff(&kb_id, &page_id, &diff);
            Ok(removed)
        })
    }

    pub fn reorder_blocks(&self, page_id: &str, parent_id: Option<&str>, ordered: &[String]) -> Result<(), KbError> {
        let kb_id = self.kb_of_page(page_id)?;
        let group = SiblingGroup::Blocks {
            page_id: page_id.to_string(),
            parent_id: parent_id.map(str::to_string),
        };
        self.write(&kb_id, "reorder_blocks", |conn, outbox| {
            if hierarchy::reorder_siblings(conn, &group, ordered)? {
                outbox.push(
                    &kb_id,
                    ChangeEvent::BlockReordered {
                        page_id: page_id.to_string(),
                    },
                );
            }
            Ok(())
        })
    }

    // =========================================================================
    // Links
    // =========================================================================

    pub fn resync(&self, page_id: &str) -> Result<LinkDiff, KbError> {
        let kb_id = self.kb_of_page(page_id)?;
        self.write(&kb_id, "resync", |conn, outbox| {
            let diff = graph::resync(conn, page_id)?;
            outbox.link_diff(&kb_id, page_id, &diff);
            Ok(diff)
        })
    }

    pub fn get_link(&self, id: &str) -> Result<Link, KbError> {
        self.read("get_link", |conn| repo::get_link(conn, id))
    }

    pub fn forward_links(&self, page_id: &str) -> Result<Vec<Page>, KbError> {
        self.read("forward_links", |conn| graph::forward_links(conn, page_id))
    }

    pub fn backlinks(&self, page_id: &str) -> Result<Vec<Backlink>, KbError> {
        self.read("backlinks", |conn| graph::backlinks(conn, page_id))
    }

    // =========================================================================
    // Search
    // =========================================================================

    pub fn search(&self, kb_id: &str, query: &str, options: &SearchOptions) -> Result<SearchResults, KbError> {
        self.read("search", |conn| search::search(conn, kb_id, query, options))
    }

    /// Whole pages matching `query` by title or block content, newest first.
    /// `kb_id` of `None` searches every knowledge base.
    pub fn search_pages(&self, kb_id: Option<&str>, query: &str, limit: usize) -> Result<Vec<Page>, KbError> {
        self.read("search_pages", |conn| search::search_pages(conn, kb_id, query, limit))
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub fn create_resource(&self, new: &NewResource) -> Result<Resource, KbError> {
        self.write(&new.knowledge_base_id, "create_resource", |conn, _| repo::create_resource(conn, new))
    }

    pub fn get_resource(&self, id: &str) -> Result<Resource, KbError> {
        self.read("get_resource", |conn| repo::get_resource(conn, id))
    }

    pub fn list_resources(&self, kb_id: &str) -> Result<Vec<Resource>, KbError> {
        self.read("list_resources", |conn| {
            repo::get_knowledge_base(conn, kb_id)?;
            repo::list_resources(conn, kb_id)
        })
    }

    pub fn delete_resource(&self, id: &str) -> Result<Removed, KbError> {
        let kb_id = self
            .read("kb_of_resource", |conn| repo::kb_of_resource(conn, id))?
            .ok_or_else(|| KbError::NotFound(format!("Resource with ID '{}' not found", id)))?;
        self.write(&kb_id, "delete_resource", |conn, _| repo::delete_resource(conn, id))
    }

    pub fn stats(&self) -> Result<Stats, KbError> {
        self.read("stats", repo::stats)
    }
}
