//! A local-first knowledge document model.
//!
//! Knowledge bases hold a forest of pages, pages hold ordered trees of
//! content blocks, and `[[page:<id>]]` references inside block content are
//! indexed into a link graph that answers forward-link and backlink queries.
//! [`store::KnowledgeStore`] is the entry point; everything else is the
//! machinery behind it.

pub mod config;
pub mod db;
pub mod graph;
pub mod hierarchy;
pub mod ids;
pub mod models;
pub mod notify;
pub mod references;
pub mod repo;
pub mod search;
pub mod store;
pub mod validation;

pub use config::Config;
pub use db::KbError;
pub use store::KnowledgeStore;
