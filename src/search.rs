//! Text search over page titles and block contents.
//!
//! Matching is a case-insensitive substring test using SQLite's `LIKE` with
//! an explicit escape character, so `%`, `_` and `\` in the query match
//! literally. Case folding follows `LIKE`: ASCII letters only. Title hits and
//! content hits are collected in one `UNION ALL` so ordering and pagination
//! apply across both.

use crate::db::KbError;
use crate::models::{Page, SearchField, SearchHit, SearchOptions, SearchOrder, SearchResults};
use crate::repo::{self, contains_pattern, row_to_page, PAGE_COLUMNS};
use crate::validation;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};

/// Generate an excerpt showing the query term in context within the text.
/// Returns up to ~100 characters around the first match.
fn make_excerpt(text: &str, query: &str) -> String {
    // ASCII folding keeps byte offsets aligned with `text`.
    let lower_text = text.to_ascii_lowercase();
    let lower_query = query.to_ascii_lowercase();

    let Some(pos) = lower_text.find(&lower_query) else {
        return truncate(text, 100);
    };

    let mut start = pos.saturating_sub(40);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (pos + lower_query.len() + 40).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }

    let mut excerpt = String::new();
    if start > 0 {
        excerpt.push_str("...");
    }
    excerpt.push_str(&text[start..end]);
    if end < text.len() {
        excerpt.push_str("...");
    }
    excerpt
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Search a knowledge base's live pages and blocks.
///
/// # Behavior
///
/// - An empty or whitespace-only query returns no hits and `total = 0`.
/// - `options.scope` restricts matches to that page and its descendants.
/// - `options.search_in` selects title matches, content matches, or both.
/// - `Relevance` order puts title hits before content hits, then newest
///   first. `UpdatedAt` orders by recency alone.
/// - `total` counts every match; `hits` holds the `limit`/`offset` window.
///
/// # Errors
///
/// `NotFound` when the knowledge base or scope page doesn't exist,
/// `Validation` when the scope page belongs to another knowledge base or the
/// query is too long.
///
/// # Examples
///
/// ```ignore
/// let results = search(&conn, &kb.id, "rust", &SearchOptions {
///     search_in: [SearchField::Title].into_iter().collect(),
///     limit: 10,
///     ..Default::default()
/// })?;
/// ```
pub fn search(conn: &Connection, kb_id: &str, query: &str, options: &SearchOptions) -> Result<SearchResults, KbError> {
    validation::validate_query(query)?;
    repo::get_knowledge_base(conn, kb_id)?;

    let empty = SearchResults {
        hits: vec![],
        total: 0,
        limit: options.limit,
        offset: options.offset,
    };

    if let Some(ref scope) = options.scope {
        if repo::get_page(conn, scope)?.kb_id != kb_id {
            return Err(KbError::Validation(format!(
                "Scope page '{}' is not in knowledge base '{}'",
                scope, kb_id
            )));
        }
    }

    if query.trim().is_empty() || options.search_in.is_empty() {
        return Ok(empty);
    }

    let scoped = options.scope.is_some();
    let scope_filter = if scoped { " AND p.id IN (SELECT id FROM scope)" } else { "" };

    let mut branches = Vec::new();
    if options.search_in.contains(&SearchField::Title) {
        branches.push(format!(
            "SELECT 0 AS rank, 'title' AS field, p.id AS page_id, p.title AS page_title, \
             NULL AS block_id, p.title AS body, p.updated_at AS updated_at \
             FROM pages p \
             WHERE p.kb_id = :kb_id AND p.deleted = 0 \
             AND p.title LIKE :pattern ESCAPE '\\'{scope_filter}"
        ));
    }
    if options.search_in.contains(&SearchField::Content) {
        branches.push(format!(
            "SELECT 1 AS rank, 'content' AS field, p.id AS page_id, p.title AS page_title, \
             b.id AS block_id, b.content AS body, b.updated_at AS updated_at \
             FROM blocks b JOIN pages p ON p.id = b.page_id \
             WHERE p.kb_id = :kb_id AND p.deleted = 0 AND b.deleted = 0 \
             AND b.content LIKE :pattern ESCAPE '\\'{scope_filter}"
        ));
    }

    let mut with = String::from("WITH RECURSIVE ");
    if scoped {
        with.push_str(
            "scope(id) AS (\
                 SELECT id FROM pages WHERE id = :scope AND deleted = 0 \
                 UNION ALL \
                 SELECT p.id FROM pages p JOIN scope s ON p.parent_id = s.id WHERE p.deleted = 0\
             ), ",
        );
    }
    with.push_str("hits AS (");
    with.push_str(&branches.join(" UNION ALL "));
    with.push_str(") ");

    let order = match options.order_by {
        SearchOrder::Relevance => "rank, updated_at DESC, page_title, page_id, block_id",
        SearchOrder::UpdatedAt => "updated_at DESC, rank, page_id, block_id",
    };

    // Bind only the parameters each statement uses; rusqlite rejects named
    // parameters that don't appear in the SQL.
    let pattern = contains_pattern(query);
    let limit = options.limit as i64;
    let offset = options.offset as i64;
    let mut bound: Vec<(&str, &dyn ToSql)> =
        vec![(":kb_id", &kb_id as &dyn ToSql), (":pattern", &pattern as &dyn ToSql)];
    if let Some(ref scope) = options.scope {
        bound.push((":scope", scope));
    }

    let total: i64 = conn.query_row(&format!("{with}SELECT COUNT(*) FROM hits"), bound.as_slice(), |row| {
        row.get(0)
    })?;

    bound.push((":limit", &limit));
    bound.push((":offset", &offset));

    let mut stmt = conn.prepare(&format!(
        "{with}SELECT field, page_id, page_title, block_id, body, updated_at FROM hits \
         ORDER BY {order} LIMIT :limit OFFSET :offset"
    ))?;

    // Column indices:
    // 0:field  1:page_id  2:page_title  3:block_id  4:body  5:updated_at
    let rows = stmt.query_map(bound.as_slice(), |row| {
        let field: String = row.get(0)?;
        let body: String = row.get(4)?;
        Ok(SearchHit {
            field: if field == "title" { SearchField::Title } else { SearchField::Content },
            page_id: row.get(1)?,
            page_title: row.get(2)?,
            block_id: row.get(3)?,
            excerpt: make_excerpt(&body, query),
            updated_at: row.get(5)?,
        })
    })?;

    let hits = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(SearchResults {
        hits,
        total: total as usize,
        ..empty
    })
}

/// Pages whose title or any live block contains `query`, newest first.
///
/// Unlike [`search`] this returns whole pages, one entry per page, and may
/// span every knowledge base when `kb_id` is `None`. An empty query finds
/// nothing.
pub fn search_pages(conn: &Connection, kb_id: Option<&str>, query: &str, limit: usize) -> Result<Vec<Page>, KbError> {
    validation::validate_query(query)?;
    if let Some(kb_id) = kb_id {
        repo::get_knowledge_base(conn, kb_id)?;
    }
    if query.trim().is_empty() {
        return Ok(vec![]);
    }

    let pattern = contains_pattern(query);
    let mut stmt = conn.prepare(&format!(
        "SELECT {PAGE_COLUMNS} FROM pages p \
         WHERE p.deleted = 0 AND (?1 IS NULL OR p.kb_id = ?1) \
         AND (p.title LIKE ?2 ESCAPE '\\' \
              OR EXISTS (SELECT 1 FROM blocks b \
                         WHERE b.page_id = p.id AND b.deleted = 0 AND b.content LIKE ?2 ESCAPE '\\')) \
         ORDER BY p.updated_at DESC, p.id \
         LIMIT ?3"
    ))?;
    let pages = stmt
        .query_map(params![kb_id, pattern, limit as i64], row_to_page)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}
