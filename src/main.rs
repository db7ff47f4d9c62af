//! kbgraph: a local knowledge document store on the command line.
//!
//! Every command opens the store, performs one operation through
//! [`KnowledgeStore`], and prints the result as JSON (or, with `--pretty`,
//! as readable text). Errors go to stderr as `{"error": ..., "kind": ...}`
//! with exit code 1.

mod output;

use clap::{Parser, Subcommand};
use kbgraph::models::{
    BlockPatch, BlockType, DeletePolicy, KnowledgeBasePatch, NewBlock, NewKnowledgeBase, NewPage, NewResource,
    PagePatch, SearchField, SearchOptions, SearchOrder,
};
use kbgraph::{Config, KbError, KnowledgeStore};
use output::OutputMode;
use std::io::{self, Read as _};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// A local knowledge base of nested pages, ordered blocks and backlinks.
///
/// All output is JSON by default; use --pretty for human-readable format.
#[derive(Parser)]
#[command(name = "kbgraph", version, about)]
struct Cli {
    /// Output in human-readable format instead of JSON.
    #[arg(long, global = true)]
    pretty: bool,

    /// Database file (default: $KBGRAPH_PATH or ~/.kbgraph/kbgraph.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },
    /// Manage pages and the page outline.
    Page {
        #[command(subcommand)]
        action: PageAction,
    },
    /// Manage content blocks within a page.
    Block {
        #[command(subcommand)]
        action: BlockAction,
    },
    /// Query the link graph derived from [[page:<id>]] references.
    Link {
        #[command(subcommand)]
        action: LinkAction,
    },
    /// Manage files attached to a knowledge base.
    Resource {
        #[command(subcommand)]
        action: ResourceAction,
    },
    /// Substring search over page titles and block content.
    Search {
        /// Knowledge base to search.
        #[arg(long)]
        kb: String,
        /// Search text (case-insensitive, matched literally).
        query: String,
        /// Restrict to this page and its descendants.
        #[arg(long)]
        scope: Option<String>,
        /// Fields to search: title, content. Repeatable; default both.
        #[arg(long = "in")]
        search_in: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Result order: relevance or updated.
        #[arg(long, default_value = "relevance")]
        order: String,
    },
    /// Counts of live entities.
    Stats,
}

#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base.
    Create {
        name: String,
        #[arg(long)]
        icon: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Use this id instead of generating one.
        #[arg(long)]
        id: Option<String>,
    },
    /// List knowledge bases, newest first.
    List,
    /// Get a knowledge base by ID.
    Get { id: String },
    /// Rename or re-describe a knowledge base.
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        icon: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a knowledge base and everything in it.
    Delete { id: String },
    /// Find knowledge bases by name or description.
    Search { query: String },
}

#[derive(Subcommand)]
enum PageAction {
    /// Create a page.
    Create {
        #[arg(long)]
        kb: String,
        #[arg(long)]
        title: String,
        /// Parent page ID. Omit for a top-level page.
        #[arg(long)]
        parent: Option<String>,
        /// Use this id instead of generating one.
        #[arg(long)]
        id: Option<String>,
        /// Explicit sibling key. Appended after the last sibling when omitted.
        #[arg(long)]
        sort_order: Option<i64>,
    },
    /// Get a page by ID.
    Get { id: String },
    /// Rename and/or reposition a page.
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        /// New parent page ID.
        #[arg(long, conflicts_with = "root")]
        parent: Option<String>,
        /// Move to the top level.
        #[arg(long)]
        root: bool,
        #[arg(long)]
        sort_order: Option<i64>,
    },
    /// List the children of a page, or the top-level pages.
    List {
        #[arg(long)]
        kb: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// List the most recently updated pages.
    Recent {
        /// Only pages of this knowledge base. Omit for every knowledge base.
        #[arg(long)]
        kb: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Find pages whose title or block content contains the query.
    Find {
        query: String,
        /// Only pages of this knowledge base. Omit for every knowledge base.
        #[arg(long)]
        kb: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the whole page outline of a knowledge base.
    Tree { kb: String },
    /// Show the path from the top level down to a page.
    Breadcrumb { id: String },
    /// Move a page under a new parent, after a given sibling.
    Move {
        id: String,
        /// New parent page ID. Omit for the top level.
        #[arg(long)]
        parent: Option<String>,
        /// Sibling to place the page after. Omit to place it first.
        #[arg(long)]
        after: Option<String>,
    },
    /// Delete a page.
    Delete {
        id: String,
        /// What happens to child pages: cascade or promote.
        #[arg(long, default_value = "cascade")]
        policy: String,
    },
    /// Set the exact order of a sibling group.
    Reorder {
        #[arg(long)]
        kb: String,
        #[arg(long)]
        parent: Option<String>,
        /// Every sibling ID, in the desired order.
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum BlockAction {
    /// Add a block to a page.
    Add {
        #[arg(long)]
        page: String,
        /// Parent block ID for nesting.
        #[arg(long)]
        parent: Option<String>,
        /// paragraph, heading, list, code, image, quote, divider.
        #[arg(long = "type", default_value = "paragraph")]
        block_type: String,
        #[arg(long)]
        content: Option<String>,
        /// Read content from stdin.
        #[arg(long)]
        stdin: bool,
        /// Structured payload as JSON.
        #[arg(long)]
        data: Option<String>,
        #[arg(long)]
        order_index: Option<i64>,
    },
    /// Get a block by ID.
    Get { id: String },
    /// Change a block's type, content or payload.
    Update {
        id: String,
        #[arg(long = "type")]
        block_type: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        stdin: bool,
        #[arg(long)]
        data: Option<String>,
    },
    /// Show a page's block tree.
    List { page: String },
    /// Move a block under a new parent on the same page, after a given sibling.
    Move {
        id: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        after: Option<String>,
    },
    /// Delete a block and its nested blocks.
    Delete { id: String },
    /// Set the exact order of a block sibling group.
    Reorder {
        #[arg(long)]
        page: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum LinkAction {
    /// Pages this page references.
    Forward { page: String },
    /// Pages that reference this page.
    Backlinks { page: String },
    /// Rebuild a page's outgoing links from its content.
    Resync { page: String },
    /// Get a link by ID.
    Get { id: String },
}

#[derive(Subcommand)]
enum ResourceAction {
    /// Register a file with a knowledge base.
    Add {
        #[arg(long)]
        kb: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        mime_type: String,
        #[arg(long)]
        size: i64,
        #[arg(long)]
        path: String,
    },
    /// Get a resource by ID.
    Get { id: String },
    /// List a knowledge base's resources.
    List { kb: String },
    /// Delete a resource.
    Delete { id: String },
}

/// Read content from --content or --stdin.
fn read_content(content: &Option<String>, stdin: bool) -> Result<Option<String>, KbError> {
    if stdin {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        Ok(Some(buf))
    } else {
        Ok(content.clone())
    }
}

fn parse_block_type(s: &str) -> Result<BlockType, KbError> {
    BlockType::from_str(s).ok_or_else(|| {
        KbError::Validation(format!(
            "Unknown block type '{}'. Valid types: paragraph, heading, list, code, image, quote, divider",
            s
        ))
    })
}

fn parse_policy(s: &str) -> Result<DeletePolicy, KbError> {
    DeletePolicy::from_str(s)
        .ok_or_else(|| KbError::Validation(format!("Unknown policy '{}'. Valid policies: cascade, promote", s)))
}

fn parse_data(s: &str) -> Result<serde_json::Value, KbError> {
    serde_json::from_str(s).map_err(|e| KbError::Validation(format!("Invalid data JSON: {}", e)))
}

fn parse_search_options(
    scope: &Option<String>,
    search_in: &[String],
    limit: usize,
    offset: usize,
    order: &str,
) -> Result<SearchOptions, KbError> {
    let mut options = SearchOptions {
        scope: scope.clone(),
        limit,
        offset,
        ..Default::default()
    };
    if !search_in.is_empty() {
        options.search_in = search_in
            .iter()
            .map(|f| match f.as_str() {
                "title" => Ok(SearchField::Title),
                "content" => Ok(SearchField::Content),
                other => Err(KbError::Validation(format!(
                    "Unknown search field '{}'. Valid fields: title, content",
                    other
                ))),
            })
            .collect::<Result<_, _>>()?;
    }
    options.order_by = match order {
        "relevance" => SearchOrder::Relevance,
        "updated" => SearchOrder::UpdatedAt,
        other => {
            return Err(KbError::Validation(format!(
                "Unknown order '{}'. Valid orders: relevance, updated",
                other
            )))
        }
    };
    Ok(options)
}

fn run() -> Result<(), KbError> {
    let cli = Cli::parse();
    let mode = if cli.pretty {
        OutputMode::Pretty
    } else {
        OutputMode::Json
    };

    let mut config = Config::from_env()?;
    if let Some(ref path) = cli.db {
        config.db_path = path.clone();
    }
    let store = KnowledgeStore::open(config)?;

    match &cli.command {
        // =====================================================================
        // Knowledge base commands
        // =====================================================================
        Commands::Kb { action } => match action {
            KbAction::Create {
                name,
                icon,
                description,
                id,
            } => {
                let kb = store.create_knowledge_base(&NewKnowledgeBase {
                    id: id.clone(),
                    name: name.clone(),
                    icon: icon.clone(),
                    description: description.clone(),
                })?;
                output::print(mode, &kb, || output::print_pretty_kb(&kb))?;
            }
            KbAction::List => {
                let kbs = store.list_knowledge_bases()?;
                output::print(mode, &kbs, || output::print_pretty_kbs(&kbs))?;
            }
            KbAction::Get { id } => {
                let kb = store.get_knowledge_base(id)?;
                output::print(mode, &kb, || output::print_pretty_kb(&kb))?;
            }
            KbAction::Update {
                id,
                name,
                icon,
                description,
            } => {
                let patch = KnowledgeBasePatch {
                    name: name.clone(),
                    icon: icon.clone().map(Some),
                    description: description.clone().map(Some),
                };
                let kb = store.update_knowledge_base(id, &patch)?;
                output::print(mode, &kb, || output::print_pretty_kb(&kb))?;
            }
            KbAction::Delete { id } => {
                let removed = store.delete_knowledge_base(id)?;
                output::print(mode, &removed, || output::print_pretty_removed(&removed))?;
            }
            KbAction::Search { query } => {
                let kbs = store.search_knowledge_bases(query)?;
                output::print(mode, &kbs, || output::print_pretty_kbs(&kbs))?;
            }
        },

        // =====================================================================
        // Page commands
        // =====================================================================
        Commands::Page { action } => match action {
            PageAction::Create {
                kb,
                title,
                parent,
                id,
                sort_order,
            } => {
                let page = store.create_page(&NewPage {
                    id: id.clone(),
                    kb_id: kb.clone(),
                    parent_id: parent.clone(),
                    title: title.clone(),
                    sort_order: *sort_order,
                })?;
                output::print(mode, &page, || output::print_pretty_page(&page))?;
            }
            PageAction::Get { id } => {
                let page = store.get_page(id)?;
                output::print(mode, &page, || output::print_pretty_page(&page))?;
            }
            PageAction::Update {
                id,
                title,
                parent,
                root,
                sort_order,
            } => {
                let parent_id = if *root {
                    Some(None)
                } else {
                    parent.clone().map(Some)
                };
                let patch = PagePatch {
                    title: title.clone(),
                    parent_id,
                    sort_order: *sort_order,
                };
                let page = store.update_page(id, &patch)?;
                output::print(mode, &page, || output::print_pretty_page(&page))?;
            }
            PageAction::List { kb, parent } => {
                let pages = store.list_pages(kb, parent.as_deref())?;
                output::print(mode, &pages, || output::print_pretty_pages(&pages))?;
            }
            PageAction::Recent { kb, limit } => {
                let pages = store.recent_pages(kb.as_deref(), *limit)?;
                output::print(mode, &pages, || output::print_pretty_pages(&pages))?;
            }
            PageAction::Find { query, kb, limit } => {
                let pages = store.search_pages(kb.as_deref(), query, *limit)?;
                output::print(mode, &pages, || output::print_pretty_pages(&pages))?;
            }
            PageAction::Tree { kb } => {
                let tree = store.page_tree(kb)?;
                output::print(mode, &tree, || output::print_pretty_page_tree(&tree))?;
            }
            PageAction::Breadcrumb { id } => {
                let crumbs = store.breadcrumb(id)?;
                output::print(mode, &crumbs, || output::print_pretty_breadcrumb(&crumbs))?;
            }
            PageAction::Move { id, parent, after } => {
                let page = store.move_page(id, parent.as_deref(), after.as_deref())?;
                output::print(mode, &page, || output::print_pretty_page(&page))?;
            }
            PageAction::Delete { id, policy } => {
                let removed = store.delete_page(id, parse_policy(policy)?)?;
                output::print(mode, &removed, || output::print_pretty_removed(&removed))?;
            }
            PageAction::Reorder { kb, parent, ids } => {
                store.reorder_pages(kb, parent.as_deref(), ids)?;
                let pages = store.list_pages(kb, parent.as_deref())?;
                output::print(mode, &pages, || output::print_pretty_pages(&pages))?;
            }
        },

        // =====================================================================
        // Block commands
        // =====================================================================
        Commands::Block { action } => match action {
            BlockAction::Add {
                page,
                parent,
                block_type,
                content,
                stdin,
                data,
                order_index,
            } => {
                let mut new = NewBlock::new(
                    page.clone(),
                    parse_block_type(block_type)?,
                    read_content(content, *stdin)?.unwrap_or_default(),
                );
                new.parent_id = parent.clone();
                new.data = data.as_deref().map(parse_data).transpose()?;
                new.order_index = *order_index;
                let block = store.create_block(&new)?;
                output::print(mode, &block, || output::print_pretty_block(&block))?;
            }
            BlockAction::Get { id } => {
                let block = store.get_block(id)?;
                output::print(mode, &block, || output::print_pretty_block(&block))?;
            }
            BlockAction::Update {
                id,
                block_type,
                content,
                stdin,
                data,
            } => {
                let patch = BlockPatch {
                    block_type: block_type.as_deref().map(parse_block_type).transpose()?,
                    content: read_content(content, *stdin)?,
                    data: data.as_deref().map(parse_data).transpose()?.map(Some),
                    ..Default::default()
                };
                let block = store.update_block(id, &patch)?;
                output::print(mode, &block, || output::print_pretty_block(&block))?;
            }
            BlockAction::List { page } => {
                let tree = store.list_page_blocks(page)?;
                output::print(mode, &tree, || output::print_pretty_block_tree(&tree))?;
            }
            BlockAction::Move { id, parent, after } => {
                let block = store.move_block(id, parent.as_deref(), after.as_deref())?;
                output::print(mode, &block, || output::print_pretty_block(&block))?;
            }
            BlockAction::Delete { id } => {
                let removed = store.delete_block(id)?;
                output::print(mode, &removed, || output::print_pretty_removed(&removed))?;
            }
            BlockAction::Reorder { page, parent, ids } => {
                store.reorder_blocks(page, parent.as_deref(), ids)?;
                let tree = store.list_page_blocks(page)?;
                output::print(mode, &tree, || output::print_pretty_block_tree(&tree))?;
            }
        },

        // =====================================================================
        // Link commands
        // =====================================================================
        Commands::Link { action } => match action {
            LinkAction::Forward { page } => {
                let pages = store.forward_links(page)?;
                output::print(mode, &pages, || output::print_pretty_pages(&pages))?;
            }
            LinkAction::Backlinks { page } => {
                let backlinks = store.backlinks(page)?;
                output::print(mode, &backlinks, || output::print_pretty_backlinks(&backlinks))?;
            }
            LinkAction::Resync { page } => {
                let diff = store.resync(page)?;
                let msg = serde_json::json!({"added": diff.added, "removed": diff.removed});
                output::print(mode, &msg, || {
                    println!("Added {} link(s), removed {} link(s)", diff.added.len(), diff.removed.len())
                })?;
            }
            LinkAction::Get { id } => {
                let link = store.get_link(id)?;
                output::print(mode, &link, || println!("{} -> {}", link.source_page_id, link.target_page_id))?;
            }
        },

        // =====================================================================
        // Resource commands
        // =====================================================================
        Commands::Resource { action } => match action {
            ResourceAction::Add {
                kb,
                name,
                mime_type,
                size,
                path,
            } => {
                let resource = store.create_resource(&NewResource {
                    id: None,
                    knowledge_base_id: kb.clone(),
                    name: name.clone(),
                    mime_type: mime_type.clone(),
                    size: *size,
                    file_path: path.clone(),
                })?;
                output::print(mode, &resource, || {
                    output::print_pretty_resources(std::slice::from_ref(&resource))
                })?;
            }
            ResourceAction::Get { id } => {
                let resource = store.get_resource(id)?;
                output::print(mode, &resource, || {
                    output::print_pretty_resources(std::slice::from_ref(&resource))
                })?;
            }
            ResourceAction::List { kb } => {
                let resources = store.list_resources(kb)?;
                output::print(mode, &resources, || output::print_pretty_resources(&resources))?;
            }
            ResourceAction::Delete { id } => {
                let removed = store.delete_resource(id)?;
                output::print(mode, &removed, || output::print_pretty_removed(&removed))?;
            }
        },

        // =====================================================================
        // Search and stats
        // =====================================================================
        Commands::Search {
            kb,
            query,
            scope,
            search_in,
            limit,
            offset,
            order,
        } => {
            let options = parse_search_options(scope, search_in, *limit, *offset, order)?;
            let results = store.search(kb, query, &options)?;
            output::print(mode, &results, || output::print_pretty_search_results(&results))?;
        }
        Commands::Stats => {
            let stats = store.stats()?;
            output::print(mode, &stats, || output::print_pretty_stats(&stats))?;
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run() {
        let error_json = serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        });
        eprintln!("{}", error_json);
        process::exit(1);
    }
}
