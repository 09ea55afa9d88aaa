use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use codebased_core::{Config, Language, ObjectKind};
use codebased_embedding::{EmbeddingProvider, EmbeddingService, OpenAiProvider, ResilientProvider, ServiceConfig};
use codebased_engine::{Indexer, IndexerConfig, SearchRequest, Searcher};
use codebased_store::{IndexStore, SearchFilters};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const EXIT_USER_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "codebased", version, about = "Local hybrid code search")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build or refresh the index for a repository
  Init {
    /// Repository root (default: the enclosing git repository)
    #[arg(long)]
    root: Option<PathBuf>,
  },
  /// Search the index
  Search {
    /// Query text; omit to use the interactive UI
    query: Option<String>,
    /// Maximum number of results
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,
    /// Repository root (default: the enclosing git repository)
    #[arg(long)]
    root: Option<PathBuf>,
    /// Filter by language (rust, python, typescript, ...)
    #[arg(long)]
    language: Option<String>,
    /// Filter by object kind (function, class, method, ...)
    #[arg(long)]
    kind: Option<String>,
    /// Filter by repo-relative path prefix
    #[arg(long)]
    path_prefix: Option<String>,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codebased=warn")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let work = run(cli);
  let interrupt = tokio::signal::ctrl_c();

  tokio::select! {
    result = work => match result {
      Ok(code) => ExitCode::from(code),
      Err(e) => {
        eprintln!("codebased: {e:#}");
        ExitCode::from(classify_error(&e))
      }
    },
    _ = interrupt => {
      eprintln!("interrupted");
      ExitCode::from(EXIT_INTERRUPTED)
    }
  }
}

async fn run(cli: Cli) -> Result<u8> {
  match cli.command {
    Commands::Init { root } => {
      let config = Config::load()?;
      let root = resolve_root(root)?;
      let (store, service) = open_engine(&config, &root)?;

      let indexer = Indexer::new(&root, store, service, IndexerConfig::default());
      let summary = indexer.run_once().await?;
      println!(
        "Indexed {} file(s), removed {}, {} unchanged, {} error(s)",
        summary.indexed, summary.removed, summary.unchanged, summary.errors
      );
      Ok(if summary.errors > 0 { EXIT_RUNTIME_ERROR } else { 0 })
    }
    Commands::Search {
      query,
      limit,
      root,
      language,
      kind,
      path_prefix,
    } => {
      let Some(query) = query else {
        bail!("interactive mode needs the TUI front-end; pass a QUERY");
      };
      let filters = parse_filters(language, kind, path_prefix)?;

      let config = Config::load()?;
      let root = resolve_root(root)?;
      let (store, service) = open_engine(&config, &root)?;

      // Bring the index up to date before querying, so a fresh checkout
      // works without a separate `init`.
      let indexer = Indexer::new(&root, store.clone(), service.clone(), IndexerConfig::default());
      indexer.run_once().await?;

      let searcher = Searcher::new(&root, store, service);
      let request = SearchRequest::new(query).with_limit(limit).with_filters(filters);
      let results = searcher.search(&request).await?;

      for result in &results {
        let object = &result.object;
        println!(
          "{}:{} {} ({})",
          object.path,
          object.coordinates.start_line + 1,
          object.name,
          object.kind.as_str()
        );
        println!("{}", result.body);
        println!();
      }
      debug!("{} result(s)", results.len());
      Ok(0)
    }
  }
}

fn parse_filters(language: Option<String>, kind: Option<String>, path_prefix: Option<String>) -> Result<SearchFilters> {
  let language = match language {
    Some(l) => Some(Language::parse(&l).with_context(|| format!("unknown language: {l}"))?),
    None => None,
  };
  let kind = match kind {
    Some(k) => Some(ObjectKind::parse(&k).with_context(|| format!("unknown kind: {k}"))?),
    None => None,
  };
  Ok(SearchFilters {
    language,
    kind,
    path_prefix,
  })
}

/// Resolve the repository root: an explicit flag wins; otherwise walk up
/// from the current directory looking for a `.git`, falling back to the
/// current directory itself.
fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf> {
  let base = match flag {
    Some(path) => path.canonicalize().with_context(|| format!("bad --root {}", path.display()))?,
    None => std::env::current_dir()?,
  };

  let mut cursor = base.as_path();
  loop {
    if cursor.join(".git").is_dir() {
      return Ok(cursor.to_path_buf());
    }
    match cursor.parent() {
      Some(parent) => cursor = parent,
      None => return Ok(base),
    }
  }
}

fn open_engine(config: &Config, root: &std::path::Path) -> Result<(Arc<IndexStore>, Arc<EmbeddingService>)> {
  let api_key = config.require_api_key()?;

  let provider = OpenAiProvider::new(
    &config.embedding_endpoint,
    api_key,
    &config.embedding_model,
    config.embedding_dimension,
  );
  let provider: Arc<dyn EmbeddingProvider> = Arc::new(ResilientProvider::new(provider));
  let service = Arc::new(EmbeddingService::new(provider, ServiceConfig::default()));

  let store = Arc::new(IndexStore::open(
    &config.index_dir(root),
    &config.embedding_model,
    config.embedding_dimension,
  )?);

  Ok((store, service))
}

/// Exit 1 for user/config mistakes, 2 for runtime and index failures.
fn classify_error(error: &anyhow::Error) -> u8 {
  if let Some(core) = error.downcast_ref::<codebased_core::Error>() {
    return match core {
      codebased_core::Error::Config(_) => EXIT_USER_ERROR,
      _ => EXIT_RUNTIME_ERROR,
    };
  }
  if error.to_string().contains("unknown language") || error.to_string().contains("unknown kind") {
    return EXIT_USER_ERROR;
  }
  if error.to_string().contains("interactive mode") || error.to_string().contains("bad --root") {
    return EXIT_USER_ERROR;
  }
  EXIT_RUNTIME_ERROR
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cli_parses() {
    let cli = Cli::try_parse_from(["codebased", "search", "-n", "5", "embedding cache"]).unwrap();
    match cli.command {
      Commands::Search { query, limit, .. } => {
        assert_eq!(query.as_deref(), Some("embedding cache"));
        assert_eq!(limit, 5);
      }
      _ => panic!("expected search"),
    }
  }

  #[test]
  fn test_parse_filters() {
    let filters = parse_filters(Some("rust".into()), Some("function".into()), Some("src/".into())).unwrap();
    assert_eq!(filters.language, Some(Language::Rust));
    assert_eq!(filters.kind, Some(ObjectKind::Function));
    assert_eq!(filters.path_prefix.as_deref(), Some("src/"));

    assert!(parse_filters(Some("cobol".into()), None, None).is_err());
    assert!(parse_filters(None, Some("gadget".into()), None).is_err());
  }

  #[test]
  fn test_classify_error() {
    let config_err = anyhow::Error::new(codebased_core::Error::Config("missing key".into()));
    assert_eq!(classify_error(&config_err), EXIT_USER_ERROR);

    let runtime_err = anyhow::Error::new(codebased_core::Error::Store("corrupt".into()));
    assert_eq!(classify_error(&runtime_err), EXIT_RUNTIME_ERROR);
  }
}
