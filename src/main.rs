use media_disk_cache::{
    cache_set::{purge_kind_for_all_instances, CacheSet},
    cache_types::CacheKind,
    config::{Config, SharedConfig},
    logging::init_logging,
    namespace::DirectoryLayout,
    CacheError, Result,
};
use serde_json::json;
use tracing::{error, info};

/// Kinds selected by an optional `--kind` argument; all kinds when absent.
fn selected_kinds(matches: &clap::ArgMatches) -> Result<Vec<CacheKind>> {
    match matches.get_one::<String>("kind") {
        Some(kind) => Ok(vec![kind.parse()?]),
        None => Ok(CacheKind::ALL.to_vec()),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(matches: clap::ArgMatches) -> Result<()> {
    let config = Config::load_from_matches(&matches)?;
    init_logging(&config.logging)?;

    info!(
        "media-cache {} (built {})",
        env!("BUILD_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    let instance_id = config.cache.instance_id.clone();
    let cache_dir = config.cache.cache_dir.clone();
    let shared = SharedConfig::new(config);
    let caches = CacheSet::open_idle(&shared, &instance_id).await?;

    match matches.subcommand() {
        Some(("stats", _)) => {
            let report = caches.size_report().await?;
            print_json(&serde_json::to_value(report)?)?;
        }
        Some(("evict", sub)) => {
            let mut results = Vec::new();
            for kind in selected_kinds(sub)? {
                let outcome = caches.run_eviction(kind, true).await?;
                results.push(json!({ "kind": kind, "outcome": format!("{:?}", outcome) }));
            }
            print_json(&json!({ "instance_id": instance_id, "results": results }))?;
        }
        Some(("clear", sub)) => {
            let kinds = selected_kinds(sub)?;
            if sub.get_flag("all-instances") {
                let layout = DirectoryLayout::new(cache_dir);
                for kind in &kinds {
                    purge_kind_for_all_instances(&layout, *kind).await?;
                }
            } else {
                for kind in &kinds {
                    caches.clear_kind(*kind).await?;
                }
            }
            print_json(&json!({
                "cleared": kinds,
                "all_instances": sub.get_flag("all-instances"),
            }))?;
        }
        Some(("drop-book", sub)) => {
            let book_id = sub
                .get_one::<String>("book-id")
                .ok_or_else(|| CacheError::ConfigError("BOOK_ID is required".to_string()))?;
            caches.drop_book(book_id).await?;
            print_json(&json!({ "dropped_book": book_id, "instance_id": instance_id }))?;
        }
        _ => {
            return Err(CacheError::ConfigError(
                "No command given; see --help".to_string(),
            ))
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Config::build_cli().get_matches();

    if let Err(e) = run(matches).await {
        error!("media-cache failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
