use std::process::ExitCode;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upstream_pool::{resolve, Config, RuntimeConfig};

const DEFAULT_CONFIG_FILE_PATH: &str = "./Upstreams.yml";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE_PATH.into());

    let config = match Config::load_from_file(&path).and_then(Config::into_runtime) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    match probe(&config).await {
        Ok(report) => {
            println!("{report:#}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Builds and resolves every configured pool, makes one selection from each
/// and reports the resulting pool state.
async fn probe(config: &RuntimeConfig) -> upstream_pool::Result<serde_json::Value> {
    let mut report = serde_json::Map::new();

    for pool_config in &config.pools {
        let mut pool = pool_config.build(config.limits)?;

        for failure in resolve::resolve_pool(&mut pool).await {
            warn!(pool = %pool_config.name, error = %failure, "resolution failed");
        }

        let key = pool_config.name.as_bytes();
        let selected = pool.select(pool_config.rotation, Some(key))?;
        let address = selected.address().ok();
        let name = selected.name().to_owned();
        info!(pool = %pool_config.name, upstream = %name, ?address, "selected upstream");

        report.insert(
            pool_config.name.clone(),
            serde_json::json!({
                "rotation": pool_config.rotation,
                "selected": name,
                "address": address,
                "stats": pool.stats(),
            }),
        );
    }

    Ok(serde_json::Value::Object(report))
}
