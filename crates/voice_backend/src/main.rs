use anyhow::anyhow;
use std::{
    env::args,
    net::{SocketAddr, TcpListener},
    path::Path,
    time::Duration,
};
use tokio::signal::unix::SignalKind;
use tracing_log::LogTracer;
use tracing_subscriber::{filter::EnvFilter, fmt::format::JsonFields, Layer};
use voice_backend::{db, env, AppState, Config, MigrateConfig, Result, VERSION};

const MIGRATION_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(error) = env::load_dotenv() {
        eprintln!(
            "error loading .env.toml (this is expected in production): {}",
            error
        );
    }

    match args().nth(1).as_deref() {
        Some("version") => {
            println!("voice_backend v{VERSION}");
        }
        Some("migrate") => {
            let config = envy::from_env::<MigrateConfig>()
                .map_err(|error| anyhow!("error loading config: {error}"))?;
            let mut db_options = db::ConnectOptions::new(config.database_url.clone());
            db_options.max_connections(5);
            let db = db::Database::new(db_options, MIGRATION_QUERY_TIMEOUT).await?;

            let migrations_path = config
                .migrations_path
                .as_deref()
                .unwrap_or_else(|| Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations")));

            let migrations = db.migrate(migrations_path, false).await?;
            for (migration, duration) in migrations {
                println!(
                    "Ran {} {} {:?}",
                    migration.version, migration.description, duration
                );
            }
            db.close().await?;
        }
        Some("serve") => {
            let config = envy::from_env::<Config>()
                .map_err(|error| anyhow!("error loading config: {error}"))?;
            init_tracing(&config);

            let state = AppState::new(config).await?;

            let listener = TcpListener::bind(format!("0.0.0.0:{}", state.config.http_port))
                .map_err(|error| anyhow!("failed to bind TCP listener: {error}"))?;
            tracing::info!(
                port = state.config.http_port,
                environment = %state.config.environment,
                "voice_backend v{VERSION} listening"
            );

            let app = voice_backend::api::routes(state.clone());
            axum::Server::from_tcp(listener)
                .map_err(|error| anyhow!(error))?
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|error| anyhow!(error))?;

            state.db.close().await?;
            tracing::info!("database pool closed");
        }
        _ => {
            Err(anyhow!("usage: voice_backend <version | migrate | serve>"))?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let (mut sigterm, mut sigint) = match (
        tokio::signal::unix::signal(SignalKind::terminate()),
        tokio::signal::unix::signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(error), _) | (_, Err(error)) => {
            tracing::error!(?error, "failed to listen for interrupt signals");
            return std::future::pending().await;
        }
    };
    let sigterm = sigterm.recv();
    let sigint = sigint.recv();
    futures::pin_mut!(sigterm, sigint);
    futures::future::select(sigterm, sigint).await;
    tracing::info!("Received interrupt signal");
}

pub fn init_tracing(config: &Config) -> Option<()> {
    use std::str::FromStr;
    use tracing_subscriber::layer::SubscriberExt;
    let rust_log = config.rust_log.clone()?;

    if let Err(error) = LogTracer::init() {
        eprintln!("failed to install log bridge: {error}");
        return None;
    }

    let filter = match EnvFilter::from_str(rust_log.as_str()) {
        Ok(filter) => filter,
        Err(error) => {
            eprintln!("invalid RUST_LOG {rust_log:?}: {error}");
            return None;
        }
    };

    let subscriber = tracing_subscriber::Registry::default()
        .with(if config.log_json.unwrap_or(false) {
            Box::new(
                tracing_subscriber::fmt::layer()
                    .fmt_fields(JsonFields::default())
                    .event_format(
                        tracing_subscriber::fmt::format()
                            .json()
                            .flatten_event(true)
                            .with_span_list(true),
                    ),
            ) as Box<dyn Layer<_> + Send + Sync>
        } else {
            Box::new(
                tracing_subscriber::fmt::layer()
                    .event_format(tracing_subscriber::fmt::format().pretty()),
            )
        })
        .with(filter);

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {error}");
    }

    None
}
