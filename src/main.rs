use clap::Parser;
use miette::Result;
use portcullis::{audit::AuditSink, jobs, settings, storage, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "portcullis",
    version,
    about = "RBAC policy and assignment engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;

    let audit = AuditSink::spawn(&settings.audit);
    let state = web::AppState::build(settings.clone(), db, audit).await?;

    // background jobs; the handle must outlive the server
    let _scheduler = if settings.jobs.enabled {
        Some(jobs::init_scheduler(state.sync.clone(), &settings.jobs).await?)
    } else {
        tracing::info!("Background jobs disabled");
        None
    };

    web::serve(state).await?;
    Ok(())
}
