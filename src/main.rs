use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gcp_workspace_provider::config::Config;
use gcp_workspace_provider::server::{self, AppState};
use gcp_workspace_provider::types::target_manifest;
use gcp_workspace_provider::{Collaborators, GcpProvider};

#[derive(Parser)]
#[command(name = "gcp-workspace-provider", about = "GCP workspace provider", version)]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Port to listen on, overrides PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the target options manifest as JSON
    Manifest,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but keep --help and --version working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve { port: None }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { port } => run_server(port).await,
        Cli::Manifest => {
            let manifest = serde_json::to_string_pretty(&target_manifest())
                .context("failed to encode target manifest")?;
            println!("{manifest}");
            Ok(())
        }
    }
}

async fn run_server(port: Option<u16>) -> Result<()> {
    let config = Config::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("gcp_workspace_provider=info,tower_http=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    if config.gcp_credential_file.is_none() || config.gcp_project_id.is_none() {
        tracing::info!("GCP_CREDENTIAL_FILE or GCP_PROJECT_ID unset, targets must supply them");
    }
    let provider = Arc::new(
        GcpProvider::new(Collaborators::production(http_client)).with_env(config.target_defaults()),
    );

    let app = server::create_app(AppState {
        provider: provider.clone(),
    })
    .layer(SentryHttpLayer::new().enable_transaction())
    .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = port.unwrap_or(config.port);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(provider))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(provider: Arc<GcpProvider>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down, cancelling pending dial-waits");
    provider.shutdown().await;
}
