use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use lmx_domain::config::{Config, ConfigSeverity, OtelConfig};
use lmx_gateway::cli::{self, Cli, Command, ConfigCommand};
use lmx_gateway::{api, bootstrap};
use lmx_skills::dispatch::SkillDispatcher;

// Exit codes: 0 ok, 1 configuration error, 2 startup failure,
// 3 SIGTERM exit after drain completed.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_STARTUP: i32 = 2;
const EXIT_SIGTERM: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            let (config, config_path) = match cli::load_config(cli.config.as_ref()) {
                Ok(loaded) => loaded,
                Err(e) => {
                    eprintln!("config error: {e}");
                    return EXIT_CONFIG;
                }
            };
            let log_reload = init_tracing(
                &config.logging.level,
                config.logging.json,
                &config.logging.otel,
            );

            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                    ConfigSeverity::Error => tracing::error!("config: {issue}"),
                }
            }
            if issues
                .iter()
                .any(|issue| issue.severity == ConfigSeverity::Error)
            {
                return EXIT_CONFIG;
            }

            match run_server(config, config_path, log_reload).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "startup failed");
                    EXIT_STARTUP
                }
            }
        }
        Some(Command::Doctor) => {
            let (config, _) = match cli::load_config(cli.config.as_ref()) {
                Ok(loaded) => loaded,
                Err(e) => {
                    eprintln!("config error: {e}");
                    return EXIT_CONFIG;
                }
            };
            if cli::doctor(&config).await {
                EXIT_OK
            } else {
                EXIT_CONFIG
            }
        }
        Some(Command::Config { command }) => {
            let (config, _) = match cli::load_config(cli.config.as_ref()) {
                Ok(loaded) => loaded,
                Err(e) => {
                    eprintln!("config error: {e}");
                    return EXIT_CONFIG;
                }
            };
            match command {
                ConfigCommand::Validate => {
                    if cli::validate(&config) {
                        EXIT_OK
                    } else {
                        EXIT_CONFIG
                    }
                }
                ConfigCommand::Show => {
                    cli::show(&config);
                    EXIT_OK
                }
            }
        }
        Some(Command::Version) => {
            println!("opta-lmx {}", env!("CARGO_PKG_VERSION"));
            EXIT_OK
        }
    }
}

async fn run_server(
    config: Config,
    config_path: Option<PathBuf>,
    log_reload: Option<Arc<dyn Fn(&str) + Send + Sync>>,
) -> anyhow::Result<i32> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Opta-LMX starting");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = bootstrap::build_state(config, config_path, log_reload).await?;
    let app = api::router(state.clone()).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Opta-LMX listening");

    let sigterm_seen = Arc::new(AtomicBool::new(false));
    let shutdown = {
        let sigterm_seen = sigterm_seen.clone();
        async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("installing SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {
                        sigterm_seen.store(true, Ordering::Release);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            tracing::info!("shutdown signal received");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    // Voluntary drain: wait for in-flight inference, then stop workers.
    let drained = state.engine.drain(Duration::from_secs(30)).await;
    if !drained {
        tracing::warn!("drain timed out; exiting with requests in flight");
    }
    state.agents.stop().await;
    state.skill_dispatcher.close().await;
    tracing::info!(drained, "Opta-LMX stopped");

    if sigterm_seen.load(Ordering::Acquire) {
        Ok(EXIT_SIGTERM)
    } else {
        Ok(EXIT_OK)
    }
}

/// Install the tracing subscriber: env-filter (reloadable), JSON or
/// plain formatting, and an optional OTLP span pipeline. Returns the
/// closure `/admin/config/reload` uses to apply a new log level.
fn init_tracing(
    level: &str,
    json: bool,
    otel: &OtelConfig,
) -> Option<Arc<dyn Fn(&str) + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(filter);
    let tracer = build_otel_tracer(otel);

    if json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .with(tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t)))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .with(tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t)))
            .init();
    }

    Some(Arc::new(move |level: &str| {
        if let Err(e) = handle.reload(EnvFilter::new(level)) {
            tracing::warn!(error = %e, "log level reload failed");
        }
    }))
}

fn build_otel_tracer(otel: &OtelConfig) -> Option<opentelemetry_sdk::trace::Tracer> {
    if !otel.enabled {
        return None;
    }
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otel.endpoint.clone())
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("otel exporter init failed: {e}");
            return None;
        }
    };
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer(otel.service_name.clone());
    opentelemetry::global::set_tracer_provider(provider);
    Some(tracer)
}
