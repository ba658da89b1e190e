/*
 * 5D Labs PaddleJob Controller - Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - Kubernetes Controller for `PaddleJob` CRDs
//!
//! This service:
//! - Watches `PaddleJob` custom resources
//! - Creates parameter-server replica sets and trainer jobs
//! - Publishes job status and releases workloads when jobs end
//! - Serves health and readiness endpoints

use anyhow::Context;
use axum::{response::Json, routing::get, Router};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use paddlejob::dispatcher::spawn_ticker;
use paddlejob::watch::watch_jobs;
use paddlejob::{ControllerConfig, Dispatcher, KubeCluster, PaddleJob};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Kubernetes controller for PaddlePaddle distributed training jobs
#[derive(Parser)]
#[command(name = "paddlejob-controller")]
#[command(version)]
struct Cli {
    /// Path to a kubeconfig file; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Only watch jobs in this namespace (overrides the config file)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Controller configuration file
    #[arg(long, env = "CONTROLLER_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address of the health endpoints
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    health_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!(
        "Starting PaddleJob Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = load_controller_config(&cli.config);
    if cli.namespace.is_some() {
        config.namespace.clone_from(&cli.namespace);
    }
    config.validate().context("invalid controller configuration")?;

    let client = build_client(cli.kubeconfig.as_deref()).await?;
    info!("Connected to Kubernetes cluster");

    let api: Api<PaddleJob> = match config.namespace.as_deref() {
        Some(namespace) => {
            info!(namespace, "Watching a single namespace");
            Api::namespaced(client.clone(), namespace)
        }
        None => Api::all(client.clone()),
    };

    let (tx, rx) = mpsc::channel(config.dispatcher.event_capacity);
    let cluster = Arc::new(KubeCluster::new(client));
    let dispatcher = Dispatcher::new(cluster, config.lifecycle.settings());

    let dispatcher_handle = tokio::spawn(dispatcher.run(rx));
    let ticker_handle = spawn_ticker(tx.clone(), config.dispatcher.tick_interval());
    let watch_handle = tokio::spawn(watch_jobs(api, tx));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            ),
        );

    let listener = tokio::net::TcpListener::bind(&cli.health_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.health_addr))?;
    info!("Health server listening on {}", cli.health_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watch_handle.abort();
    ticker_handle.abort();
    dispatcher_handle.abort();
    info!("PaddleJob controller stopped");

    Ok(())
}

/// `RUST_LOG` filter with a `fmt` layer; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,paddlejob=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

fn load_controller_config(config_path: &Path) -> ControllerConfig {
    let config_path = config_path.to_string_lossy();
    match ControllerConfig::from_mounted_file(&config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "paddlejob-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "paddlejob-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
