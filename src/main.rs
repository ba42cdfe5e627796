pub(crate) mod api;
pub(crate) mod auth;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod provider;
pub(crate) mod token;
pub(crate) mod types;

use crate::auth::Introspector;
use crate::config::{AppConfig, HttpServerConfig};
use crate::provider::dimse::StudyDownloadManager;
use crate::token::CapabilityTokens;
use axum::extract::Request;
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.init();
}

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<AppConfig>,
	pub tokens: Arc<CapabilityTokens>,
	pub downloads: StudyDownloadManager,
	/// Introspection strategy per tenant, built once at startup.
	pub introspectors: Arc<HashMap<String, Box<dyn Introspector>>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	if let Err(error) = run(config).await {
		error!("Failed to start application due to error: {error}");
	}
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let tokens = CapabilityTokens::new(config.token.passphrase.as_deref());
	let downloads = StudyDownloadManager::new(
		&config.dimse,
		Arc::new(provider::dimse::cli::SystemDicomCli),
	);
	let introspectors: HashMap<String, Box<dyn Introspector>> = config
		.tenants
		.iter()
		.map(|(key, tenant)| (key.clone(), auth::create(&tenant.authorization)))
		.collect();

	let app_state = AppState {
		config: Arc::new(config.clone()),
		tokens: Arc::new(tokens),
		downloads,
		introspectors: Arc::new(introspectors),
	};

	let app = api::routes()
		.layer(CorsLayer::permissive())
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(TimeoutLayer::new(Duration::from_secs(
			config.http.request_timeout,
		)))
		.with_state(app_state);

	let HttpServerConfig {
		interface: host,
		port,
		..
	} = config.http;
	let addr = SocketAddr::from((host, port));
	let listener = TcpListener::bind(addr).await?;

	info!("Started SMART imaging gateway on http://{addr}");
	if config.http.graceful_shutdown {
		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown_signal())
			.await?;
	} else {
		axum::serve(listener, app).await?;
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async { signal::ctrl_c().await.unwrap() };

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.unwrap()
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("smart-imaging-gateway/", env!("CARGO_PKG_VERSION"));
	let headers = response.headers_mut();
	headers.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}
