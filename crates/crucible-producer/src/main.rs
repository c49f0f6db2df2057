use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use crucible_auth::JwtVerifier;
use crucible_producer::{create_app, AppState};
use crucible_queue::RedisQueue;
use crucible_realtime::RealtimeHub;
use crucible_store::PostgresStore;
use tracing::info;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set");
    let redis_url = std::env::var("REDIS_URL")
        .expect("REDIS_URL must be set");
    let jwt_secret = std::env::var("JWT_SECRET")
        .expect("JWT_SECRET must be set");
    let internal_token = std::env::var("INTERNAL_SHARED_TOKEN")
        .expect("INTERNAL_SHARED_TOKEN must be set");
    let jwt_issuer = env_or("JWT_ISSUER", "crucible");
    let jwt_audience = env_or("JWT_AUDIENCE", "crucible-dashboard");
    let max_ttl_hours: i64 = env_or("JWT_MAX_TTL_HOURS", "24").parse().unwrap_or(24);
    let reports_root = PathBuf::from(env_or("REPORTS_ROOT", "/var/lib/crucible/reports"));
    let bind_addr: SocketAddr = env_or("BIND_ADDR", "0.0.0.0:8080").parse()?;
    let dashboard_origin = env_or("DASHBOARD_ORIGIN", "http://localhost:3000");

    info!("connecting to durable store...");
    let store = Arc::new(PostgresStore::connect(&database_url).await?);
    info!("connecting to job queue...");
    let queue = Arc::new(RedisQueue::new(&redis_url)?);

    let state = AppState {
        store,
        queue,
        hub: RealtimeHub::new(),
        jwt_verifier: JwtVerifier::new(
            &jwt_secret,
            &jwt_issuer,
            &jwt_audience,
            ChronoDuration::hours(max_ttl_hours),
        ),
        internal_token,
        reports_root,
        dashboard_origin,
    };

    let app = create_app(state);

    info!("Producer listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
