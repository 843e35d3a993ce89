use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use sidebar_gateway::{Dispatcher, GroupBlockPolicy};
use sidebar_server::{ServerState, build_router};
use sidebar_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sidebar_server=debug,sidebar_gateway=debug,sidebar_store=debug,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("SIDEBAR_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("SIDEBAR_DB_PATH").unwrap_or_else(|_| "sidebar.db".into());
    let host = std::env::var("SIDEBAR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("SIDEBAR_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let db = Database::open(&PathBuf::from(&db_path))?;
    let dispatcher = Dispatcher::new(Arc::new(db), GroupBlockPolicy::default());

    let app = build_router(ServerState {
        dispatcher,
        jwt_secret,
    });

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("sidebar gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
