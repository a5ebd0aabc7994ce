use std::sync::Arc;

use batch_core::engine::BatchEngine;
use batch_core::store::PersistenceBridge;
use batch_core::store_memory::MemoryStore;
use batch_server::grpc::proto::batch_service_server::BatchServiceServer;
use batch_server::grpc::BatchGrpcService;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = "0.0.0.0:50051".parse()?;

    let database_url = parse_database_url();

    let store: Arc<dyn PersistenceBridge> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = batch_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(BatchEngine::new(store));
    let recovered = engine.recover().await?;
    tracing::info!(recovered, "server recovery scan complete");

    tracing::info!("batch server gRPC listening on {}", addr);

    let service = BatchGrpcService { engine: engine.clone() };

    let engine_for_cycle = engine.clone();
    tokio::spawn(async move {
        loop {
            let idle = engine_for_cycle.drive_cycle().await.max(0) as u64;
            tokio::time::sleep(tokio::time::Duration::from_secs(idle)).await;
        }
    });

    Server::builder()
        .add_service(BatchServiceServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL` env var.
fn parse_database_url() -> Option<String> {
    // CLI arg takes precedence
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args
        .windows(2)
        .find(|w| w[0] == "--database-url")
        .map(|w| w[1].clone())
    {
        return Some(url);
    }
    // Fall back to env var
    std::env::var("DATABASE_URL").ok()
}
