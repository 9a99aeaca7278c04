//! Demo workload: a minimal HTTP service for exercising the mesh.
//!
//! Binds the port given via `PORT`, answers `GET /health` with `200 OK`,
//! and greets on `GET /hello` with a message taken from `GREETING`.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;

#[tokio::main]
async fn main() -> Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8082);
    let greeting = std::env::var("GREETING")
        .unwrap_or_else(|_| "hello from spore-workload".to_string());

    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/hello",
            get(move || {
                let greeting = greeting.clone();
                async move { format!("{greeting} (port {port})\n") }
            }),
        );

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    eprintln!("spore-workload serving on {addr}");
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
