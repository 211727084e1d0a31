//! Multi-room WebSocket Chat Server - Entry Point
//!
//! Seeds the in-memory repository, starts the ChatServer actor and accepts
//! connections until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use room_chat_server::config::Cli;
use room_chat_server::{handle_connection, AppError, ChatServer, InMemoryRepository, Stats};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Use RUST_LOG to control log level, e.g. RUST_LOG=room_chat_server=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("room_chat_server=info")),
        )
        .init();

    let cli = Cli::parse();

    let repo = Arc::new(InMemoryRepository::new());
    let mut owner_id = 0;
    for username in &cli.users {
        let user = repo.create_user(username).await;
        info!("Seeded user {} with id {}", user.username, user.id);
        if owner_id == 0 {
            owner_id = user.id;
        }
    }
    for external_id in &cli.rooms {
        match repo
            .create_room_with_external_id(external_id, external_id, "", owner_id)
            .await
        {
            Ok(room) => info!("Seeded room {}", room.external_id),
            Err(e) => warn!("Skipping room {}: {}", external_id, e),
        }
    }

    let stats = Arc::new(Stats::new());
    let (server, handle) = ChatServer::new(repo, stats.clone(), cli.server_config());
    let server_task = tokio::spawn(server.run());

    let listener = TcpListener::bind(&cli.addr).await?;
    info!("WebSocket Chat Server listening on {}", cli.addr);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handle).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    match handle.shutdown(cli.shutdown_timeout()).await {
        Ok(()) => {
            if let Err(e) = server_task.await {
                error!("ChatServer task failed: {}", e);
            }
            info!("ChatServer stopped");
        }
        Err(e) => error!("ChatServer shutdown: {}", e),
    }

    for (name, value) in stats.snapshot() {
        info!("{}: {}", name, value);
    }

    Ok(())
}
