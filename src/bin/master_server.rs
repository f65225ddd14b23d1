use std::sync::Arc;

use anyhow::{Context, Result};
use nwmaster::config::ServerConfig;
use nwmaster::database;
use nwmaster::server::MasterServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/master.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: master_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)?;

    let pool = database::connect(&config.database_url())
        .await
        .with_context(|| format!("Cannot connect to DB: {}", config.sql_ip))?;
    database::bootstrap_schema(&pool)
        .await
        .context("Cannot bootstrap database schema")?;

    let server = MasterServer::new(config, Some(pool)).await?;

    if let Some(db) = &server.db {
        db.publish_motd(&server.config.product_id, &server.config.motd)
            .await
            .context("Cannot publish MOTD")?;
    }

    tracing::info!("[master] [started] Master Server Started");

    // SIGINT/SIGTERM request a cooperative stop; the run loop drains
    // outstanding receives before returning.
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            tracing::info!("[master] [signal] shutdown requested");
            server.stop();
        });
    }

    server.run().await?;
    Ok(())
}
