use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use rwsplit::config::ClientArgs;
use rwsplit::{Client, Context, Value};

#[derive(Parser, Debug)]
#[command(name = "rwsplit")]
#[command(about = "Read/write splitting SQLite client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    client: ClientArgs,

    #[arg(long, default_value = "info", env = "RWSPLIT_LOG_LEVEL", help = "Log level (error, warn, info, debug, trace)")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query on the next read database and print its rows as JSON lines
    Query {
        sql: String,
        /// Positional argument bound as text, repeatable
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Run a statement on the primary
    Exec {
        sql: String,
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Ping the primary and every replica
    Ping,
}

fn bind(args: Vec<String>) -> Vec<Value> {
    args.into_iter().map(Value::Text).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    info!("rwsplit v{}", env!("CARGO_PKG_VERSION"));

    let client = Client::new(cli.client.primary_config())
        .await
        .context("failed to open primary database")?;
    for config in cli.client.replica_configs() {
        let id = config.uniq_id();
        client
            .register_replica(Some(config))
            .await
            .with_context(|| format!("failed to register replica {}", id))?;
    }

    let outcome = run(&client, cli.command).await;
    client.close();
    outcome
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Query { sql, args } => {
            let mut result = client.query(&sql, &bind(args)).await?;
            let hit = result.hit().to_owned();
            for row in result.rows().await? {
                println!("{}", json!({ "hit": hit, "row": row }));
            }
        }
        Command::Exec { sql, args } => {
            let result = client.exec(&sql, &bind(args)).await?;
            println!(
                "{}",
                json!({
                    "hit": result.hit(),
                    "rows_affected": result.rows_affected()?,
                    "last_insert_id": result.last_insert_id()?,
                })
            );
        }
        Command::Ping => {
            let ctx = Context::background();
            let primary = client.get_primary();
            let mut databases = vec![primary.clone()];
            // each distinct replica once
            for _ in 0..client.replica_count() {
                let replica = client.get_replica();
                if databases.iter().all(|db| db.id() != replica.id()) {
                    databases.push(replica);
                }
            }
            for db in databases {
                db.ping(&ctx)
                    .await
                    .with_context(|| format!("ping to {} failed", db.id()))?;
                println!("{}", json!({ "hit": db.id(), "stats": db.stats() }));
            }
        }
    }
    Ok(())
}
