use std::sync::Arc;

use clap::{Parser, Subcommand};
use docapi::auth::{Credentials, Sessions};
use docapi::collections::Collections;
use docapi::config::PasswordCost;
use docapi::engine::{Filter, StoreHandle};
use docapi::policy::SecurityMode;
use docapi::{Document, DATA_PREFIX};
use serde_json::Value;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// `memory:`, a data directory, or `file://<dir>`
    #[arg(short, long, env = "DOCAPI_STORE_URL", default_value = "data")]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// List the generic collections that hold documents
    Collections,
    /// List every document of a collection, ignoring ACLs
    List {
        collection: String,
        /// `field`, `field:1` or `field:-1`
        #[arg(long)]
        sort: Option<String>,
    },
    Get { collection: String, id: String },
    Del { collection: String, id: String },
    AddUser { email: String, password: String },
    /// List a user's sessions
    Sessions { user_id: String },
    /// Log a user out everywhere
    Revoke { user_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let handle = Arc::new(StoreHandle::new(cli.store));
    let store = handle.get().await?;
    // Admin access bypasses the ACLs, so the mode only matters for defaults.
    let collections = Collections::new(store.clone(), SecurityMode::Open);

    match cli.command {
        Commands::Collections => {
            let names: Vec<String> = store
                .collections()
                .await?
                .into_iter()
                .filter_map(|name| name.strip_prefix(DATA_PREFIX).map(str::to_string))
                .collect();
            println!("{}", serde_json::to_string_pretty(&names)?);
        }
        Commands::List { collection, sort } => {
            let docs = collections.find_many(&collection, Filter::All, &[], sort.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        Commands::Get { collection, id } => {
            let doc = collections.find_one(&collection, Filter::All, Some(&id)).await?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(doc.unwrap_or_default()))?);
        }
        Commands::Del { collection, id } => {
            let deleted = collections.delete_one(&collection, Filter::All, &id).await?;
            println!("{}", if deleted > 0 { "OK" } else { "NOT FOUND" });
        }
        Commands::AddUser { email, password } => {
            let credentials = Credentials::new(store.clone(), PasswordCost::default());
            let user = credentials.sign_up(&email, &password, Document::new()).await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Commands::Sessions { user_id } => {
            let sessions = Sessions::new(store.clone(), None).list_user_sessions(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Commands::Revoke { user_id } => {
            let removed = Sessions::new(store.clone(), None).revoke_user_sessions(&user_id).await?;
            println!("Revoked {} sessions", removed);
        }
    }

    handle.flush().await?;
    Ok(())
}
