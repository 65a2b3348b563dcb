mod api;
mod chat;
mod config;
mod logging;

use std::io;
use std::process::exit;

use anyhow::Result;
use tracing::debug;

use api::ApiClient;
use chat::{ChatRepl, ChatSession};
use config::Config;

#[tokio::main]
async fn main() {
    logging::init_logging();

    if let Err(e) = run().await {
        eprintln!("ERROR: {}", e);
        exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_cli()?;
    let api_client = ApiClient::new(config);
    debug!(model = %api_client.model_id(), "starting chat session");

    let session = ChatSession::start(api_client);
    let mut repl = ChatRepl::new(session);

    repl.run(io::stdin().lock(), io::stdout().lock()).await
}
