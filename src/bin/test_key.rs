//! Quick API key probe - checks format and sends the probe prompt
//! Run with: cargo run --release --bin test_key -- <api_key>

use anyhow::{Context, Result};
use docscan_ai::{
    core::{types::mask_secret, Config},
    middleware::{CredentialPool, PoolPolicy},
    services::GeminiClient,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("docscan_ai::services::gemini=debug,test_key=info")
        .with_target(false)
        .init();

    let config = Config::new().context("Failed to load configuration")?;

    // Key from args, else every key from the environment
    let args: Vec<String> = std::env::args().collect();
    let keys = if args.len() > 1 {
        args[1..].to_vec()
    } else {
        config.api.seed_api_keys.clone()
    };

    if keys.is_empty() {
        eprintln!("Usage: test_key <api_key>... (or set GEMINI_API_KEYS)");
        std::process::exit(1);
    }

    let client = GeminiClient::new(&config.api)?;
    let pool = CredentialPool::new(PoolPolicy::from(&config.pool));

    println!("\n=== Results ===");
    let mut failed = 0;
    for key in &keys {
        info!("Probing {}", mask_secret(key));
        match pool.test(&client, key).await {
            Ok(reply) => println!("  ✓ {}  {}", mask_secret(key), reply.trim()),
            Err(e) => {
                failed += 1;
                println!("  ✗ {}  {}", mask_secret(key), e);
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
