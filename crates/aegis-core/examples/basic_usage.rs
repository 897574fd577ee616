//! Basic usage example - drive one analysis through the protective layers

use aegis_core::{
    AnalyzeOptions, HttpTransport, LocalLockManager, MemoryArea, QuotaManager, ResilientClient,
    StaticCredentials, TokenGate, TransportConfig,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> aegis_core::Result<()> {
    // Get text from args or use a sample
    let text = std::env::args().nth(1).unwrap_or_else(|| {
        "The committee has once again failed to deliver anything resembling a plan.".to_string()
    });

    let gateway_url = std::env::var("AEGIS_GATEWAY_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let api_key = std::env::var("AEGIS_API_KEY").unwrap_or_else(|_| "demo-key".to_string());

    println!("Connecting to gateway at {}", gateway_url);

    let transport = Arc::new(HttpTransport::new(
        TransportConfig::default().with_base_url(gateway_url),
    )?);
    let quota = Arc::new(QuotaManager::new(
        Arc::new(MemoryArea::new()),
        Arc::new(MemoryArea::new()),
    ));
    let tokens = TokenGate::new(
        Arc::new(StaticCredentials::new(api_key)),
        Arc::new(LocalLockManager::new()),
    );
    let client = ResilientClient::new(transport, quota, tokens);

    println!("Gateway reachable: {}", client.test_connection().await);

    println!("Analyzing {} characters...", text.chars().count());
    match client.analyze_text(&text, AnalyzeOptions::default()).await {
        Ok(result) => println!("Analysis result:\n{:#}", result),
        Err(e) => println!("Analysis failed: {}", e),
    }

    let stats = client.stats();
    println!(
        "Requests: {} ({} ok, {} failed)",
        stats.requests, stats.successes, stats.failures
    );

    Ok(())
}
