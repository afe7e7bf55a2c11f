//! Example demonstrating connection pool and circuit breaker usage
//!
//! This example shows how to:
//! 1. Build a pool over the in-process transport
//! 2. Borrow, use and restore connections by hand
//! 3. Protect calls with the circuit breaker
//! 4. Monitor pool and circuit statistics
//!
//! Run with:
//! ```
//! cargo run --example pool_usage
//! ```

use hyper::{Request, StatusCode};
use meshpool::config::TlsConfig;
use meshpool::error::ClientError;
use meshpool::pool::{Authority, CircuitBreaker, CircuitBreakerConfig, ConnectionPool, PoolConfig};
use meshpool::tls::{SharedTrustContext, TrustContextBuilder};
use meshpool::transport::{ClientResponse, MemoryTransport, TransportError, TransportRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Borrow a connection by hand, send one request, then give the connection back
async fn status(
    pool: &ConnectionPool,
    authority: &Authority,
    n: u32,
) -> Result<ClientResponse, ClientError> {
    let mut token = pool.borrow(authority, Duration::from_secs(1)).await?;
    let request = Request::get(format!("{}/status?{}", authority, n))
        .body(())
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

    match token.connection().send(request, None).await {
        Ok(response) => {
            pool.restore(token)?;
            Ok(response)
        }
        Err(e) => {
            pool.discard(token)?;
            Err(ClientError::from_transport(&authority.to_string(), e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Every seventh request to the flaky service fails
    let transport = MemoryTransport::new(|req, _| {
        let flaky = req.uri().host() == Some("flaky.mesh");
        let n: u32 = req.uri().query().and_then(|q| q.parse().ok()).unwrap_or(0);
        if flaky && n % 7 == 0 {
            Err(TransportError::Receive("connection reset".to_string()))
        } else {
            Ok(ClientResponse::new(StatusCode::OK, "ok"))
        }
    });

    let pool_config = PoolConfig {
        max_connections: 4,
        max_idle_time: Duration::from_secs(90),
        ..PoolConfig::default()
    };
    let circuit_config = CircuitBreakerConfig {
        failure_threshold: 2,
        timeout: Duration::from_secs(1),
        ..CircuitBreakerConfig::default()
    };

    let trust = Arc::new(SharedTrustContext::new(
        TrustContextBuilder::new(),
        TlsConfig::default(),
    ));
    let pool = Arc::new(ConnectionPool::new(
        pool_config,
        TransportRegistry::single(Arc::new(transport)),
        trust,
    ));
    let circuit = CircuitBreaker::new(circuit_config);
    let reaper = pool.spawn_reaper(Duration::from_secs(30));

    let authorities = [
        Authority::new("http", "orders.mesh", 8080),
        Authority::new("http", "flaky.mesh", 8080),
    ];

    for i in 0..20u32 {
        let authority = &authorities[(i % 2) as usize];
        let key = authority.to_string();

        let result = circuit
            .call(&key, || status(&pool, authority, i))
            .await;

        match result {
            Ok(response) => info!("Request #{} to {} - {}", i + 1, key, response.status()),
            Err(e) => warn!("Request #{} to {} - {}", i + 1, key, e),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("\n=== FINAL STATISTICS ===\n");

    println!("Connection Pool Stats:");
    for (authority, stats) in pool.get_all_stats() {
        println!("  Authority: {}", authority);
        println!("    Total created: {}", stats.total_created);
        println!("    Total reused: {}", stats.total_reused);
        println!("    Total discarded: {}", stats.total_discarded);
        println!("    Borrowed connections: {}", stats.active_connections);
        println!("    Idle connections: {}", stats.idle_connections);
        println!();
    }

    println!("Circuit Breaker Stats:");
    for (key, stats) in circuit.get_all_stats() {
        println!("  Circuit: {}", key);
        println!("    State: {}", stats.state.name());
        println!("    Total requests: {}", stats.total_requests);
        println!("    Total failures: {}", stats.total_failures);
        println!("    Rejected: {}", stats.total_rejected);
        println!("    Error rate: {:.2}%", stats.error_rate * 100.0);
        println!("    Times opened: {}", stats.open_count);
        println!();
    }

    reaper.abort();
    Ok(())
}
