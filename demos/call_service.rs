//! Calling a downstream service by id
//!
//! Loads `client.yml` (or the path given as the first argument), resolves the
//! service through the static `services` map and sends one decorated request.
//!
//! Run with:
//! ```
//! RUST_LOG=meshpool=debug cargo run --example call_service -- client.yml petstore /v1/pets
//! ```

use hyper::Request;
use meshpool::auth::RequestContext;
use meshpool::{config, Client};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "client.yml".to_string());
    let service_id = args.next().unwrap_or_else(|| "petstore".to_string());
    let path = args.next().unwrap_or_else(|| "/".to_string());

    let config = config::load_config(Some(&config_path))?;
    let protocol = if config.tls.load_trust_store || config.tls.load_default_trust_store {
        "https"
    } else {
        "http"
    };
    let client = Client::new(config)?;

    let context = RequestContext::new();
    let request = client.decorate(Request::get(path.as_str()).body(())?, &context).await?;
    let response = client
        .call_service(protocol, &service_id, None, request, None)
        .await?;

    info!(status = %response.status(), bytes = response.body.len(), "Service responded");
    println!("{}", response.body_text());

    for (authority, stats) in client.pool().get_all_stats() {
        info!(
            authority = %authority,
            created = stats.total_created,
            idle = stats.idle_connections,
            "Pool state"
        );
    }
    Ok(())
}
