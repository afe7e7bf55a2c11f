//! Service id to URL resolution
//!
//! Discovery proper lives outside this crate; [`ClusterResolver`] is the seam.
//! [`StaticResolver`] serves configuration-driven setups by rotating through
//! the URLs listed under `services`.

pub mod prefix;

pub use prefix::PathPrefixServiceMap;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No {protocol} instance of service {service_id} (tag: {env_tag:?})")]
    NotFound {
        protocol: String,
        service_id: String,
        env_tag: Option<String>,
    },

    #[error("Invalid service mapping: {0}")]
    InvalidMapping(String),
}

/// Maps a service id, optionally narrowed by an environment tag, to a base URL
pub trait ClusterResolver: Send + Sync {
    fn resolve(
        &self,
        protocol: &str,
        service_id: &str,
        env_tag: Option<&str>,
    ) -> Result<String, ResolveError>;
}

struct Instance {
    scheme: String,
    base: String,
}

struct Cluster {
    instances: Vec<Instance>,
    next: AtomicUsize,
}

/// Round-robin over statically configured instances.
///
/// Keys are `serviceId` or `serviceId|envTag`. A tagged lookup only matches a
/// tagged entry.
pub struct StaticResolver {
    clusters: HashMap<String, Cluster>,
}

impl StaticResolver {
    pub fn new(services: &HashMap<String, Vec<String>>) -> Result<Self, ResolveError> {
        let mut clusters = HashMap::with_capacity(services.len());
        for (key, urls) in services {
            let mut instances = Vec::with_capacity(urls.len());
            for raw in urls {
                let url = Url::parse(raw)
                    .map_err(|e| ResolveError::InvalidMapping(format!("{} for {}: {}", raw, key, e)))?;
                if url.host_str().is_none() {
                    return Err(ResolveError::InvalidMapping(format!("{} for {}: missing host", raw, key)));
                }
                instances.push(Instance {
                    scheme: url.scheme().to_string(),
                    base: raw.trim_end_matches('/').to_string(),
                });
            }
            clusters.insert(
                key.clone(),
                Cluster {
                    instances,
                    next: AtomicUsize::new(0),
                },
            );
        }
        info!(services = clusters.len(), "Static cluster loaded");
        Ok(Self { clusters })
    }

    pub fn service_ids(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    fn key(service_id: &str, env_tag: Option<&str>) -> String {
        match env_tag {
            Some(tag) if !tag.is_empty() => format!("{}|{}", service_id, tag),
            _ => service_id.to_string(),
        }
    }
}

impl ClusterResolver for StaticResolver {
    fn resolve(
        &self,
        protocol: &str,
        service_id: &str,
        env_tag: Option<&str>,
    ) -> Result<String, ResolveError> {
        let not_found = || ResolveError::NotFound {
            protocol: protocol.to_string(),
            service_id: service_id.to_string(),
            env_tag: env_tag.map(str::to_string),
        };

        let cluster = self
            .clusters
            .get(&Self::key(service_id, env_tag))
            .ok_or_else(not_found)?;
        let matching: Vec<&Instance> = cluster
            .instances
            .iter()
            .filter(|i| i.scheme.eq_ignore_ascii_case(protocol))
            .collect();
        if matching.is_empty() {
            return Err(not_found());
        }

        let index = cluster.next.fetch_add(1, Ordering::Relaxed) % matching.len();
        let base = matching[index].base.clone();
        debug!(service_id, url = %base, "Resolved service");
        Ok(base)
    }
}
