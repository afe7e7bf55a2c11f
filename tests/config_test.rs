use meshpool::config::{self, ClientConfig, PrefixMapping};
use meshpool::resolve::{ClusterResolver, PathPrefixServiceMap, StaticResolver};
use meshpool::Client;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
serviceId: com.networknt.orders-1.0.0
tls:
  verifyHostname: true
  loadKeyStore: true
  keyStore: client.keystore.pem
  keyStorePass: password
  keyPass: password
  tlsVersion: TLS
request:
  connectionPoolSize: 4
  connectionExpireTime: 120000
  timeout: 2500
  enableHttp2: false
  errorThreshold: 3
  resetTimeout: 1000
oauth:
  token:
    serverUrl: https://oauth.mesh:6882
    tokenPath: /oauth2/N2CMw0HGQXeLvC1wBfln2A/token
    clientId: orders
    clientSecret: s3cret
    tokenRenewBeforeExpired: 30000
services:
  com.networknt.petstore-1.0.0:
    - https://10.0.0.1:8443
    - https://10.0.0.2:8443
  com.networknt.petstore-1.0.0|dev:
    - https://dev.mesh:8443
pathPrefixService:
  /v1/pets: com.networknt.petstore-1.0.0
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("client.yml");
    fs::write(&config_path, yaml).unwrap();

    let config = config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.service_id.as_deref(), Some("com.networknt.orders-1.0.0"));
    assert!(config.tls.load_key_store);
    assert_eq!(config.tls.key_store.as_deref(), Some("client.keystore.pem"));
    assert_eq!(config.tls.tls_version, "TLS");

    assert_eq!(config.request.connection_pool_size, 4);
    assert_eq!(config.request.connection_expire_time(), Duration::from_secs(120));
    assert_eq!(config.request.timeout(), Duration::from_millis(2500));
    assert!(!config.request.enable_http2);
    assert_eq!(config.request.error_threshold, 3);

    let token = config.oauth.token.as_ref().unwrap();
    assert_eq!(token.client_id, "orders");
    assert_eq!(token.renew_before_expired(), Duration::from_secs(30));
    assert!(token.scope.is_empty());

    assert_eq!(config.services.len(), 2);
    assert!(matches!(config.path_prefix_service, Some(PrefixMapping::Map(_))));
}

/// Test the static cluster built from the `services` section
#[test]
fn test_services_feed_static_resolver() {
    let yaml = r#"
services:
  inventory:
    - http://10.0.0.1:8080
    - http://10.0.0.2:8080
"#;
    let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
    let resolver = StaticResolver::new(&config.services).unwrap();

    let mut seen: Vec<String> = (0..4)
        .map(|_| resolver.resolve("http", "inventory", None).unwrap())
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen, vec!["http://10.0.0.1:8080", "http://10.0.0.2:8080"]);
}

/// Test that the string form of the prefix mapping is accepted
#[test]
fn test_prefix_mapping_from_string() {
    let yaml = r#"
pathPrefixService: '{"/v1/pets": "petstore", "/v1/orders": "orders"}'
"#;
    let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
    let mapping = config.path_prefix_service.unwrap();
    let map = PathPrefixServiceMap::from_mapping(&mapping).unwrap();
    assert_eq!(map.service_for("/v1/orders/42"), Some("orders"));
    assert_eq!(map.service_for("/v1/pets"), Some("petstore"));
}

/// Test environment overrides on top of a file
#[test]
fn test_env_overrides() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("client.yml");
    fs::write(&config_path, "request:\n  timeout: 1000\n").unwrap();

    env::set_var("MESHPOOL_SERVICE_ID", "billing");
    env::set_var("MESHPOOL_POOL_SIZE", "7");
    env::set_var("MESHPOOL_VERIFY_HOSTNAME", "false");

    let config = config::load_config(Some(config_path.to_str().unwrap())).unwrap();

    env::remove_var("MESHPOOL_SERVICE_ID");
    env::remove_var("MESHPOOL_POOL_SIZE");
    env::remove_var("MESHPOOL_VERIFY_HOSTNAME");

    assert_eq!(config.service_id.as_deref(), Some("billing"));
    assert_eq!(config.request.connection_pool_size, 7);
    assert_eq!(config.request.timeout, 1000);
    assert!(!config.tls.verify_hostname);
}

/// Test that a missing file is an error, not defaults
#[test]
fn test_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = config::load_from_yaml(temp_dir.path().join("absent.yml"));
    assert!(result.is_err());
}

/// Test that a bad service URL is rejected when the client is built
#[tokio::test]
async fn test_client_rejects_bad_services() {
    let mut config = ClientConfig::new();
    config
        .services
        .insert("inventory".to_string(), vec!["::not-a-url".to_string()]);
    assert!(Client::new(config).is_err());
}

/// Test that the client derives its pool and breaker settings from config
#[tokio::test]
async fn test_client_uses_request_settings() {
    let mut config = ClientConfig::new();
    config.request.connection_pool_size = 3;
    config.request.connection_expire_time = 5000;
    config.request.error_threshold = 9;

    let client = Client::new(config).unwrap();
    assert_eq!(client.pool().config().max_connections, 3);
    assert_eq!(client.pool().config().max_idle_time, Duration::from_secs(5));
    assert_eq!(client.circuit_breaker().config().failure_threshold, 9);
    assert!(client.injector().is_none());
    assert!(client.resolver().is_none());
}
