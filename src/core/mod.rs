//! Client context shared by every outgoing call
//!
//! A [`Client`] owns one connection pool, one trust context, one circuit
//! breaker and, when OAuth is configured, one token cache. Clones share all of
//! them, so connection reuse and token caching span every clone.

use crate::auth::{
    AuthHeaderInjector, ClientCredentials, InjectorSettings, OAuth2TokenSource, RequestContext,
    TokenCache, TokenSource,
};
use crate::config::{ClientConfig, TlsConfig};
use crate::dispatch::RequestDispatcher;
use crate::error::ClientError;
use crate::pool::{
    Authority, CircuitBreaker, CircuitBreakerConfig, ConnectionPool, ConnectionToken, PoolConfig,
};
use crate::resolve::{ClusterResolver, PathPrefixServiceMap, ResolveError, StaticResolver};
use crate::tls::{SharedTrustContext, TrustContext, TrustContextBuilder};
use crate::transport::{ClientResponse, TransportRegistry};
use bytes::Bytes;
use hyper::{Request, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Renewal margin used when a token source is supplied without `oauth.token`
const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(60);

/// Assembles a [`Client`] from configuration plus optional collaborators
pub struct ClientBuilder {
    config: ClientConfig,
    transports: Option<TransportRegistry>,
    token_source: Option<Arc<dyn TokenSource>>,
    resolver: Option<Arc<dyn ClusterResolver>>,
    trust_builder: Option<TrustContextBuilder>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transports: None,
            token_source: None,
            resolver: None,
            trust_builder: None,
        }
    }

    /// Replace the default `http`/`https` transports
    pub fn transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Issue tokens from `source` instead of the configured token endpoint
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Resolve service ids with `resolver` instead of the static `services` map
    pub fn resolver(mut self, resolver: Arc<dyn ClusterResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn trust_builder(mut self, builder: TrustContextBuilder) -> Self {
        self.trust_builder = Some(builder);
        self
    }

    pub fn build(self) -> Result<Client, ClientError> {
        let config = Arc::new(self.config);
        let request = &config.request;

        let alpn = if request.enable_http2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };
        let trust_builder = self
            .trust_builder
            .unwrap_or_default()
            .with_alpn(alpn);
        let trust = Arc::new(SharedTrustContext::new(trust_builder, config.tls.clone()));

        let pool = Arc::new(ConnectionPool::new(
            PoolConfig::from_request(request),
            self.transports.unwrap_or_default(),
            trust,
        ));
        let dispatcher = RequestDispatcher::new(Arc::clone(&pool), request.timeout());
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_request(request)));

        let injector = Self::injector(&config, self.token_source, &dispatcher)?;

        let resolver = match self.resolver {
            Some(resolver) => Some(resolver),
            None if !config.services.is_empty() => {
                Some(Arc::new(StaticResolver::new(&config.services)?) as Arc<dyn ClusterResolver>)
            }
            None => None,
        };

        let prefixes = match &config.path_prefix_service {
            Some(mapping) => PathPrefixServiceMap::from_mapping(mapping)?,
            None => PathPrefixServiceMap::default(),
        };

        info!(
            pool_size = request.connection_pool_size,
            timeout_ms = request.timeout,
            oauth = injector.is_some(),
            resolver = resolver.is_some(),
            "Client initialized"
        );

        Ok(Client {
            config,
            pool,
            dispatcher,
            breaker,
            injector,
            resolver,
            prefixes: Arc::new(prefixes),
        })
    }

    fn injector(
        config: &ClientConfig,
        source: Option<Arc<dyn TokenSource>>,
        dispatcher: &RequestDispatcher,
    ) -> Result<Option<Arc<AuthHeaderInjector>>, ClientError> {
        let settings = InjectorSettings::from_config(config);
        let (source, credentials, renew_before) = match (&config.oauth.token, source) {
            (Some(token), source) => {
                let source: Arc<dyn TokenSource> = match source {
                    Some(source) => source,
                    None => Arc::new(OAuth2TokenSource::new(token, dispatcher.clone())?),
                };
                (
                    source,
                    ClientCredentials::from_config(token),
                    token.renew_before_expired(),
                )
            }
            (None, Some(source)) => {
                let client_id = config.service_id.clone().unwrap_or_default();
                (
                    source,
                    ClientCredentials::new(client_id, "", Vec::new()),
                    DEFAULT_RENEW_BEFORE,
                )
            }
            (None, None) => return Ok(None),
        };

        let cache = Arc::new(TokenCache::new(source, renew_before));
        Ok(Some(Arc::new(AuthHeaderInjector::new(cache, credentials, settings))))
    }
}

/// Outbound HTTP client for service-to-service calls
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool>,
    dispatcher: RequestDispatcher,
    breaker: Arc<CircuitBreaker>,
    injector: Option<Arc<AuthHeaderInjector>>,
    resolver: Option<Arc<dyn ClusterResolver>>,
    prefixes: Arc<PathPrefixServiceMap>,
}

impl Client {
    /// A client with default transports and collaborators derived from `config`
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Send `request` to the authority named by its URI, under the circuit
    /// breaker for that authority.
    ///
    /// Only failures of the downstream exchange itself (see
    /// [`ClientError::is_retryable`]) count toward opening the circuit.
    pub async fn call(
        &self,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, ClientError> {
        let authority = Authority::from_uri(request.uri())?;
        let key = authority.to_string();
        let dispatcher = &self.dispatcher;
        let result = self
            .breaker
            .call_counting(
                &key,
                || dispatcher.call(&authority, request, body),
                ClientError::is_retryable,
            )
            .await;
        Ok(result?)
    }

    /// Decorate `request` with auth and propagation headers, then send it
    pub async fn call_with_context(
        &self,
        request: Request<()>,
        body: Option<Bytes>,
        context: &RequestContext,
    ) -> Result<ClientResponse, ClientError> {
        let request = self.decorate(request, context).await?;
        self.call(request, body).await
    }

    /// Apply the auth header injector, if OAuth is configured
    pub async fn decorate(
        &self,
        request: Request<()>,
        context: &RequestContext,
    ) -> Result<Request<()>, ClientError> {
        match &self.injector {
            Some(injector) => Ok(injector.decorate(request, context).await?),
            None => {
                debug!("No token configuration; sending request undecorated");
                Ok(request)
            }
        }
    }

    /// Resolve `service_id` to a base URL and send `request` there.
    ///
    /// Only the path and query of the request URI are kept.
    pub async fn call_service(
        &self,
        protocol: &str,
        service_id: &str,
        env_tag: Option<&str>,
        mut request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, ClientError> {
        let resolver = self.resolver.as_ref().ok_or_else(|| ResolveError::NotFound {
            protocol: protocol.to_string(),
            service_id: service_id.to_string(),
            env_tag: env_tag.map(str::to_string),
        })?;
        let base = resolver.resolve(protocol, service_id, env_tag)?;

        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", base, path);
        let uri = target
            .parse::<Uri>()
            .map_err(|e| ClientError::InvalidRequest(format!("{}: {}", target, e)))?;
        debug!(service_id, uri = %uri, "Calling service");
        *request.uri_mut() = uri;

        self.call(request, body).await
    }

    /// Route by the configured path prefix mapping, then call the service
    pub async fn call_by_path(
        &self,
        protocol: &str,
        env_tag: Option<&str>,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, ClientError> {
        let path = request.uri().path();
        let service_id = self
            .prefixes
            .service_for(path)
            .ok_or_else(|| ClientError::InvalidRequest(format!("no service mapped for {}", path)))?
            .to_string();
        self.call_service(protocol, &service_id, env_tag, request, body)
            .await
    }

    /// Borrow a pooled connection to `authority` for manual use
    pub async fn borrow(&self, authority: &Authority) -> Result<ConnectionToken, ClientError> {
        if authority.is_secure() {
            self.pool.trust().get().await?;
        }
        Ok(self
            .pool
            .borrow(authority, self.config.request.timeout())
            .await?)
    }

    pub fn restore(&self, token: ConnectionToken) -> Result<(), ClientError> {
        Ok(self.pool.restore(token)?)
    }

    pub fn discard(&self, token: ConnectionToken) -> Result<(), ClientError> {
        Ok(self.pool.discard(token)?)
    }

    /// The TLS context, built on first use
    pub async fn trust_context(&self) -> Result<Arc<TrustContext>, ClientError> {
        Ok(self.pool.trust().get().await?)
    }

    /// Rebuild the TLS context, optionally from new settings.
    ///
    /// Connections already pooled keep the context they were opened with.
    pub async fn reload_trust_context(
        &self,
        tls: Option<TlsConfig>,
    ) -> Result<Arc<TrustContext>, ClientError> {
        Ok(self.pool.trust().reload(tls).await?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn injector(&self) -> Option<&Arc<AuthHeaderInjector>> {
        self.injector.as_ref()
    }

    pub fn resolver(&self) -> Option<&Arc<dyn ClusterResolver>> {
        self.resolver.as_ref()
    }

    pub fn path_prefixes(&self) -> &PathPrefixServiceMap {
        &self.prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::transport::MemoryTransport;
    use hyper::header::AUTHORIZATION;
    use hyper::StatusCode;
    use std::collections::HashMap;

    fn echo_transport() -> MemoryTransport {
        MemoryTransport::new(|req, _body| {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            Ok(ClientResponse::new(
                StatusCode::OK,
                format!("{} {}", req.uri(), auth),
            ))
        })
    }

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new();
        config.services = HashMap::from([(
            "petstore".to_string(),
            vec!["http://pets.mesh:8080".to_string()],
        )]);
        config.path_prefix_service = Some(crate::config::PrefixMapping::Text(
            "/v1/pets=petstore".to_string(),
        ));
        config
    }

    fn client(config: ClientConfig, transport: &MemoryTransport) -> Client {
        Client::builder(config)
            .transports(TransportRegistry::single(Arc::new(transport.clone())))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_reuses_connection() {
        let transport = echo_transport();
        let client = client(config(), &transport);

        for _ in 0..3 {
            let request = Request::get("http://pets.mesh:8080/v1/pets").body(()).unwrap();
            let response = client.call(request, None).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.send_count(), 3);
    }

    #[tokio::test]
    async fn test_call_service_rewrites_uri() {
        let transport = echo_transport();
        let client = client(config(), &transport);

        let request = Request::get("/v1/pets?limit=2").body(()).unwrap();
        let response = client
            .call_service("http", "petstore", None, request, None)
            .await
            .unwrap();
        assert!(response
            .body_text()
            .starts_with("http://pets.mesh:8080/v1/pets?limit=2"));

        let request = Request::get("/v1/pets/7").body(()).unwrap();
        let response = client.call_by_path("http", None, request, None).await.unwrap();
        assert!(response.body_text().starts_with("http://pets.mesh:8080/v1/pets/7"));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let transport = echo_transport();
        let client = client(config(), &transport);

        let request = Request::get("/v1/orders").body(()).unwrap();
        let err = client
            .call_service("http", "orders", None, request, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Resolve(_)));

        let request = Request::get("/v2/orders").body(()).unwrap();
        let err = client.call_by_path("http", None, request, None).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_relative_uri_rejected() {
        let transport = echo_transport();
        let client = client(config(), &transport);
        let request = Request::get("/v1/pets").body(()).unwrap();
        let err = client.call(request, None).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_call_with_context_adds_token() {
        let transport = echo_transport();
        let client = Client::builder(config())
            .transports(TransportRegistry::single(Arc::new(transport.clone())))
            .token_source(Arc::new(StaticTokenSource::new("cc", None)))
            .build()
            .unwrap();
        assert!(client.injector().is_some());

        let request = Request::get("http://pets.mesh:8080/v1/pets").body(()).unwrap();
        let response = client
            .call_with_context(request, None, &RequestContext::new())
            .await
            .unwrap();
        assert!(response.body_text().ends_with("Bearer cc"));
    }

    #[tokio::test]
    async fn test_manual_borrow_restore() {
        let transport = echo_transport();
        let client = client(config(), &transport);
        let authority = Authority::new("http", "pets.mesh", 8080);

        let token = client.borrow(&authority).await.unwrap();
        let id = token.id();
        client.restore(token).unwrap();

        let token = client.borrow(&authority).await.unwrap();
        assert_eq!(token.id(), id);
        client.discard(token).unwrap();
        assert_eq!(transport.connect_count(), 1);
    }
}
