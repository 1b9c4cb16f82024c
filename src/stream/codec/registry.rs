use apache_avro::Schema;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::stream::{
    codec::SchemaId,
    error::{Error, Result},
};

/// Source of writer schemas, keyed by the id embedded in each record
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Fetch the schema registered under `id`
    ///
    /// An id the registry does not know is a `SchemaMismatch`; transport
    /// failures are `SchemaRegistry` errors.
    async fn fetch_schema(&self, id: SchemaId) -> Result<Schema>;

    /// Verify the registry is reachable; called once at consumer startup
    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process registry for tests and local runs
pub struct MemorySchemaRegistry {
    schemas: RwLock<HashMap<SchemaId, Schema>>,
    next_id: AtomicU32,
}

impl MemorySchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a schema under the next free id
    pub fn register(&self, schema: Schema) -> SchemaId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.register_with_id(id, schema);
        id
    }

    /// Register a schema under a fixed id, replacing any previous one
    pub fn register_with_id(&self, id: SchemaId, schema: Schema) {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, schema);
    }
}

impl Default for MemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn fetch_schema(&self, id: SchemaId) -> Result<Schema> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SchemaMismatch(format!("unknown schema id {}", id)))
    }
}

#[derive(Debug, Deserialize)]
struct SchemaResponse {
    schema: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: SchemaId,
}

/// Client for a Confluent-compatible schema registry
///
/// Resolves ids with `GET {base_url}/schemas/ids/{id}`.
///
/// # Example
///
/// ```no_run
/// use consumer_pipeline::stream::codec::{HttpSchemaRegistry, SchemaRegistry};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = HttpSchemaRegistry::new("http://localhost:8081")?;
///     registry.check_connection().await?;
///     let schema = registry.fetch_schema(1).await?;
///     Ok(())
/// }
/// ```
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn schema_url(&self, id: SchemaId) -> String {
        format!("{}/schemas/ids/{}", self.base_url, id)
    }

    /// Register `schema` under `subject` and return its id
    ///
    /// Registering a schema the subject already holds returns the existing id.
    pub async fn register(&self, subject: &str, schema: &Schema) -> Result<SchemaId> {
        let body = serde_json::json!({ "schema": serde_json::to_string(schema)? });
        let response = self
            .client
            .post(format!("{}/subjects/{}/versions", self.base_url, subject))
            .header(reqwest::header::CONTENT_TYPE, "application/vnd.schemaregistry.v1+json")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SchemaRegistry(format!(
                "registry returned HTTP {} registering subject {}",
                status.as_u16(),
                subject
            )));
        }

        let registered: RegisterResponse = response.json().await?;
        debug!(subject, schema_id = registered.id, "registered schema");
        Ok(registered.id)
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn fetch_schema(&self, id: SchemaId) -> Result<Schema> {
        let response = self.client.get(self.schema_url(id)).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::SchemaMismatch(format!("unknown schema id {}", id)));
        }
        if !status.is_success() {
            return Err(Error::SchemaRegistry(format!(
                "registry returned HTTP {} for schema {}",
                status.as_u16(),
                id
            )));
        }

        // A readable but malformed answer will not change on retry
        let bytes = response.bytes().await?;
        let body: SchemaResponse = serde_json::from_slice(&bytes).map_err(|e| {
            Error::SchemaMismatch(format!("registry answer for schema {} is malformed: {}", id, e))
        })?;
        debug!(schema_id = id, "fetched writer schema from registry");

        Schema::parse_str(&body.schema)
            .map_err(|e| Error::SchemaMismatch(format!("schema {} is not valid Avro: {}", id, e)))
    }

    async fn check_connection(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/subjects", self.base_url))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::SchemaRegistry(format!(
                "registry health check returned HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}

/// Read-through schema cache shared by every decoder in the process
///
/// Schemas are immutable once registered, so entries never expire.
pub struct SchemaCache {
    registry: Arc<dyn SchemaRegistry>,
    schemas: RwLock<HashMap<SchemaId, Arc<Schema>>>,
}

impl SchemaCache {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Return the writer schema for `id`, fetching it on first use
    pub async fn resolve(&self, id: SchemaId) -> Result<Arc<Schema>> {
        if let Some(schema) = self.cached(id) {
            return Ok(schema);
        }

        let schema = Arc::new(self.registry.fetch_schema(id).await?);
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(schemas.entry(id).or_insert(schema)))
    }

    pub fn cached(&self, id: SchemaId) -> Option<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.schemas.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn check_connection(&self) -> Result<()> {
        self.registry.check_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const SCHEMA: &str = r#"{"type":"record","name":"Ping","fields":[{"name":"n","type":"long"}]}"#;

    /// Serve one canned HTTP response per connection
    async fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_memory_registry_assigns_ids() {
        let registry = MemorySchemaRegistry::new();
        let schema = Schema::parse_str(SCHEMA).unwrap();
        let first = registry.register(schema.clone());
        let second = registry.register(schema);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert!(registry.fetch_schema(first).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_registry_unknown_id_is_mismatch() {
        let registry = MemorySchemaRegistry::new();
        let err = registry.fetch_schema(99).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(ref msg) if msg.contains("99")));
    }

    #[tokio::test]
    async fn test_cache_fetches_once() {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let id = registry.register(Schema::parse_str(SCHEMA).unwrap());
        let cache = SchemaCache::new(registry.clone());

        assert!(cache.is_empty());
        let first = cache.resolve(id).await.unwrap();

        // Replacing the registry entry does not affect the cached copy
        registry.register_with_id(id, Schema::Long);
        let second = cache.resolve(id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_http_registry_trims_base_url() {
        let registry = HttpSchemaRegistry::new("http://registry:8081/").unwrap();
        assert_eq!(registry.base_url(), "http://registry:8081");
        assert_eq!(registry.schema_url(5), "http://registry:8081/schemas/ids/5");
    }

    #[tokio::test]
    async fn test_http_registry_fetch() {
        let body = serde_json::json!({ "schema": SCHEMA }).to_string();
        let url = serve_once("200 OK", body).await;

        let registry = HttpSchemaRegistry::new(url).unwrap();
        let schema = registry.fetch_schema(1).await.unwrap();
        assert!(matches!(schema, Schema::Record(_)));
    }

    #[tokio::test]
    async fn test_http_registry_not_found_is_mismatch() {
        let url = serve_once("404 Not Found", r#"{"error_code":40403}"#.to_string()).await;

        let registry = HttpSchemaRegistry::new(url).unwrap();
        let err = registry.fetch_schema(3).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_http_registry_register() {
        let url = serve_once("200 OK", r#"{"id":7}"#.to_string()).await;

        let registry = HttpSchemaRegistry::new(url).unwrap();
        let id = registry
            .register("notifications-value", &Schema::parse_str(SCHEMA).unwrap())
            .await
            .unwrap();
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn test_http_registry_invalid_schema_is_mismatch() {
        let url = serve_once("200 OK", r#"{"schema":"not avro"}"#.to_string()).await;

        let registry = HttpSchemaRegistry::new(url).unwrap();
        let err = registry.fetch_schema(4).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(ref msg) if msg.contains("not valid Avro")));
    }

    #[tokio::test]
    async fn test_http_registry_malformed_body_is_mismatch() {
        let url = serve_once("200 OK", "<html>maintenance</html>".to_string()).await;

        let registry = HttpSchemaRegistry::new(url).unwrap();
        let err = registry.fetch_schema(4).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(ref msg) if msg.contains("malformed")));
    }

    #[tokio::test]
    async fn test_http_registry_server_error() {
        let url = serve_once("500 Internal Server Error", "{}".to_string()).await;

        let registry = HttpSchemaRegistry::new(url).unwrap();
        let err = registry.fetch_schema(3).await.unwrap_err();
        assert!(matches!(err, Error::SchemaRegistry(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_http_registry_unreachable() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = HttpSchemaRegistry::new(format!("http://{}", addr)).unwrap();
        let err = registry.check_connection().await.unwrap_err();
        assert!(matches!(err, Error::SchemaRegistry(_)));
    }
}
