//! Remote key/value config store (Consul-style KV over HTTP).
//!
//! Keys live under `mq2wsbridge/{section}/{key}`. Reads use `?raw` so the body
//! is the bare value; a 404 means the key is absent.

use reqwest::StatusCode;
use tracing::{debug, info};

use crate::common::error::ConfigError;
use crate::config::keys::RECOGNIZED_KEYS;
use crate::config::source::{ConfigSource, MemorySource};

/// Key prefix inside the store.
const KEY_PREFIX: &str = "mq2wsbridge";

/// Client for the remote config store.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn key_url(&self, section: &str, key: &str) -> String {
        format!("{}/v1/kv/{}/{}/{}", self.base_url, KEY_PREFIX, section, key)
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    /// Read one value. Empty values are reported as absent.
    pub async fn fetch(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
        let name = format!("{}.{}", section, key);
        let url = format!("{}?raw", self.key_url(section, key));

        let response = self
            .with_token(self.client.get(&url))
            .send()
            .await
            .map_err(|e| remote_error(&name, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Remote config has no value for {}", name);
            return Ok(None);
        }

        let response = response
            .error_for_status()
            .map_err(|e| remote_error(&name, e))?;
        let body = response.text().await.map_err(|e| remote_error(&name, e))?;
        let value = body.trim().to_string();

        Ok((!value.is_empty()).then_some(value))
    }

    /// Write one value, overwriting any existing one.
    pub async fn put(&self, section: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        let name = format!("{}.{}", section, key);

        self.with_token(self.client.put(self.key_url(section, key)))
            .body(value.to_string())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| remote_error(&name, e))?;

        Ok(())
    }

    /// Fetch every recognized key into an in-memory source.
    pub async fn snapshot(&self) -> Result<MemorySource, ConfigError> {
        let mut source = MemorySource::new(format!("remote store '{}'", self.base_url));
        for (section, key) in RECOGNIZED_KEYS {
            if let Some(value) = self.fetch(section, key).await? {
                source.set(section, key, value);
            }
        }
        info!(
            "Loaded {} settings from remote store {}",
            source.len(),
            self.base_url
        );
        Ok(source)
    }

    /// Copy every recognized key present in `source` into the store.
    ///
    /// Existing remote values are overwritten. Returns the number of keys
    /// written.
    pub async fn migrate(&self, source: &dyn ConfigSource) -> Result<usize, ConfigError> {
        let mut written = 0;
        for (section, key) in RECOGNIZED_KEYS {
            if let Some(value) = source.get(section, key) {
                self.put(section, key, &value).await?;
                written += 1;
            }
        }
        info!(
            "Migrated {} settings from {} to remote store {}",
            written,
            source.describe(),
            self.base_url
        );
        Ok(written)
    }
}

fn remote_error(key: &str, e: reqwest::Error) -> ConfigError {
    ConfigError::Remote {
        key: key.to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Kv = Arc<Mutex<HashMap<String, String>>>;

    /// Minimal KV endpoint: GET returns the stored body or 404, PUT stores it.
    async fn spawn_kv_server(kv: Kv) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let kv = kv.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let header_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };

                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    while buf.len() < header_end + content_length {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let mut parts = head.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let target = parts.next().unwrap_or_default();
                    let path = target.split('?').next().unwrap_or_default().to_string();
                    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

                    let (status, reply) = match method.as_str() {
                        "PUT" => {
                            kv.lock().insert(path, body);
                            ("200 OK", "true".to_string())
                        }
                        _ => match kv.lock().get(&path) {
                            Some(value) => ("200 OK", value.clone()),
                            None => ("404 Not Found", String::new()),
                        },
                    };
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        reply.len(),
                        reply
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_key_url_layout() {
        let store = RemoteStore::new("http://consul:8500/", None);
        assert_eq!(
            store.key_url("aws_mq", "mq_port"),
            "http://consul:8500/v1/kv/mq2wsbridge/aws_mq/mq_port"
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_key_is_none() {
        let base = spawn_kv_server(Kv::default()).await;
        let store = RemoteStore::new(base, None);

        assert_eq!(store.fetch("ws_api", "client_id").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_migrate_then_snapshot() {
        let kv = Kv::default();
        let base = spawn_kv_server(kv.clone()).await;
        let store = RemoteStore::new(base, Some("token".to_string()));

        let file = MemorySource::new("file")
            .with("ws_api", "client_id", "client-1")
            .with("aws_mq", "mq_port", "5671")
            .with("unrelated", "key", "ignored");

        let written = store.migrate(&file).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            kv.lock().get("/v1/kv/mq2wsbridge/ws_api/client_id").cloned(),
            Some("client-1".to_string())
        );

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("aws_mq", "mq_port").as_deref(), Some("5671"));
    }

    #[tokio::test]
    async fn test_migrate_overwrites_existing_values() {
        let kv = Kv::default();
        kv.lock().insert(
            "/v1/kv/mq2wsbridge/aws_mq/mq_consumer_tag".to_string(),
            "old".to_string(),
        );
        let base = spawn_kv_server(kv.clone()).await;
        let store = RemoteStore::new(base, None);

        let file = MemorySource::new("file").with("aws_mq", "mq_consumer_tag", "new");
        store.migrate(&file).await.unwrap();

        assert_eq!(
            store.fetch("aws_mq", "mq_consumer_tag").await.unwrap().as_deref(),
            Some("new")
        );
    }
}
