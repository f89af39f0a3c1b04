//! Minimal Consul KV client
//!
//! Covers the handful of `/v1/kv` calls certsync needs: recursive reads of
//! instance documents, raw reads, writes and deletes of certificate bundles.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use certsync_config::ConsulConfig;

use crate::error::ConsulError;

/// Header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// One entry of a `GET /v1/kv/<prefix>?recurse` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    /// Full key
    pub key: String,
    /// Base64-encoded value; `null` for folder keys
    #[serde(default)]
    pub value: Option<String>,
}

impl KvPair {
    /// Decode the base64 value
    pub fn decoded_value(&self) -> Result<Option<Vec<u8>>, ConsulError> {
        self.value
            .as_deref()
            .map(|v| STANDARD.decode(v))
            .transpose()
            .map_err(|source| ConsulError::Decode {
                key: self.key.clone(),
                source,
            })
    }
}

/// Consul KV client
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
}

impl ConsulClient {
    /// Create a client for the configured agent
    pub fn new(config: &ConsulConfig) -> Result<Self, ConsulError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|source| ConsulError::Http {
                url: config.address.clone(),
                source,
            })?;

        debug!(address = %config.address, has_token = config.token.is_some(), "Created Consul client");

        Ok(Self {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.address, key.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, ConsulError> {
        builder.send().await.map_err(|source| ConsulError::Http {
            url: url.to_string(),
            source,
        })
    }

    /// Read every key under `prefix`. A missing prefix yields an empty list.
    pub async fn get_recurse(&self, prefix: &str) -> Result<Vec<KvPair>, ConsulError> {
        let url = format!("{}?recurse=true", self.kv_url(prefix));
        trace!(url = %url, "Reading Consul prefix");

        let response = self.send(self.request(reqwest::Method::GET, &url), &url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                response
                    .json::<Vec<KvPair>>()
                    .await
                    .map_err(|source| ConsulError::Http { url, source })
            }
            status => Err(ConsulError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    /// List keys directly under `prefix`. Nested folders come back with a
    /// trailing `/`. A missing prefix yields an empty list.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ConsulError> {
        let url = format!("{}?keys=true&separator=/", self.kv_url(prefix));
        trace!(url = %url, "Listing Consul keys");

        let response = self.send(self.request(reqwest::Method::GET, &url), &url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => response
                .json::<Vec<String>>()
                .await
                .map_err(|source| ConsulError::Http { url, source }),
            status => Err(ConsulError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    /// Read the raw value of `key`
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, ConsulError> {
        let url = format!("{}?raw=true", self.kv_url(key));
        trace!(url = %url, "Reading Consul key");

        let response = self.send(self.request(reqwest::Method::GET, &url), &url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| ConsulError::Http { url, source })?;
                Ok(Some(body.to_vec()))
            }
            status => Err(ConsulError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    /// Write `value` to `key`
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ConsulError> {
        let url = self.kv_url(key);
        trace!(url = %url, bytes = value.len(), "Writing Consul key");

        let response = self
            .send(self.request(reqwest::Method::PUT, &url).body(value), &url)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConsulError::Status {
                url,
                status: status.as_u16(),
            });
        }

        // Consul answers `true` or `false`
        let body = response
            .text()
            .await
            .map_err(|source| ConsulError::Http { url, source })?;
        if body.trim() == "true" {
            Ok(())
        } else {
            Err(ConsulError::WriteRejected {
                key: key.to_string(),
            })
        }
    }

    /// Delete `key`. Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), ConsulError> {
        let url = self.kv_url(key);
        trace!(url = %url, "Deleting Consul key");

        let response = self
            .send(self.request(reqwest::Method::DELETE, &url), &url)
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ConsulError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token: Option<&str>) -> ConsulClient {
        let config = ConsulConfig {
            address: format!("{}/", server.uri()),
            token: token.map(str::to_string),
            ..Default::default()
        };
        ConsulClient::new(&config).unwrap()
    }

    #[test]
    fn test_kv_url() {
        let config = ConsulConfig {
            address: "http://consul.local:8500/".to_string(),
            ..Default::default()
        };
        let client = ConsulClient::new(&config).unwrap();
        assert_eq!(
            client.kv_url("/certs/a.example.com"),
            "http://consul.local:8500/v1/kv/certs/a.example.com"
        );
    }

    #[test]
    fn test_decode_value() {
        let pair = KvPair {
            key: "k".to_string(),
            value: Some(STANDARD.encode("hello")),
        };
        assert_eq!(pair.decoded_value().unwrap(), Some(b"hello".to_vec()));

        let folder = KvPair {
            key: "k/".to_string(),
            value: None,
        };
        assert_eq!(folder.decoded_value().unwrap(), None);

        let broken = KvPair {
            key: "k".to_string(),
            value: Some("***".to_string()),
        };
        assert!(matches!(
            broken.decoded_value(),
            Err(ConsulError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_recurse_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/ocim/instances"))
            .and(query_param("recurse", "true"))
            .and(header(TOKEN_HEADER, "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Key": "ocim/instances/1", "Value": STANDARD.encode("{}"), "Flags": 0}
            ])))
            .mount(&server)
            .await;

        let pairs = client_for(&server, Some("secret"))
            .get_recurse("ocim/instances")
            .await
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "ocim/instances/1");
    }

    #[tokio::test]
    async fn test_get_recurse_missing_prefix_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let pairs = client_for(&server, None).get_recurse("nothing").await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_get_recurse_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = client_for(&server, None).get_recurse("ocim/instances").await;
        assert!(matches!(result, Err(ConsulError::Status { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_put_and_rejected_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/certs/a.example.com"))
            .and(body_bytes(b"PEM".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/certs/b.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        client.put("certs/a.example.com", b"PEM".to_vec()).await.unwrap();
        assert!(matches!(
            client.put("certs/b.example.com", b"PEM".to_vec()).await,
            Err(ConsulError::WriteRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/certs/"))
            .and(query_param("keys", "true"))
            .and(query_param("separator", "/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!(["certs/a.example.com"])),
            )
            .mount(&server)
            .await;

        let keys = client_for(&server, None).list_keys("certs/").await.unwrap();
        assert_eq!(keys, vec!["certs/a.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_get_raw_and_delete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/certs/a.example.com"))
            .and(query_param("raw", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PEM".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/certs/missing.example.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/kv/certs/a.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        assert_eq!(
            client.get_raw("certs/a.example.com").await.unwrap(),
            Some(b"PEM".to_vec())
        );
        assert_eq!(client.get_raw("certs/missing.example.com").await.unwrap(), None);
        client.delete("certs/a.example.com").await.unwrap();
    }
}
