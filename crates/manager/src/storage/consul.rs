//! Certificate storage in Consul KV
//!
//! Each certificate lives at `<prefix>/<canonical name>` as the raw PEM
//! bundle, where load balancer templates can pick it up.

use async_trait::async_trait;
use tracing::{debug, info};

use certsync_common::CertName;

use super::CertificateStorage;
use crate::consul::ConsulClient;
use crate::error::StorageError;

/// Certificate storage under a Consul KV prefix
#[derive(Debug, Clone)]
pub struct ConsulCertificateStorage {
    client: ConsulClient,
    prefix: String,
}

impl ConsulCertificateStorage {
    pub fn new(client: ConsulClient, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { client, prefix }
    }

    fn key(&self, name: &CertName) -> Result<String, StorageError> {
        let name = name.as_str();
        if name.is_empty() || name.contains('/') {
            return Err(StorageError::InvalidKey(name.to_string()));
        }
        Ok(format!("{}/{}", self.prefix, name))
    }
}

#[async_trait]
impl CertificateStorage for ConsulCertificateStorage {
    async fn put(&self, name: &CertName, data: &[u8]) -> Result<(), StorageError> {
        let key = self.key(name)?;
        self.client.put(&key, data.to_vec()).await?;
        info!(cert_name = %name, key = %key, "Stored certificate in Consul");
        Ok(())
    }

    async fn delete(&self, name: &CertName) -> Result<(), StorageError> {
        let key = self.key(name)?;
        self.client.delete(&key).await?;
        info!(cert_name = %name, key = %key, "Deleted certificate from Consul");
        Ok(())
    }

    async fn exists(&self, name: &CertName) -> Result<bool, StorageError> {
        let key = self.key(name)?;
        let exists = self.client.get_raw(&key).await?.is_some();
        debug!(cert_name = %name, exists = exists, "Checked certificate in Consul");
        Ok(exists)
    }

    async fn get(&self, name: &CertName) -> Result<Option<Vec<u8>>, StorageError> {
        let key = self.key(name)?;
        Ok(self.client.get_raw(&key).await?)
    }

    async fn list_names(&self) -> Result<Vec<CertName>, StorageError> {
        let folder = format!("{}/", self.prefix);
        let mut names: Vec<CertName> = self
            .client
            .list_keys(&folder)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&folder))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(CertName::new)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certsync_config::ConsulConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage_for(server: &MockServer) -> ConsulCertificateStorage {
        let config = ConsulConfig {
            address: server.uri(),
            ..Default::default()
        };
        ConsulCertificateStorage::new(ConsulClient::new(&config).unwrap(), "/certs/")
    }

    #[test]
    fn test_key_layout() {
        let config = ConsulConfig::default();
        let storage = ConsulCertificateStorage::new(ConsulClient::new(&config).unwrap(), "certs/");

        assert_eq!(
            storage.key(&CertName::new("a.example.com")).unwrap(),
            "certs/a.example.com"
        );
        assert!(storage.key(&CertName::new("a/b")).is_err());
    }

    #[tokio::test]
    async fn test_put_and_exists() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/certs/a.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/certs/a.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PEM".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/certs/b.example.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        storage
            .put(&CertName::new("a.example.com"), b"PEM")
            .await
            .unwrap();

        assert!(storage.exists(&CertName::new("a.example.com")).await.unwrap());
        assert!(!storage.exists(&CertName::new("b.example.com")).await.unwrap());
        assert_eq!(
            storage.get(&CertName::new("a.example.com")).await.unwrap(),
            Some(b"PEM".to_vec())
        );
    }

    #[tokio::test]
    async fn test_list_names_skips_nested_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/certs/"))
            .and(query_param("keys", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                "certs/",
                "certs/b.example.com",
                "certs/a.example.com",
                "certs/archive/"
            ])))
            .mount(&server)
            .await;

        let names = storage_for(&server).list_names().await.unwrap();
        assert_eq!(
            names,
            vec![CertName::new("a.example.com"), CertName::new("b.example.com")]
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let result = storage.put(&CertName::new("a.example.com"), b"PEM").await;
        assert!(matches!(result, Err(StorageError::Consul(_))));
    }
}
