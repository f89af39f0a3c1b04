//! Domain groups from Consul instance documents
//!
//! Each key under the instances prefix holds one JSON document per
//! provisioned instance:
//!
//! ```json
//! {"name": "Demo", "domains": ["demo.example.com", "studio.demo.example.com"]}
//! ```
//!
//! Every document with a `domains` array contributes one domain group.
//! Other fields are ignored.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use super::{DomainSource, SourceGroups};
use crate::consul::{ConsulClient, KvPair};
use crate::error::SourceError;

/// Reads desired domain groups from Consul KV
#[derive(Debug, Clone)]
pub struct ConsulDomainSource {
    client: ConsulClient,
    prefix: String,
}

impl ConsulDomainSource {
    pub fn new(client: ConsulClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// Extract the raw domain list of one instance document.
    ///
    /// Returns `Ok(None)` for entries that carry no domain list.
    fn domains_from_pair(pair: &KvPair) -> Result<Option<Vec<String>>, SourceError> {
        let Some(raw) = pair.decoded_value().map_err(SourceError::Consul)? else {
            trace!(key = %pair.key, "Skipping folder key");
            return Ok(None);
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            trace!(key = %pair.key, "Skipping empty value");
            return Ok(None);
        }

        let document: Value =
            serde_json::from_slice(&raw).map_err(|source| SourceError::InvalidDocument {
                key: pair.key.clone(),
                source,
            })?;

        let Some(domains) = document.as_object().and_then(|obj| obj.get("domains")) else {
            trace!(key = %pair.key, "Instance document has no domains");
            return Ok(None);
        };

        let domains: Vec<String> = match domains.as_array() {
            Some(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| SourceError::MalformedDomains {
                    key: pair.key.clone(),
                })?,
            None if domains.is_null() => {
                trace!(key = %pair.key, "Instance document has null domains");
                return Ok(None);
            }
            None => {
                return Err(SourceError::MalformedDomains {
                    key: pair.key.clone(),
                })
            }
        };
        Ok(Some(domains))
    }
}

#[async_trait]
impl DomainSource for ConsulDomainSource {
    async fn list_desired_groups(&self) -> Result<SourceGroups, SourceError> {
        let pairs = self.client.get_recurse(&self.prefix).await?;

        let mut groups = SourceGroups::default();
        for pair in &pairs {
            if let Some(domains) = Self::domains_from_pair(pair)? {
                groups.push_raw(&pair.key, &domains);
            }
        }

        debug!(
            prefix = %self.prefix,
            keys = pairs.len(),
            groups = groups.len(),
            rejected = groups.rejected.len(),
            "Read domain groups from Consul"
        );
        Ok(groups)
    }
}
