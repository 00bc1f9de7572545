//! Client for the upstream IaaS block-reservation API.
//!
//! The API deals in "IP blocks": a reservation of `size` addresses in one
//! datacenter location. The provisioner only ever orders size-1 blocks; the
//! listing and deletion paths see whatever else lives in the account, which
//! is why the protected-block rule exists in [`crate::provisioner`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{ReputationError, Result};

/// Properties of an upstream IP block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpBlockProperties {
    pub name: String,
    pub location: String,
    pub size: u32,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// An upstream IP block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBlock {
    pub id: String,
    #[serde(default)]
    pub properties: IpBlockProperties,
}

#[derive(Debug, Deserialize)]
struct IpBlockList {
    #[serde(default)]
    items: Vec<IpBlock>,
}

#[derive(Debug, Serialize)]
struct ReserveBlockRequest<'a> {
    properties: ReserveBlockProperties<'a>,
}

#[derive(Debug, Serialize)]
struct ReserveBlockProperties<'a> {
    name: &'a str,
    location: &'a str,
    size: u32,
}

/// Operations the provisioner needs from the upstream provider.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn reserve_block(&self, location: &str, size: u32, name: &str) -> Result<IpBlock>;
    async fn get_block(&self, id: &str) -> Result<IpBlock>;
    async fn list_blocks(&self) -> Result<Vec<IpBlock>>;
    async fn delete_block(&self, id: &str) -> Result<()>;
}

/// HTTP client for the block API, authenticated with a bearer token.
pub struct BlockApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl BlockApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("ip-reputation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ReputationError::Upstream(err.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn check_status(status: StatusCode, context: &str) -> Result<()> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ReputationError::UpstreamRateLimited);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ReputationError::NotFound(context.to_string()));
        }
        if !status.is_success() {
            // Response bodies may echo request details; only the code is
            // reported.
            return Err(ReputationError::Upstream(format!(
                "{context}: unexpected status {status}"
            )));
        }
        Ok(())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ReputationError::Upstream("request timed out".into())
                } else {
                    ReputationError::Upstream(err.to_string())
                }
            })
    }
}

#[async_trait]
impl UpstreamClient for BlockApiClient {
    async fn reserve_block(&self, location: &str, size: u32, name: &str) -> Result<IpBlock> {
        info!(location, size, name, "reserving upstream IP block");

        let url = format!("{}/ipblocks", self.base_url);
        let body = ReserveBlockRequest {
            properties: ReserveBlockProperties {
                name,
                location,
                size,
            },
        };
        let response = self.send(self.http.post(&url).json(&body)).await?;
        Self::check_status(response.status(), "reserve block")?;

        let block: IpBlock = response
            .json()
            .await
            .map_err(|err| ReputationError::Upstream(format!("reserve block: {err}")))?;

        info!(
            block_id = %block.id,
            ips = ?block.properties.ips,
            "upstream IP block reserved"
        );
        Ok(block)
    }

    async fn get_block(&self, id: &str) -> Result<IpBlock> {
        let url = format!("{}/ipblocks/{id}", self.base_url);
        let response = self.send(self.http.get(&url)).await?;
        Self::check_status(response.status(), "get block")?;

        response
            .json()
            .await
            .map_err(|err| ReputationError::Upstream(format!("get block: {err}")))
    }

    async fn list_blocks(&self) -> Result<Vec<IpBlock>> {
        let url = format!("{}/ipblocks?depth=2", self.base_url);
        let response = self.send(self.http.get(&url)).await?;
        Self::check_status(response.status(), "list blocks")?;

        let list: IpBlockList = response
            .json()
            .await
            .map_err(|err| ReputationError::Upstream(format!("list blocks: {err}")))?;

        debug!(count = list.items.len(), "listed upstream IP blocks");
        Ok(list.items)
    }

    async fn delete_block(&self, id: &str) -> Result<()> {
        info!(block_id = %id, "deleting upstream IP block");

        let url = format!("{}/ipblocks/{id}", self.base_url);
        let response = self.send(self.http.delete(&url)).await?;
        Self::check_status(response.status(), "delete block")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = BlockApiClient::new("https://api.example.com/cloud/v6/", "tok").unwrap();
        assert_eq!(client.base_url, "https://api.example.com/cloud/v6");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            BlockApiClient::check_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            Err(ReputationError::UpstreamRateLimited)
        ));
        assert!(matches!(
            BlockApiClient::check_status(StatusCode::NOT_FOUND, "x"),
            Err(ReputationError::NotFound(_))
        ));
        assert!(matches!(
            BlockApiClient::check_status(StatusCode::BAD_GATEWAY, "x"),
            Err(ReputationError::Upstream(_))
        ));
        assert!(BlockApiClient::check_status(StatusCode::CREATED, "x").is_ok());
        assert!(BlockApiClient::check_status(StatusCode::NO_CONTENT, "x").is_ok());
    }

    #[test]
    fn block_deserializes_without_ips() {
        let block: IpBlock = serde_json::from_str(
            r#"{"id":"blk-1","properties":{"name":"n","location":"dc1","size":1}}"#,
        )
        .unwrap();
        assert!(block.properties.ips.is_empty());
        assert_eq!(block.properties.size, 1);
    }
}
