// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Link local address of the instance metadata service
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254";

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECS: u32 = 60;

/// Source of the instance's tags
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    async fn tag_keys(&self) -> Result<Vec<String>>;

    async fn tag_value(&self, key: &str) -> Result<String>;
}

/// IMDSv2 client. Tags are only visible when the instance allows tags in metadata.
#[derive(Debug, Clone)]
pub struct ImdsClient {
    endpoint: String,
    client: reqwest::Client,
}

impl ImdsClient {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(IMDS_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build metadata http client")?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn session_token(&self) -> Result<String> {
        let url = format!("{}/latest/api/token", self.endpoint);
        let token = self
            .client
            .put(&url)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS.to_string())
            .send()
            .await
            .context("failed to request metadata session token")?
            .error_for_status()?
            .text()
            .await?;
        Ok(token)
    }

    async fn get(&self, path: &str) -> Result<String> {
        let token = self.session_token().await?;
        let url = format!("{}/latest/meta-data/{path}", self.endpoint);
        debug!("fetching {url}");
        let body = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .with_context(|| format!("failed to fetch {path}"))?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl InstanceMetadata for ImdsClient {
    async fn tag_keys(&self) -> Result<Vec<String>> {
        let body = self.get("tags/instance").await?;
        Ok(parse_tag_keys(&body))
    }

    async fn tag_value(&self, key: &str) -> Result<String> {
        self.get(&format!("tags/instance/{key}")).await
    }
}

/// The service lists one key per line
fn parse_tag_keys(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
