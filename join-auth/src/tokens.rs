// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fs_err as fs;
use parking_lot::Mutex;
use tracing::debug;

use crate::types::ProvisionToken;

/// Length of generated tokens in bytes, before hex encoding
pub const TOKEN_LEN_BYTES: usize = 16;

/// Generate a random hex encoded token secret
pub fn generate_token() -> Result<String> {
    let mut buf = [0u8; TOKEN_LEN_BYTES];
    getrandom::fill(&mut buf).map_err(|err| anyhow!("failed to generate token: {err}"))?;
    Ok(hex::encode(buf))
}

/// Provisioning token storage. Lookups are never cached.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ProvisionToken>>;

    async fn list(&self) -> Result<Vec<ProvisionToken>>;

    async fn upsert(&self, token: ProvisionToken) -> Result<()>;

    /// Returns false if there was no such token.
    ///
    /// Must be atomic: of concurrent deletes of one token exactly one returns true, which
    /// is how single use tokens are consumed.
    async fn delete(&self, name: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemTokenStore {
    tokens: Mutex<BTreeMap<String, ProvisionToken>>,
}

impl MemTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemTokenStore {
    async fn get(&self, name: &str) -> Result<Option<ProvisionToken>> {
        Ok(self.tokens.lock().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ProvisionToken>> {
        Ok(self.tokens.lock().values().cloned().collect())
    }

    async fn upsert(&self, token: ProvisionToken) -> Result<()> {
        self.tokens.lock().insert(token.name.clone(), token);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.tokens.lock().remove(name).is_some())
    }
}

/// Tokens kept in a JSON file, re-read on every access
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, ProvisionToken>> {
        let content = match fs::tokio::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let tokens: Vec<ProvisionToken> = serde_json::from_str(&content)
            .with_context(|| format!("invalid token file {}", self.path.display()))?;
        Ok(tokens.into_iter().map(|t| (t.name.clone(), t)).collect())
    }

    async fn store(&self, tokens: &BTreeMap<String, ProvisionToken>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::tokio::create_dir_all(dir).await?;
        }
        let list: Vec<&ProvisionToken> = tokens.values().collect();
        let json = serde_json::to_vec_pretty(&list).context("failed to serialize tokens")?;
        let tmp = self.path.with_extension("tmp");
        fs::tokio::write(&tmp, json).await?;
        fs::tokio::rename(&tmp, &self.path).await?;
        debug!("stored {} tokens in {}", list.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, name: &str) -> Result<Option<ProvisionToken>> {
        Ok(self.load().await?.remove(name))
    }

    async fn list(&self) -> Result<Vec<ProvisionToken>> {
        Ok(self.load().await?.into_values().collect())
    }

    async fn upsert(&self, token: ProvisionToken) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.load().await?;
        tokens.insert(token.name.clone(), token);
        self.store(&tokens).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.load().await?;
        if tokens.remove(name).is_none() {
            return Ok(false);
        }
        self.store(&tokens).await?;
        Ok(true)
    }
}
