// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Periodic import of EC2 instance tags as node labels.
//!
//! Labels are namespaced as `aws/<tag key>`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

mod imds;

pub use imds::{ImdsClient, InstanceMetadata, IMDS_ENDPOINT};

/// Namespace prefix of every imported label
pub const AWS_NAMESPACE: &str = "aws";
/// Default refresh period
pub const LABEL_UPDATE_PERIOD: Duration = Duration::from_secs(60 * 60);

pub struct Ec2Labels {
    client: Arc<dyn InstanceMetadata>,
    labels: RwLock<BTreeMap<String, String>>,
    period: Duration,
}

impl Ec2Labels {
    pub fn new(client: Arc<dyn InstanceMetadata>) -> Self {
        Self {
            client,
            labels: RwLock::new(BTreeMap::new()),
            period: LABEL_UPDATE_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Labels from the last successful sync
    pub fn get(&self) -> BTreeMap<String, String> {
        self.labels.read().clone()
    }

    /// Fetch every tag and replace the labels.
    ///
    /// Any failure abandons the whole sync and keeps the previous labels.
    pub async fn sync(&self) -> Result<()> {
        let keys = self
            .client
            .tag_keys()
            .await
            .context("failed to fetch EC2 tag keys")?;
        let mut tags = BTreeMap::new();
        for key in keys {
            let value = self
                .client
                .tag_value(&key)
                .await
                .with_context(|| format!("failed to fetch EC2 tag {key}"))?;
            tags.insert(key, value);
        }
        debug!("fetched {} EC2 tags", tags.len());
        *self.labels.write() = to_aws_labels(tags);
        Ok(())
    }

    /// Sync now and then once per period until `shutdown` turns true or is dropped
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("importing EC2 tags every {:?}", self.period);
            let mut ticker = tokio::time::interval(self.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sync().await {
                            error!("error fetching EC2 tags: {err:#}");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("EC2 tag import stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Prefix tag keys with the label namespace
pub fn to_aws_labels(tags: BTreeMap<String, String>) -> BTreeMap<String, String> {
    tags.into_iter()
        .map(|(key, value)| (format!("{AWS_NAMESPACE}/{key}"), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use anyhow::bail;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeMetadata {
        tags: Mutex<BTreeMap<String, String>>,
        broken: Mutex<HashSet<String>>,
    }

    impl FakeMetadata {
        fn set(&self, key: &str, value: &str) {
            self.tags.lock().insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl InstanceMetadata for FakeMetadata {
        async fn tag_keys(&self) -> Result<Vec<String>> {
            Ok(self.tags.lock().keys().cloned().collect())
        }

        async fn tag_value(&self, key: &str) -> Result<String> {
            if self.broken.lock().contains(key) {
                bail!("metadata service unavailable");
            }
            match self.tags.lock().get(key) {
                Some(value) => Ok(value.clone()),
                None => bail!("no such tag: {key}"),
            }
        }
    }

    #[test]
    fn test_to_aws_labels() {
        let tags = BTreeMap::from([
            ("Name".to_string(), "web-1".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]);
        let labels = to_aws_labels(tags);
        assert_eq!(labels.get("aws/Name").map(String::as_str), Some("web-1"));
        assert_eq!(labels.get("aws/env").map(String::as_str), Some("prod"));
        assert_eq!(labels.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_keeps_labels_on_failure() {
        let metadata = Arc::new(FakeMetadata::default());
        metadata.set("a", "1");
        metadata.set("b", "2");
        let labels = Ec2Labels::new(metadata.clone());
        assert!(labels.get().is_empty());

        labels.sync().await.unwrap();
        let expected = BTreeMap::from([
            ("aws/a".to_string(), "1".to_string()),
            ("aws/b".to_string(), "2".to_string()),
        ]);
        assert_eq!(labels.get(), expected);

        metadata.set("c", "3");
        metadata.broken.lock().insert("c".to_string());
        assert!(labels.sync().await.is_err());
        assert_eq!(labels.get(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_updates() {
        let metadata = Arc::new(FakeMetadata::default());
        metadata.set("env", "staging");
        let labels = Arc::new(Ec2Labels::new(metadata.clone()));
        let (stop, shutdown) = watch::channel(false);
        let handle = labels.clone().start(shutdown);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(labels.get().get("aws/env").map(String::as_str), Some("staging"));

        metadata.set("env", "prod");
        tokio::time::sleep(LABEL_UPDATE_PERIOD).await;
        assert_eq!(labels.get().get("aws/env").map(String::as_str), Some("prod"));

        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}
