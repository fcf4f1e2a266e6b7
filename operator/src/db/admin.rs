use async_trait::async_trait;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use crate::util::Error;

/// Node-internal lifecycle state as reported by the admin API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationalMode {
    Starting,
    Joining,
    Normal,
    Leaving,
    Decommissioned,
    Draining,
    Drained,
    Moving,
    Unknown,
}

impl FromStr for OperationalMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(OperationalMode::Starting),
            "JOINING" => Ok(OperationalMode::Joining),
            "NORMAL" => Ok(OperationalMode::Normal),
            "LEAVING" => Ok(OperationalMode::Leaving),
            "DECOMMISSIONED" => Ok(OperationalMode::Decommissioned),
            "DRAINING" => Ok(OperationalMode::Draining),
            "DRAINED" => Ok(OperationalMode::Drained),
            "MOVING" => Ok(OperationalMode::Moving),
            _ => Ok(OperationalMode::Unknown),
        }
    }
}

impl fmt::Display for OperationalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationalMode::Starting => "STARTING",
            OperationalMode::Joining => "JOINING",
            OperationalMode::Normal => "NORMAL",
            OperationalMode::Leaving => "LEAVING",
            OperationalMode::Decommissioned => "DECOMMISSIONED",
            OperationalMode::Draining => "DRAINING",
            OperationalMode::Drained => "DRAINED",
            OperationalMode::Moving => "MOVING",
            OperationalMode::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// System keyspaces are snapshotted before any node is touched; everything
/// else only per node. The bare `system` keyspace has no underscore but
/// belongs to the system set.
pub fn is_system_keyspace(keyspace: &str) -> bool {
    keyspace == "system" || keyspace.starts_with("system_")
}

pub fn partition_keyspaces(all: &[String]) -> (Vec<String>, Vec<String>) {
    let system = all
        .iter()
        .filter(|ks| is_system_keyspace(ks))
        .cloned()
        .collect();
    (system, all.to_vec())
}

/// Administrative operations against a single database node. Host-local
/// HTTP in production; swappable for tests.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn operation_mode(&self, host: &str) -> Result<OperationalMode, Error>;
    async fn drain(&self, host: &str) -> Result<(), Error>;
    async fn decommission(&self, host: &str) -> Result<(), Error>;
    async fn keyspaces(&self, host: &str) -> Result<Vec<String>, Error>;
    async fn take_snapshot(&self, host: &str, keyspace: &str, tag: &str) -> Result<(), Error>;
    async fn delete_snapshot(&self, host: &str, tag: &str) -> Result<(), Error>;
}

pub struct HttpAdminClient {
    http: reqwest::Client,
    port: u16,
}

impl HttpAdminClient {
    pub fn new(port: u16, timeout: Duration) -> Arc<dyn AdminApi> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("build admin http client");
        Arc::new(HttpAdminClient { http, port })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.port, path)
    }
}

#[async_trait]
impl AdminApi for HttpAdminClient {
    async fn operation_mode(&self, host: &str) -> Result<OperationalMode, Error> {
        let mode: String = self
            .http
            .get(self.url(host, "/storage_service/operation_mode"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(mode.parse().unwrap_or(OperationalMode::Unknown))
    }

    async fn drain(&self, host: &str) -> Result<(), Error> {
        self.http
            .post(self.url(host, "/storage_service/drain"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn decommission(&self, host: &str) -> Result<(), Error> {
        self.http
            .post(self.url(host, "/storage_service/decommission"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn keyspaces(&self, host: &str) -> Result<Vec<String>, Error> {
        let keyspaces: Vec<String> = self
            .http
            .get(self.url(host, "/storage_service/keyspaces"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(keyspaces)
    }

    async fn take_snapshot(&self, host: &str, keyspace: &str, tag: &str) -> Result<(), Error> {
        let response = self
            .http
            .post(self.url(host, "/storage_service/snapshots"))
            .query(&[("kn", keyspace), ("tag", tag)])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        // A snapshot with this tag surviving a crashed cycle is fine.
        let body = response.text().await.unwrap_or_default();
        if body.contains("already exists") {
            return Ok(());
        }
        Err(Error::Admin(format!(
            "snapshot of '{}' on {} failed: {}",
            keyspace, host, body
        )))
    }

    async fn delete_snapshot(&self, host: &str, tag: &str) -> Result<(), Error> {
        self.http
            .delete(self.url(host, "/storage_service/snapshots"))
            .query(&[("tag", tag)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
