use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

use crate::util::Error;

/// A session over all live members used to verify schema convergence.
/// One call is a single probe; the upgrade machine owns the bounded
/// retry loop around it.
#[async_trait]
pub trait SchemaSession: Send + Sync {
    async fn schema_agreement(&self) -> Result<bool, Error>;
}

/// Constructor seam so tests can substitute a fake session.
pub type SessionFactory = Arc<dyn Fn(Vec<String>) -> Arc<dyn SchemaSession> + Send + Sync>;

/// Agreement check backed by the per-node schema digest endpoint: the
/// schemas agree iff every live host reports the same digest.
pub struct DigestSchemaSession {
    hosts: Vec<String>,
    http: reqwest::Client,
    port: u16,
}

impl DigestSchemaSession {
    pub fn factory(port: u16, timeout: Duration) -> SessionFactory {
        Arc::new(move |hosts| {
            let http = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("build schema session http client");
            Arc::new(DigestSchemaSession { hosts, http, port }) as Arc<dyn SchemaSession>
        })
    }
}

#[async_trait]
impl SchemaSession for DigestSchemaSession {
    async fn schema_agreement(&self) -> Result<bool, Error> {
        let mut digest: Option<String> = None;
        for host in &self.hosts {
            let version: String = self
                .http
                .get(format!(
                    "http://{}:{}/storage_service/schema_version",
                    host, self.port
                ))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            match &digest {
                None => digest = Some(version),
                Some(seen) if *seen != version => return Ok(false),
                Some(_) => {}
            }
        }
        Ok(true)
    }
}
