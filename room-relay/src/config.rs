//! Server configuration assembled from CLI flags and environment variables.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    cli::ServeArgs,
    identity::JwtVerifier,
    relay::{DEFAULT_HISTORY_LIMIT, Relay},
    store::{JsonlStore, MemoryStore, MessageStore},
};

/// Secret the relay falls back to when `JWT_SECRET` is unset. Development only.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-in-production";

#[derive(Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub jwt_secret: String,
    pub history_limit: usize,
    pub store_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3030)),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            store_path: None,
        }
    }
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            jwt_secret: args.jwt_secret,
            history_limit: args.history_limit,
            store_path: args.store,
        }
    }
}

impl RelayConfig {
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub async fn open_store(&self) -> Result<Arc<dyn MessageStore>> {
        match &self.store_path {
            Some(path) => {
                let store = JsonlStore::open(path)
                    .await
                    .with_context(|| format!("failed to open message log {}", path.display()))?;
                Ok(Arc::new(store))
            }
            None => {
                info!("keeping messages in memory; history is lost on restart");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    pub async fn build_relay(&self) -> Result<Relay> {
        let verifier = Arc::new(JwtVerifier::new(self.jwt_secret.as_bytes()));
        let store = self.open_store().await?;
        Ok(Relay::new(verifier, store).with_history_limit(self.history_limit))
    }
}
