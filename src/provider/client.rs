//! Game-server provider client
//!
//! [`GameServerProvider`] is the seam to the hosting provider. The HTTP
//! implementation talks to its REST API; the mock keeps servers in memory and
//! can be scripted to fail.

use crate::config::ProviderSettings;
use crate::error::{MatchmakingError, Result};
use crate::provider::types::{ProviderMatch, ServerAssignment, ServerSpec};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Trait for the external game-server hosting API
#[async_trait]
pub trait GameServerProvider: Send + Sync {
    /// Create and start a dedicated server for a match
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerAssignment>;

    /// Fetch the provider match resource
    async fn fetch_match(&self, provider_match_id: &str) -> Result<ProviderMatch>;

    /// Tear a server down; deleting an unknown server is not an error
    async fn delete_server(&self, server_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct CreatedServer {
    id: String,
    match_id: String,
    ip: String,
    port: u16,
}

/// Provider client over its HTTP API
pub struct HttpGameServerProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGameServerProvider {
    /// Build a client; fails with `MissingCredentials` when no API key is set
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| MatchmakingError::MissingCredentials {
                message: "PROVIDER_API_KEY is not set".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .map_err(|e| MatchmakingError::ConfigurationError {
                message: format!("Failed to build provider HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn provider_error(context: &str, error: impl std::fmt::Display) -> MatchmakingError {
        MatchmakingError::ExternalProvider {
            message: format!("{}: {}", context, error),
        }
    }

    async fn check_status(
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(MatchmakingError::MissingCredentials {
                message: format!("{} rejected the provider API key ({})", context, status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::provider_error(
                context,
                format!("HTTP {} {}", status, body),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl GameServerProvider for HttpGameServerProvider {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerAssignment> {
        debug!("Requesting server for match {}", spec.match_id);
        let response = self
            .client
            .post(self.url("servers"))
            .bearer_auth(&self.api_key)
            .json(spec)
            .send()
            .await
            .map_err(|e| Self::provider_error("create server", e))?;
        let created: CreatedServer = Self::check_status(response, "create server")
            .await?
            .json()
            .await
            .map_err(|e| Self::provider_error("create server response", e))?;

        info!(
            "Provider created server {} at {}:{} for match {}",
            created.id, created.ip, created.port, spec.match_id
        );
        Ok(ServerAssignment {
            server_id: created.id,
            provider_match_id: created.match_id,
            ip: created.ip,
            port: created.port,
        })
    }

    async fn fetch_match(&self, provider_match_id: &str) -> Result<ProviderMatch> {
        let response = self
            .client
            .get(self.url(&format!("matches/{}", provider_match_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Self::provider_error("fetch match", e))?;
        Self::check_status(response, "fetch match")
            .await?
            .json()
            .await
            .map_err(|e| Self::provider_error("fetch match response", e))
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("servers/{}", server_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Self::provider_error("delete server", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("Server {} was already gone", server_id);
            return Ok(());
        }
        Self::check_status(response, "delete server").await?;
        info!("Deleted server {}", server_id);
        Ok(())
    }
}

/// In-memory provider for tests and local runs
#[derive(Debug, Default)]
pub struct MockGameServerProvider {
    created: AtomicUsize,
    fail_create: Mutex<Option<String>>,
    create_delay: Mutex<Option<Duration>>,
    matches: Mutex<HashMap<String, ProviderMatch>>,
    deleted: Mutex<Vec<String>>,
}

impl MockGameServerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `create_server` call fail with this message
    pub fn fail_creates(&self, message: &str) {
        if let Ok(mut fail) = self.fail_create.lock() {
            *fail = Some(message.to_string());
        }
    }

    /// Slow down `create_server`, to widen race windows in tests
    pub fn delay_creates(&self, delay: Duration) {
        if let Ok(mut slot) = self.create_delay.lock() {
            *slot = Some(delay);
        }
    }

    /// Set the resource returned for a provider match id
    pub fn set_match(&self, payload: ProviderMatch) {
        if let Ok(mut matches) = self.matches.lock() {
            matches.insert(payload.id.clone(), payload);
        }
    }

    pub fn servers_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted_servers(&self) -> Vec<String> {
        self.deleted.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GameServerProvider for MockGameServerProvider {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerAssignment> {
        let delay = self.create_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.fail_create.lock().ok().and_then(|f| f.clone());
        if let Some(message) = failure {
            return Err(MatchmakingError::ExternalProvider { message });
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let assignment = ServerAssignment {
            server_id: format!("srv-{}", n),
            provider_match_id: format!("pm-{}", spec.match_id),
            ip: format!("10.0.0.{}", n % 250 + 1),
            port: 27015,
        };
        self.set_match(ProviderMatch {
            id: assignment.provider_match_id.clone(),
            finished: false,
            players: Vec::new(),
        });
        Ok(assignment)
    }

    async fn fetch_match(&self, provider_match_id: &str) -> Result<ProviderMatch> {
        self.matches
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("mock provider"))?
            .get(provider_match_id)
            .cloned()
            .ok_or_else(|| MatchmakingError::ExternalProvider {
                message: format!("unknown match {}", provider_match_id),
            })
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.deleted
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("mock provider"))?
            .push(server_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn spec() -> ServerSpec {
        ServerSpec {
            match_id: Uuid::new_v4(),
            map: "de_nuke".to_string(),
            location: "frankfurt".to_string(),
            team1_steam_ids: vec!["1".to_string()],
            team2_steam_ids: vec!["2".to_string()],
        }
    }

    #[test]
    fn test_http_provider_requires_key() {
        let settings = ProviderSettings::default();
        assert!(matches!(
            HttpGameServerProvider::new(&settings),
            Err(MatchmakingError::MissingCredentials { .. })
        ));

        let settings = ProviderSettings {
            api_key: Some("token".to_string()),
            base_url: "https://provider.test/v1/".to_string(),
            ..ProviderSettings::default()
        };
        let provider = HttpGameServerProvider::new(&settings).unwrap();
        assert_eq!(provider.url("/servers"), "https://provider.test/v1/servers");
    }

    #[tokio::test]
    async fn test_mock_provider_lifecycle() {
        let provider = MockGameServerProvider::new();
        let server = provider.create_server(&spec()).await.unwrap();
        assert_eq!(provider.servers_created(), 1);

        let resource = provider.fetch_match(&server.provider_match_id).await.unwrap();
        assert!(!resource.finished);

        provider.delete_server(&server.server_id).await.unwrap();
        assert_eq!(provider.deleted_servers(), vec![server.server_id]);
    }

    #[tokio::test]
    async fn test_mock_provider_failure() {
        let provider = MockGameServerProvider::new();
        provider.fail_creates("out of capacity");
        assert_eq!(
            provider.create_server(&spec()).await,
            Err(MatchmakingError::ExternalProvider {
                message: "out of capacity".to_string()
            })
        );
        assert_eq!(provider.servers_created(), 0);
    }
}
