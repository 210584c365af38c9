//! Agent registry.
//!
//! The registry is an explicit object handed to whoever needs it. Agents add
//! themselves on start and remove themselves on stop; `register` messages
//! received from peers are forwarded here.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::protocol::RegisterMessage;

/// A known agent and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub url: String,
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Acknowledgment returned by `register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub agent_name: String,
    /// False when an existing registration was refreshed.
    pub created: bool,
}

/// Directory of agents.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(
        &self,
        registration: RegisterMessage,
    ) -> Result<RegistrationAck, RegistryError>;

    async fn deregister(&self, agent_name: &str) -> Result<(), RegistryError>;

    async fn get(&self, agent_name: &str) -> Option<AgentRegistration>;

    /// All registrations sorted by name.
    async fn list(&self) -> Vec<AgentRegistration>;

    async fn find_by_capability(&self, capability: &str) -> Vec<AgentRegistration>;
}

/// Process-local registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    agents: RwLock<HashMap<String, AgentRegistration>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(
        &self,
        registration: RegisterMessage,
    ) -> Result<RegistrationAck, RegistryError> {
        if registration.agent_name.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                reason: "agent_name is empty".to_string(),
            });
        }
        if registration.agent_url.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                reason: "agent_url is empty".to_string(),
            });
        }

        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let created = match agents.get_mut(&registration.agent_name) {
            Some(existing) => {
                existing.url = registration.agent_url;
                existing.capabilities = registration.capabilities;
                existing.last_seen = now;
                false
            }
            None => {
                agents.insert(
                    registration.agent_name.clone(),
                    AgentRegistration {
                        name: registration.agent_name.clone(),
                        url: registration.agent_url,
                        capabilities: registration.capabilities,
                        registered_at: now,
                        last_seen: now,
                    },
                );
                true
            }
        };

        tracing::info!(
            agent = %registration.agent_name,
            created,
            "Agent registered"
        );
        Ok(RegistrationAck {
            agent_name: registration.agent_name,
            created,
        })
    }

    async fn deregister(&self, agent_name: &str) -> Result<(), RegistryError> {
        match self.agents.write().await.remove(agent_name) {
            Some(_) => {
                tracing::info!(agent = %agent_name, "Agent deregistered");
                Ok(())
            }
            None => Err(RegistryError::NotFound {
                name: agent_name.to_string(),
            }),
        }
    }

    async fn get(&self, agent_name: &str) -> Option<AgentRegistration> {
        self.agents.read().await.get(agent_name).cloned()
    }

    async fn list(&self) -> Vec<AgentRegistration> {
        let mut all: Vec<_> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    async fn find_by_capability(&self, capability: &str) -> Vec<AgentRegistration> {
        self.list()
            .await
            .into_iter()
            .filter(|r| r.has_capability(capability))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn registration(name: &str, caps: &[&str]) -> RegisterMessage {
        RegisterMessage {
            agent_name: name.to_string(),
            agent_url: format!("http://127.0.0.1:9000/{}", name),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_register_and_query() {
        let registry = InMemoryRegistry::new();
        let ack = registry
            .register(registration("writer", &["summarize", "draft"]))
            .await
            .unwrap();
        assert!(ack.created);
        registry
            .register(registration("reader", &["summarize"]))
            .await
            .unwrap();

        let names: Vec<_> = registry.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["reader", "writer"]);

        let drafters = registry.find_by_capability("draft").await;
        assert_eq!(drafters.len(), 1);
        assert_eq!(drafters[0].name, "writer");
        assert_eq!(registry.find_by_capability("summarize").await.len(), 2);
        assert!(registry.find_by_capability("translate").await.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_refreshes_entry() {
        let registry = InMemoryRegistry::new();
        registry.register(registration("a", &["x"])).await.unwrap();
        let first = registry.get("a").await.unwrap();

        let mut update = registration("a", &["y"]);
        update.agent_url = "http://127.0.0.1:9001".to_string();
        let ack = registry.register(update).await.unwrap();
        assert!(!ack.created);

        let second = registry.get("a").await.unwrap();
        assert_eq!(second.registered_at, first.registered_at);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.url, "http://127.0.0.1:9001");
        assert!(second.has_capability("y"));
        assert!(!second.has_capability("x"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = InMemoryRegistry::new();
        registry.register(registration("a", &[])).await.unwrap();
        registry.deregister("a").await.unwrap();
        assert!(registry.is_empty().await);
        assert_eq!(
            registry.deregister("a").await,
            Err(RegistryError::NotFound {
                name: "a".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_rejects_blank_name() {
        let registry = InMemoryRegistry::new();
        let err = registry.register(registration(" ", &[])).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRegistration { .. }));
    }
}
