//! Integration binding store.

use async_trait::async_trait;

use callbridge_integrations::IntegrationBinding;

use crate::{PersistenceError, ScyllaClient};

/// Integration binding operations.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn upsert(&self, binding: &IntegrationBinding) -> Result<(), PersistenceError>;
    async fn list_by_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<IntegrationBinding>, PersistenceError>;
    async fn delete(
        &self,
        agent_id: &str,
        integration_id: &str,
    ) -> Result<(), PersistenceError>;
}

/// Scylla implementation; bindings are stored as JSON payloads.
pub struct ScyllaIntegrationStore {
    client: ScyllaClient,
}

impl ScyllaIntegrationStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntegrationStore for ScyllaIntegrationStore {
    async fn upsert(&self, binding: &IntegrationBinding) -> Result<(), PersistenceError> {
        let insert = format!(
            "INSERT INTO {}.integrations (agent_id, integration_id, payload_json)
             VALUES (?, ?, ?)",
            self.client.keyspace()
        );
        let payload = serde_json::to_string(binding)
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
        self.client
            .session()
            .query_unpaged(insert, (&binding.agent_id, &binding.integration_id, payload))
            .await?;
        Ok(())
    }

    async fn list_by_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<IntegrationBinding>, PersistenceError> {
        let query = format!(
            "SELECT payload_json FROM {}.integrations WHERE agent_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (agent_id,))
            .await?;

        let mut bindings = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (payload,): (String,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                let binding: IntegrationBinding = serde_json::from_str(&payload)
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                bindings.push(binding);
            }
        }
        Ok(bindings)
    }

    async fn delete(
        &self,
        agent_id: &str,
        integration_id: &str,
    ) -> Result<(), PersistenceError> {
        let delete = format!(
            "DELETE FROM {}.integrations WHERE agent_id = ? AND integration_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete, (agent_id, integration_id))
            .await?;
        Ok(())
    }
}
