//! Agent store.
//!
//! Agents may claim a phone number pair `(country_code, number)`. At most
//! one ACTIVE agent should hold a pair; validation reports conflicting
//! agents instead of rejecting activation, and phone routing picks the
//! oldest active claimant deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PersistenceError, ScyllaClient};

/// Agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Busy,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inactive" => Self::Inactive,
            "busy" => Self::Busy,
            "error" => Self::Error,
            _ => Self::Active,
        }
    }
}

/// Phone triple assigned to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneAssignment {
    pub country_code: String,
    pub number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One configured agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub organization_id: String,
    pub display_name: String,
    pub persona_name: String,
    /// Locale-form language code (`hi-IN`).
    pub language: String,
    pub voice_id: String,
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub farewell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<PhoneAssignment>,
    pub status: AgentStatus,
    pub number_of_calls: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Agent operations.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn create(&self, agent: &AgentRecord) -> Result<(), PersistenceError>;
    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, PersistenceError>;
    async fn list_by_org(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AgentRecord>, PersistenceError>;
    async fn update(&self, agent: &AgentRecord) -> Result<(), PersistenceError>;
    async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), PersistenceError>;
    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError>;
    async fn increment_calls(&self, agent_id: &str) -> Result<(), PersistenceError>;

    /// All agents (any status) claiming a phone pair.
    async fn find_by_phone(
        &self,
        country_code: &str,
        number: &str,
    ) -> Result<Vec<AgentRecord>, PersistenceError>;

    /// Active agents other than `agent_id` sharing its phone pair.
    async fn phone_conflicts(
        &self,
        agent: &AgentRecord,
    ) -> Result<Vec<AgentRecord>, PersistenceError> {
        let Some(phone) = &agent.phone else {
            return Ok(Vec::new());
        };
        let claimants = self.find_by_phone(&phone.country_code, &phone.number).await?;
        Ok(claimants
            .into_iter()
            .filter(|other| {
                other.agent_id != agent.agent_id && other.status == AgentStatus::Active
            })
            .collect())
    }

    /// Deterministic routing: the oldest active claimant wins.
    async fn route_by_phone(
        &self,
        country_code: &str,
        number: &str,
    ) -> Result<Option<AgentRecord>, PersistenceError> {
        let mut claimants: Vec<AgentRecord> = self
            .find_by_phone(country_code, number)
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Active)
            .collect();
        claimants.sort_by_key(|a| a.created_at);
        Ok(claimants.into_iter().next())
    }
}

/// Scylla implementation.
pub struct ScyllaAgentStore {
    client: ScyllaClient,
}

type AgentRow = (
    String,         // agent_id
    String,         // organization_id
    String,         // display_name
    String,         // persona_name
    String,         // language
    String,         // voice_id
    String,         // system_prompt
    Option<String>, // greeting
    String,         // farewell
    Option<String>, // phone_country_code
    Option<String>, // phone_number
    Option<String>, // phone_location
    String,         // status
    i64,            // number_of_calls
    i64,            // created_at
    i64,            // updated_at
);

impl ScyllaAgentStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn from_row(row: AgentRow) -> AgentRecord {
        let (
            agent_id,
            organization_id,
            display_name,
            persona_name,
            language,
            voice_id,
            system_prompt,
            greeting,
            farewell,
            phone_country_code,
            phone_number,
            phone_location,
            status,
            number_of_calls,
            created_at,
            updated_at,
        ) = row;
        let phone = match (phone_country_code, phone_number) {
            (Some(country_code), Some(number)) if !number.is_empty() => Some(PhoneAssignment {
                country_code,
                number,
                location: phone_location,
            }),
            _ => None,
        };
        AgentRecord {
            agent_id,
            organization_id,
            display_name,
            persona_name,
            language,
            voice_id,
            system_prompt,
            greeting,
            farewell,
            phone,
            status: AgentStatus::parse(&status),
            number_of_calls,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
        }
    }

    const COLUMNS: &'static str = "agent_id, organization_id, display_name, persona_name, \
         language, voice_id, system_prompt, greeting, farewell, phone_country_code, \
         phone_number, phone_location, status, number_of_calls, created_at, updated_at";

    async fn write(&self, agent: &AgentRecord) -> Result<(), PersistenceError> {
        let insert = format!(
            "INSERT INTO {}.agents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace(),
            Self::COLUMNS
        );
        let (country_code, number, location) = match &agent.phone {
            Some(phone) => (
                Some(phone.country_code.clone()),
                Some(phone.number.clone()),
                phone.location.clone(),
            ),
            None => (None, None, None),
        };
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    &agent.agent_id,
                    &agent.organization_id,
                    &agent.display_name,
                    &agent.persona_name,
                    &agent.language,
                    &agent.voice_id,
                    &agent.system_prompt,
                    &agent.greeting,
                    &agent.farewell,
                    &country_code,
                    &number,
                    &location,
                    agent.status.as_str(),
                    agent.number_of_calls,
                    agent.created_at.timestamp_millis(),
                    agent.updated_at.timestamp_millis(),
                ),
            )
            .await?;

        let org_index = format!(
            "INSERT INTO {}.agents_by_org (organization_id, agent_id) VALUES (?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(org_index, (&agent.organization_id, &agent.agent_id))
            .await?;

        if let (Some(country_code), Some(number)) = (
            agent.phone.as_ref().map(|p| &p.country_code),
            agent.phone.as_ref().map(|p| &p.number),
        ) {
            let phone_index = format!(
                "INSERT INTO {}.agents_by_phone (phone_country_code, phone_number, agent_id)
                 VALUES (?, ?, ?)",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(phone_index, (country_code, number, &agent.agent_id))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentStore for ScyllaAgentStore {
    async fn create(&self, agent: &AgentRecord) -> Result<(), PersistenceError> {
        self.write(agent).await
    }

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, PersistenceError> {
        let query = format!(
            "SELECT {} FROM {}.agents WHERE agent_id = ?",
            Self::COLUMNS,
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (agent_id,))
            .await?;
        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let typed: AgentRow = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(Self::from_row(typed)));
            }
        }
        Ok(None)
    }

    async fn list_by_org(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AgentRecord>, PersistenceError> {
        let lookup = format!(
            "SELECT agent_id FROM {}.agents_by_org WHERE organization_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(lookup, (organization_id,))
            .await?;

        let mut agents = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (agent_id,): (String,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                if let Some(agent) = self.get(&agent_id).await? {
                    agents.push(agent);
                }
            }
        }
        Ok(agents)
    }

    async fn update(&self, agent: &AgentRecord) -> Result<(), PersistenceError> {
        // Remove a stale phone index entry when the number changed.
        if let Some(existing) = self.get(&agent.agent_id).await? {
            if let Some(old_phone) = existing.phone {
                if agent.phone.as_ref() != Some(&old_phone) {
                    let delete = format!(
                        "DELETE FROM {}.agents_by_phone
                         WHERE phone_country_code = ? AND phone_number = ? AND agent_id = ?",
                        self.client.keyspace()
                    );
                    self.client
                        .session()
                        .query_unpaged(
                            delete,
                            (&old_phone.country_code, &old_phone.number, &agent.agent_id),
                        )
                        .await?;
                }
            }
        }
        self.write(agent).await
    }

    async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), PersistenceError> {
        let update = format!(
            "UPDATE {}.agents SET status = ?, updated_at = ? WHERE agent_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                update,
                (status.as_str(), Utc::now().timestamp_millis(), agent_id),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError> {
        let Some(agent) = self.get(agent_id).await? else {
            return Err(PersistenceError::NotFound(agent_id.to_string()));
        };

        let delete_agent = format!(
            "DELETE FROM {}.agents WHERE agent_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete_agent, (agent_id,))
            .await?;

        let delete_org = format!(
            "DELETE FROM {}.agents_by_org WHERE organization_id = ? AND agent_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete_org, (&agent.organization_id, agent_id))
            .await?;

        if let Some(phone) = &agent.phone {
            let delete_phone = format!(
                "DELETE FROM {}.agents_by_phone
                 WHERE phone_country_code = ? AND phone_number = ? AND agent_id = ?",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(delete_phone, (&phone.country_code, &phone.number, agent_id))
                .await?;
        }
        Ok(())
    }

    async fn increment_calls(&self, agent_id: &str) -> Result<(), PersistenceError> {
        // Non-atomic read-modify-write; call counting tolerates rare
        // lost updates.
        if let Some(agent) = self.get(agent_id).await? {
            let update = format!(
                "UPDATE {}.agents SET number_of_calls = ? WHERE agent_id = ?",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(update, (agent.number_of_calls + 1, agent_id))
                .await?;
        }
        Ok(())
    }

    async fn find_by_phone(
        &self,
        country_code: &str,
        number: &str,
    ) -> Result<Vec<AgentRecord>, PersistenceError> {
        let lookup = format!(
            "SELECT agent_id FROM {}.agents_by_phone
             WHERE phone_country_code = ? AND phone_number = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(lookup, (country_code, number))
            .await?;

        let mut agents = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (agent_id,): (String,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                if let Some(agent) = self.get(&agent_id).await? {
                    agents.push(agent);
                }
            }
        }
        Ok(agents)
    }
}
