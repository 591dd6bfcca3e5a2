//! Organization store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PersistenceError, ScyllaClient};

/// Organization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrganizationStatus {
    #[default]
    Active,
    Inactive,
}

impl OrganizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inactive" => Self::Inactive,
            _ => Self::Active,
        }
    }
}

/// One tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub organization_id: String,
    pub slug: String,
    pub name: String,
    pub status: OrganizationStatus,
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Organization operations.
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    /// Create; fails with `Conflict` on a duplicate slug.
    async fn create(&self, organization: &Organization) -> Result<(), PersistenceError>;
    async fn get(&self, organization_id: &str) -> Result<Option<Organization>, PersistenceError>;
    async fn get_by_slug(&self, slug: &str) -> Result<Option<Organization>, PersistenceError>;
    async fn list(&self) -> Result<Vec<Organization>, PersistenceError>;
}

/// Scylla implementation.
pub struct ScyllaOrganizationStore {
    client: ScyllaClient,
}

impl ScyllaOrganizationStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn from_row(
        row: (String, String, String, String, Option<String>, i64, i64),
    ) -> Organization {
        let (organization_id, slug, name, status, config_json, created_at, updated_at) = row;
        Organization {
            organization_id,
            slug,
            name,
            status: OrganizationStatus::parse(&status),
            config: config_json
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null),
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl OrganizationStore for ScyllaOrganizationStore {
    async fn create(&self, organization: &Organization) -> Result<(), PersistenceError> {
        // Slug uniqueness via LWT on the lookup table.
        let slug_insert = format!(
            "INSERT INTO {}.organizations_by_slug (slug, organization_id) VALUES (?, ?) IF NOT EXISTS",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(
                slug_insert,
                (&organization.slug, &organization.organization_id),
            )
            .await?;

        // LWT answers with [applied] in the first column.
        let applied = result
            .rows
            .as_ref()
            .and_then(|rows| rows.first())
            .and_then(|row| row.columns.first())
            .and_then(|col| col.as_ref())
            .and_then(|v| v.as_boolean())
            .unwrap_or(true);
        if !applied {
            return Err(PersistenceError::Conflict(format!(
                "slug {} already exists",
                organization.slug
            )));
        }

        let insert = format!(
            "INSERT INTO {}.organizations (
                organization_id, slug, name, status, config_json, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    &organization.organization_id,
                    &organization.slug,
                    &organization.name,
                    organization.status.as_str(),
                    serde_json::to_string(&organization.config).ok(),
                    organization.created_at.timestamp_millis(),
                    organization.updated_at.timestamp_millis(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn get(&self, organization_id: &str) -> Result<Option<Organization>, PersistenceError> {
        let query = format!(
            "SELECT organization_id, slug, name, status, config_json, created_at, updated_at
             FROM {}.organizations WHERE organization_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (organization_id,))
            .await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let typed = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(Self::from_row(typed)));
            }
        }
        Ok(None)
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Organization>, PersistenceError> {
        let lookup = format!(
            "SELECT organization_id FROM {}.organizations_by_slug WHERE slug = ?",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(lookup, (slug,)).await?;

        let organization_id: Option<String> = result.rows.and_then(|rows| {
            rows.into_iter()
                .next()
                .and_then(|row| row.into_typed::<(String,)>().ok())
                .map(|(id,)| id)
        });

        match organization_id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Organization>, PersistenceError> {
        let query = format!(
            "SELECT organization_id, slug, name, status, config_json, created_at, updated_at
             FROM {}.organizations",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, &[]).await?;

        let mut organizations = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let typed = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                organizations.push(Self::from_row(typed));
            }
        }
        Ok(organizations)
    }
}
