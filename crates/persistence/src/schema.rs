//! Schema bootstrap.

use scylla::Session;

use crate::PersistenceError;

/// Create the keyspace if it doesn't exist.
pub async fn create_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u8,
) -> Result<(), PersistenceError> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );
    session
        .query_unpaged(query, &[])
        .await
        .map_err(|e| PersistenceError::Schema(format!("keyspace: {e}")))?;
    Ok(())
}

/// Create all tables.
pub async fn create_tables(session: &Session, keyspace: &str) -> Result<(), PersistenceError> {
    let tables = [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.organizations (
                organization_id TEXT,
                slug TEXT,
                name TEXT,
                status TEXT,
                config_json TEXT,
                created_at TIMESTAMP,
                updated_at TIMESTAMP,
                PRIMARY KEY (organization_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.organizations_by_slug (
                slug TEXT,
                organization_id TEXT,
                PRIMARY KEY (slug)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.agents (
                agent_id TEXT,
                organization_id TEXT,
                display_name TEXT,
                persona_name TEXT,
                language TEXT,
                voice_id TEXT,
                system_prompt TEXT,
                greeting TEXT,
                farewell TEXT,
                phone_country_code TEXT,
                phone_number TEXT,
                phone_location TEXT,
                status TEXT,
                number_of_calls BIGINT,
                created_at TIMESTAMP,
                updated_at TIMESTAMP,
                PRIMARY KEY (agent_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.agents_by_org (
                organization_id TEXT,
                agent_id TEXT,
                PRIMARY KEY ((organization_id), agent_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.agents_by_phone (
                phone_country_code TEXT,
                phone_number TEXT,
                agent_id TEXT,
                PRIMARY KEY ((phone_country_code, phone_number), agent_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.call_sessions (
                session_id TEXT,
                organization_id TEXT,
                agent_id TEXT,
                room_name TEXT,
                participant_identity TEXT,
                call_type TEXT,
                status TEXT,
                started_at TIMESTAMP,
                ended_at TIMESTAMP,
                duration_seconds BIGINT,
                caller_phone_number TEXT,
                destination_phone_number TEXT,
                call_sid TEXT,
                sip_participant_id TEXT,
                call_direction TEXT,
                is_telephony BOOLEAN,
                metadata_json TEXT,
                PRIMARY KEY (session_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.sessions_by_agent (
                agent_id TEXT,
                started_at TIMESTAMP,
                session_id TEXT,
                PRIMARY KEY ((agent_id), started_at, session_id)
            ) WITH CLUSTERING ORDER BY (started_at DESC, session_id ASC)
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.transcripts (
                session_id TEXT,
                seq INT,
                ts TIMESTAMP,
                speaker TEXT,
                text TEXT,
                kind TEXT,
                latency_ms BIGINT,
                confidence DOUBLE,
                function_name TEXT,
                PRIMARY KEY ((session_id), seq)
            ) WITH CLUSTERING ORDER BY (seq ASC)
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.call_metrics (
                agent_id TEXT,
                metric_type TEXT,
                ts TIMESTAMP,
                session_id TEXT,
                metric_name TEXT,
                value DOUBLE,
                unit TEXT,
                PRIMARY KEY ((agent_id, metric_type), ts, session_id, metric_name)
            ) WITH CLUSTERING ORDER BY (ts DESC)
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.ingestion_sessions (
                session_id TEXT,
                payload_json TEXT,
                stage TEXT,
                agent_id TEXT,
                created_at TIMESTAMP,
                PRIMARY KEY (session_id)
            ) WITH default_time_to_live = 86400
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.documents (
                document_id TEXT,
                payload_json TEXT,
                agent_id TEXT,
                status TEXT,
                uploaded_at TIMESTAMP,
                PRIMARY KEY (document_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.documents_by_agent (
                agent_id TEXT,
                document_id TEXT,
                PRIMARY KEY ((agent_id), document_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.chunks (
                document_id TEXT,
                chunk_index INT,
                chunk_id TEXT,
                agent_id TEXT,
                text TEXT,
                token_count INT,
                page_number INT,
                section_title TEXT,
                section_path_json TEXT,
                content_type TEXT,
                quality_score DOUBLE,
                access_count BIGINT,
                last_accessed_at TIMESTAMP,
                PRIMARY KEY ((document_id), chunk_index)
            ) WITH CLUSTERING ORDER BY (chunk_index ASC)
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.chunks_by_agent (
                agent_id TEXT,
                chunk_id TEXT,
                document_id TEXT,
                chunk_index INT,
                PRIMARY KEY ((agent_id), chunk_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.deleted_documents (
                document_id TEXT,
                payload_json TEXT,
                purge_at TIMESTAMP,
                is_purged BOOLEAN,
                PRIMARY KEY (document_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {keyspace}.integrations (
                agent_id TEXT,
                integration_id TEXT,
                payload_json TEXT,
                PRIMARY KEY ((agent_id), integration_id)
            )
            "#
        ),
    ];

    for table in tables {
        session
            .query_unpaged(table, &[])
            .await
            .map_err(|e| PersistenceError::Schema(format!("table: {e}")))?;
    }
    tracing::info!("All tables created");
    Ok(())
}
