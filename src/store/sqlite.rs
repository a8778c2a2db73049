use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use super::{
    ProcessDefinitionRepository, ProcessEventRepository, ProcessInstanceRepository, RunRecord,
    RunStatusRepository, StoreError, StoreResult, TaskInstanceRepository, VariableRepository,
};
use crate::config::DatabaseConfig;
use crate::events::ProcessEvent;
use crate::lifecycle::{ProcessDefinition, ProcessInstance, TaskInstance};
use crate::variables::StoredVariable;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::not_found("record", "unknown"),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// SQLite-backed repositories. Records are kept as JSON documents.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) the database, optionally running migrations
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let database_url = config.url.as_str();
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections = config.max_connections, "Database pool ready");

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }

    async fn save_variable_rows(
        &self,
        table: &str,
        owner_column: &str,
        owner_id: &str,
        rows: Vec<StoredVariable>,
    ) -> StoreResult<()> {
        let statement = format!(
            "INSERT OR REPLACE INTO {table} ({owner_column}, name, var_type, text_value, long_value, double_value) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        );
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&statement)
                .bind(owner_id)
                .bind(row.name)
                .bind(row.var_type)
                .bind(row.text_value)
                .bind(row.long_value)
                .bind(row.double_value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn sortable_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_record<T: serde::de::DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> StoreResult<T> {
    let record: String = row.get("record");
    Ok(serde_json::from_str(&record)?)
}

#[async_trait]
impl ProcessDefinitionRepository for SqliteStore {
    async fn get_definition(&self, id: i64) -> StoreResult<ProcessDefinition> {
        let row = sqlx::query("SELECT record FROM process_definitions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("process definition", id.to_string()))?;
        decode_record(&row)
    }

    async fn latest_definition_by_key(&self, key: &str) -> StoreResult<ProcessDefinition> {
        let row = sqlx::query(
            r#"
            SELECT record FROM process_definitions
            WHERE key = ?1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("process definition", key))?;
        decode_record(&row)
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO process_definitions (id, key, version, record) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(definition.id)
        .bind(&definition.key)
        .bind(definition.version)
        .bind(serde_json::to_string(definition)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessInstanceRepository for SqliteStore {
    async fn get_instance(&self, id: &str) -> StoreResult<ProcessInstance> {
        let row = sqlx::query("SELECT record FROM process_instances WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("process instance", id))?;
        decode_record(&row)
    }

    async fn create_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO process_instances (id, record) VALUES (?1, ?2)",
        )
        .bind(&instance.id)
        .bind(serde_json::to_string(instance)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                entity: "process instance",
                id: instance.id.clone(),
            });
        }
        Ok(())
    }

    async fn update_instance(&self, instance: &ProcessInstance) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE process_instances SET record = ?2, updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(&instance.id)
        .bind(serde_json::to_string(instance)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("process instance", &instance.id));
        }
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM process_instances WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("process instance", id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskInstanceRepository for SqliteStore {
    async fn get_task(&self, id: &str) -> StoreResult<TaskInstance> {
        let row = sqlx::query("SELECT record FROM task_instances WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("task instance", id))?;
        decode_record(&row)
    }

    async fn create_task(&self, task: &TaskInstance) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_instances (id, process_instance_id, create_time, record)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&task.id)
        .bind(&task.process_instance_id)
        .bind(sortable_timestamp(task.create_time))
        .bind(serde_json::to_string(task)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                entity: "task instance",
                id: task.id.clone(),
            });
        }
        Ok(())
    }

    async fn update_task(&self, task: &TaskInstance) -> StoreResult<()> {
        let result = sqlx::query("UPDATE task_instances SET record = ?2 WHERE id = ?1")
            .bind(&task.id)
            .bind(serde_json::to_string(task)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task instance", &task.id));
        }
        Ok(())
    }

    async fn list_tasks_for_process(
        &self,
        process_instance_id: &str,
    ) -> StoreResult<Vec<TaskInstance>> {
        let rows = sqlx::query(
            "SELECT record FROM task_instances WHERE process_instance_id = ?1 ORDER BY create_time ASC",
        )
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_record).collect()
    }
}

#[async_trait]
impl ProcessEventRepository for SqliteStore {
    async fn append_event(&self, event: &ProcessEvent) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO process_events (id, process_instance_id, timestamp, record)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&event.id)
        .bind(&event.process_instance_id)
        .bind(event.timestamp.map(sortable_timestamp))
        .bind(serde_json::to_string(event)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                entity: "process event",
                id: event.id.clone(),
            });
        }
        Ok(())
    }

    async fn get_event(&self, id: &str) -> StoreResult<ProcessEvent> {
        let row = sqlx::query("SELECT record FROM process_events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("process event", id))?;
        decode_record(&row)
    }

    async fn list_events(&self, process_instance_id: &str) -> StoreResult<Vec<ProcessEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM process_events
            WHERE process_instance_id = ?1
            ORDER BY timestamp ASC, seq ASC
            "#,
        )
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_record).collect()
    }
}

#[async_trait]
impl VariableRepository for SqliteStore {
    async fn save_process_variables(
        &self,
        process_instance_id: &str,
        rows: Vec<StoredVariable>,
    ) -> StoreResult<()> {
        self.save_variable_rows(
            "process_variables",
            "process_instance_id",
            process_instance_id,
            rows,
        )
        .await
    }

    async fn load_process_variables(
        &self,
        process_instance_id: &str,
    ) -> StoreResult<Vec<StoredVariable>> {
        let rows = sqlx::query(
            r#"
            SELECT name, var_type, text_value, long_value, double_value
            FROM process_variables
            WHERE process_instance_id = ?1
            ORDER BY name ASC
            "#,
        )
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredVariable {
                name: row.get("name"),
                var_type: row.get("var_type"),
                text_value: row.get("text_value"),
                long_value: row.get("long_value"),
                double_value: row.get("double_value"),
            })
            .collect())
    }

    async fn save_task_variables(
        &self,
        task_id: &str,
        rows: Vec<StoredVariable>,
    ) -> StoreResult<()> {
        self.save_variable_rows("task_variables", "task_id", task_id, rows)
            .await
    }
}

#[async_trait]
impl RunStatusRepository for SqliteStore {
    async fn record_run(&self, record: &RunRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO orchestration_runs (run_id, record, updated_at)
            VALUES (?1, ?2, datetime('now'))
            "#,
        )
        .bind(&record.run_id)
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        let row = sqlx::query("SELECT record FROM orchestration_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        decode_record(&row)
    }
}
