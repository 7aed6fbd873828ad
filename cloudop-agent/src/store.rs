use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use cloudop_async::{
    OperationCondition, OperationDescriptor, OperationStatusStore, ResourceKey, StoreError,
};

/// SQLite-backed status store for operations and conditions
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub async fn new(state_dir: &str) -> Result<Self> {
        let db_path = format!("{}/status.db", state_dir);
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // Pending operations, at most one per resource
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                resource_type TEXT NOT NULL,
                resource_group TEXT NOT NULL,
                name TEXT NOT NULL,
                descriptor TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (resource_type, resource_group, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Latest condition per resource and service
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conditions (
                resource_type TEXT NOT NULL,
                resource_group TEXT NOT NULL,
                name TEXT NOT NULL,
                service TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                last_transition TEXT NOT NULL,
                PRIMARY KEY (resource_type, resource_group, name, service)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Resources the agent has taken ownership of
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS managed (
                resource_type TEXT NOT NULL,
                resource_group TEXT NOT NULL,
                name TEXT NOT NULL,
                adopted_at TEXT NOT NULL,
                PRIMARY KEY (resource_type, resource_group, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a resource as owned by this agent, so it is deleted once it
    /// leaves the manifest.
    pub async fn adopt(&self, resource: &ResourceKey) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO managed (resource_type, resource_group, name, adopted_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.group)
        .bind(&resource.name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    /// Every resource this agent has recorded state for.
    pub async fn managed_resources(&self) -> std::result::Result<Vec<ResourceKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT resource_type, resource_group, name FROM managed
            UNION
            SELECT resource_type, resource_group, name FROM operations
            UNION
            SELECT resource_type, resource_group, name FROM conditions
            ORDER BY resource_type, resource_group, name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .iter()
            .map(|r| {
                ResourceKey::new(
                    r.get::<String, _>("resource_type"),
                    r.get::<String, _>("resource_group"),
                    r.get::<String, _>("name"),
                )
            })
            .collect())
    }

    /// Drop all state of a resource that no longer exists.
    pub async fn forget(&self, resource: &ResourceKey) -> std::result::Result<(), StoreError> {
        for table in ["managed", "operations", "conditions"] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE resource_type = ? AND resource_group = ? AND name = ?",
                table
            ))
            .bind(&resource.resource_type)
            .bind(&resource.group)
            .bind(&resource.name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl SqliteStatusStore {
    /// Conditions recorded for a resource, one per service.
    pub async fn conditions(
        &self,
        resource: &ResourceKey,
    ) -> std::result::Result<Vec<OperationCondition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT service, kind, status, message, last_transition
            FROM conditions WHERE resource_type = ? AND resource_group = ? AND name = ?
            ORDER BY service
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.group)
        .bind(&resource.name)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|r| row_to_condition(resource, r))
            .collect()
    }
}

#[async_trait]
impl OperationStatusStore for SqliteStatusStore {
    async fn get_operation(
        &self,
        resource: &ResourceKey,
    ) -> std::result::Result<Option<OperationDescriptor>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT descriptor FROM operations
            WHERE resource_type = ? AND resource_group = ? AND name = ?
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.group)
        .bind(&resource.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|r| OperationDescriptor::decode(resource, &r.get::<String, _>("descriptor")))
            .transpose()
    }

    async fn set_operation(
        &self,
        resource: &ResourceKey,
        descriptor: &OperationDescriptor,
    ) -> std::result::Result<(), StoreError> {
        let encoded = descriptor.encode()?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO operations (resource_type, resource_group, name, descriptor, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (resource_type, resource_group, name)
            DO UPDATE SET descriptor = excluded.descriptor, updated_at = excluded.updated_at
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.group)
        .bind(&resource.name)
        .bind(&encoded)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn clear_operation(&self, resource: &ResourceKey) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM operations WHERE resource_type = ? AND resource_group = ? AND name = ?
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.group)
        .bind(&resource.name)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn update_condition(
        &self,
        resource: &ResourceKey,
        condition: OperationCondition,
    ) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conditions (resource_type, resource_group, name, service, kind, status,
                                    message, last_transition)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (resource_type, resource_group, name, service)
            DO UPDATE SET kind = excluded.kind, status = excluded.status,
                          message = excluded.message, last_transition = excluded.last_transition
            "#,
        )
        .bind(&resource.resource_type)
        .bind(&resource.group)
        .bind(&resource.name)
        .bind(&condition.service)
        .bind(condition.kind.as_str())
        .bind(condition.status.as_str())
        .bind(&condition.message)
        .bind(condition.last_transition.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
fn row_to_condition(
    resource: &ResourceKey,
    r: &sqlx::sqlite::SqliteRow,
) -> std::result::Result<OperationCondition, StoreError> {
    use chrono::DateTime;
    use cloudop_async::{ConditionStatus, OperationKind};

    let corrupt = |reason: String| StoreError::Corrupt {
        resource: resource.to_string(),
        reason,
    };

    let kind = match r.get::<String, _>("kind").as_str() {
        "create" => OperationKind::Create,
        "update" => OperationKind::Update,
        "delete" => OperationKind::Delete,
        other => return Err(corrupt(format!("unknown operation kind {other:?}"))),
    };
    let status = match r.get::<String, _>("status").as_str() {
        "in_progress" => ConditionStatus::InProgress,
        "succeeded" => ConditionStatus::Succeeded,
        "failed" => ConditionStatus::Failed,
        other => return Err(corrupt(format!("unknown condition status {other:?}"))),
    };
    let last_transition = DateTime::parse_from_rfc3339(&r.get::<String, _>("last_transition"))
        .map_err(|e| corrupt(e.to_string()))?
        .with_timezone(&Utc);

    Ok(OperationCondition {
        service: r.get("service"),
        kind,
        status,
        message: r.get("message"),
        last_transition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudop_async::{ConditionStatus, OperationKind, PollTarget, RequestMethod};
    use tempfile::TempDir;

    async fn setup_store() -> (SqliteStatusStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStatusStore::new(dir.path().to_str().unwrap())
            .await
            .unwrap();
        (store, dir)
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("Microsoft.Network/virtualNetworks", "rg-1", name)
    }

    fn descriptor(name: &str) -> OperationDescriptor {
        OperationDescriptor::new(
            OperationKind::Create,
            &key(name),
            PollTarget::new(RequestMethod::Put, "https://provider/operations/1")
                .with_data(serde_json::json!({ "resourceUrl": "https://provider/vnet" })),
        )
    }

    #[tokio::test]
    async fn test_operation_crud() {
        let (store, _dir) = setup_store().await;
        let vnet = key("vnet-1");

        assert!(store.get_operation(&vnet).await.unwrap().is_none());

        // Set
        let op = descriptor("vnet-1");
        store.set_operation(&vnet, &op).await.unwrap();
        assert_eq!(store.get_operation(&vnet).await.unwrap(), Some(op.clone()));

        // Other resources are unaffected
        assert!(store.get_operation(&key("vnet-2")).await.unwrap().is_none());

        // Overwrite
        let mut update = op.clone();
        update.kind = OperationKind::Update;
        store.set_operation(&vnet, &update).await.unwrap();
        assert_eq!(store.get_operation(&vnet).await.unwrap(), Some(update));

        // Clear
        store.clear_operation(&vnet).await.unwrap();
        assert!(store.get_operation(&vnet).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_operation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_str().unwrap();
        let op = descriptor("vnet-1");

        {
            let store = SqliteStatusStore::new(path).await.unwrap();
            store.set_operation(&key("vnet-1"), &op).await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteStatusStore::new(path).await.unwrap();
        assert_eq!(
            store.get_operation(&key("vnet-1")).await.unwrap(),
            Some(op)
        );
    }

    #[tokio::test]
    async fn test_corrupt_descriptor() {
        let (store, _dir) = setup_store().await;
        sqlx::query(
            "INSERT INTO operations (resource_type, resource_group, name, descriptor, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind("Microsoft.Network/virtualNetworks")
        .bind("rg-1")
        .bind("vnet-1")
        .bind("{truncated")
        .bind(Utc::now().to_rfc3339())
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.get_operation(&key("vnet-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_conditions() {
        let (store, _dir) = setup_store().await;
        let vnet = key("vnet-1");

        store
            .update_condition(
                &vnet,
                OperationCondition::in_progress("agent-a", OperationKind::Create),
            )
            .await
            .unwrap();
        store
            .update_condition(
                &vnet,
                OperationCondition::failed("agent-a", OperationKind::Create, "quota exceeded"),
            )
            .await
            .unwrap();
        store
            .update_condition(
                &vnet,
                OperationCondition::succeeded("agent-b", OperationKind::Update),
            )
            .await
            .unwrap();

        let conditions = store.conditions(&vnet).await.unwrap();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].service, "agent-a");
        assert_eq!(conditions[0].status, ConditionStatus::Failed);
        assert_eq!(conditions[0].message.as_deref(), Some("quota exceeded"));
        assert_eq!(conditions[1].kind, OperationKind::Update);
        assert_eq!(conditions[1].status, ConditionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_managed_resources_and_forget() {
        let (store, _dir) = setup_store().await;

        store
            .set_operation(&key("vnet-1"), &descriptor("vnet-1"))
            .await
            .unwrap();
        store
            .update_condition(
                &key("vnet-1"),
                OperationCondition::in_progress("agent", OperationKind::Create),
            )
            .await
            .unwrap();
        store
            .update_condition(
                &key("vnet-2"),
                OperationCondition::succeeded("agent", OperationKind::Create),
            )
            .await
            .unwrap();

        assert_eq!(
            store.managed_resources().await.unwrap(),
            vec![key("vnet-1"), key("vnet-2")]
        );

        store.forget(&key("vnet-1")).await.unwrap();
        assert_eq!(store.managed_resources().await.unwrap(), vec![key("vnet-2")]);
        assert!(store.get_operation(&key("vnet-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_adopted_resource_is_managed() {
        let (store, _dir) = setup_store().await;

        // Adopting twice keeps a single entry
        store.adopt(&key("vnet-1")).await.unwrap();
        store.adopt(&key("vnet-1")).await.unwrap();
        assert_eq!(store.managed_resources().await.unwrap(), vec![key("vnet-1")]);

        store.forget(&key("vnet-1")).await.unwrap();
        assert!(store.managed_resources().await.unwrap().is_empty());
    }
}
