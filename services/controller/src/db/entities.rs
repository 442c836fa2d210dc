//! Postgres-backed entity store.
//!
//! Every entity lives in the `entities` table as a JSONB body keyed by
//! `(kind, id)`. VMs also carry `config_id` and `url` columns so the cron
//! scans are index range queries.

use async_trait::async_trait;
use sqlx::{postgres::PgPool, Row};
use tracing::debug;
use vmfleet_model::{Config, Project, Vm};

use super::DbError;
use crate::store::{
    decode, encode, ConfigTxn, Entity, EntityStore, Mutation, StoreError, TxnOutcome, VmQuery,
    VmTxn,
};

/// Entity store over a Postgres pool.
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get<T: Entity>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let row = sqlx::query("SELECT body FROM entities WHERE kind = $1 AND id = $2")
            .bind(T::KIND)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        row.map(|row| -> Result<T, StoreError> {
            let body: serde_json::Value = row.try_get("body").map_err(DbError::Query)?;
            decode(id, body)
        })
        .transpose()
    }

    async fn put<T: Entity>(&self, entity: &T) -> Result<(), StoreError> {
        let body = encode(entity)?;
        sqlx::query(
            r#"
            INSERT INTO entities (kind, id, body, config_id, url, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (kind, id) DO UPDATE
            SET body = EXCLUDED.body,
                config_id = EXCLUDED.config_id,
                url = EXCLUDED.url,
                updated_at = now()
            "#,
        )
        .bind(T::KIND)
        .bind(entity.entity_id())
        .bind(body)
        .bind(entity.config_ref())
        .bind(entity.url_ref())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn delete<T: Entity>(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM entities WHERE kind = $1 AND id = $2")
            .bind(T::KIND)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn list<T: Entity>(&self) -> Result<Vec<T>, StoreError> {
        let rows = sqlx::query("SELECT id, body FROM entities WHERE kind = $1 ORDER BY id")
            .bind(T::KIND)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        decode_rows(rows)
    }

    async fn transact<T: Entity>(
        &self,
        id: &str,
        f: &(dyn Fn(Option<&T>) -> Mutation<T> + Send + Sync),
    ) -> Result<TxnOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let row = sqlx::query("SELECT body FROM entities WHERE kind = $1 AND id = $2 FOR UPDATE")
            .bind(T::KIND)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let current: Option<T> = match row {
            Some(row) => {
                let body: serde_json::Value = row.try_get("body").map_err(DbError::Query)?;
                Some(decode(id, body)?)
            }
            None => None,
        };
        let existed = current.is_some();

        let outcome = match f(current.as_ref()) {
            Mutation::Keep => TxnOutcome::Unchanged,
            Mutation::Put(entity) => {
                let body = encode(&entity)?;
                let result = if existed {
                    sqlx::query(
                        r#"
                        UPDATE entities
                        SET body = $3, config_id = $4, url = $5, updated_at = now()
                        WHERE kind = $1 AND id = $2
                        "#,
                    )
                } else {
                    // The row lock does not cover a missing row; a concurrent
                    // insert shows up as zero rows affected.
                    sqlx::query(
                        r#"
                        INSERT INTO entities (kind, id, body, config_id, url, updated_at)
                        VALUES ($1, $2, $3, $4, $5, now())
                        ON CONFLICT (kind, id) DO NOTHING
                        "#,
                    )
                }
                .bind(T::KIND)
                .bind(id)
                .bind(body)
                .bind(entity.config_ref())
                .bind(entity.url_ref())
                .execute(&mut *tx)
                .await
                .map_err(DbError::Query)?;

                if result.rows_affected() == 0 {
                    debug!(kind = T::KIND, id, "Concurrent insert detected");
                    return Err(StoreError::Conflict {
                        kind: T::KIND,
                        id: id.to_string(),
                    });
                }
                TxnOutcome::Written
            }
            Mutation::Delete if existed => {
                sqlx::query("DELETE FROM entities WHERE kind = $1 AND id = $2")
                    .bind(T::KIND)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(DbError::Query)?;
                TxnOutcome::Deleted
            }
            Mutation::Delete => TxnOutcome::Unchanged,
        };

        tx.commit().await.map_err(DbError::Query)?;
        Ok(outcome)
    }
}

fn decode_rows<T: Entity>(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| -> Result<T, StoreError> {
            let id: String = row.try_get("id").map_err(DbError::Query)?;
            let body: serde_json::Value = row.try_get("body").map_err(DbError::Query)?;
            decode(&id, body)
        })
        .collect()
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn get_config(&self, id: &str) -> Result<Option<Config>, StoreError> {
        self.get(id).await
    }

    async fn put_config(&self, config: &Config) -> Result<(), StoreError> {
        self.put(config).await
    }

    async fn delete_config(&self, id: &str) -> Result<(), StoreError> {
        self.delete::<Config>(id).await
    }

    async fn list_configs(&self) -> Result<Vec<Config>, StoreError> {
        self.list().await
    }

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>, StoreError> {
        self.get(id).await
    }

    async fn put_vm(&self, vm: &Vm) -> Result<(), StoreError> {
        self.put(vm).await
    }

    async fn delete_vm(&self, id: &str) -> Result<(), StoreError> {
        self.delete::<Vm>(id).await
    }

    async fn query_vms(&self, query: &VmQuery) -> Result<Vec<Vm>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, body FROM entities
            WHERE kind = $1
              AND ($2::TEXT IS NULL OR config_id = $2)
              AND ($3::BOOLEAN IS NULL OR (COALESCE(url, '') <> '') = $3)
            ORDER BY id
            "#,
        )
        .bind(<Vm as Entity>::KIND)
        .bind(query.config.as_deref())
        .bind(query.has_url)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;
        decode_rows(rows)
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        self.get(id).await
    }

    async fn put_project(&self, project: &Project) -> Result<(), StoreError> {
        self.put(project).await
    }

    async fn delete_project(&self, id: &str) -> Result<(), StoreError> {
        self.delete::<Project>(id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.list().await
    }

    async fn transact_config(&self, id: &str, f: ConfigTxn<'_>) -> Result<TxnOutcome, StoreError> {
        self.transact(id, f).await
    }

    async fn transact_vm(&self, id: &str, f: VmTxn<'_>) -> Result<TxnOutcome, StoreError> {
        self.transact(id, f).await
    }
}
