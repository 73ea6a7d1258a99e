//! Metadata repository: configs, per-config state, run history, conflicts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::sync::Arc;

use sheetbridge_core::models::{ConflictRecord, SyncConfig, SyncRun, SyncState};
use sheetbridge_core::ports::MetadataStore;
use sheetbridge_core::SyncError;

use crate::db::{get_connection, SqlitePool};
use crate::errors::{Result, StorageError};
use crate::models::{ts_to_db, SyncConfigDB, SyncConflictDB, SyncRunDB, SyncStateDB};

pub struct MetadataRepository {
    pool: Arc<SqlitePool>,
}

impl MetadataRepository {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Insert or update a config; its state row is born alongside it.
    pub fn upsert_config(&self, config: &SyncConfig) -> Result<()> {
        use crate::schema::{sync_configs, sync_state};

        let row = SyncConfigDB::from_domain(config)?;
        let mut conn = get_connection(&self.pool)?;
        conn.immediate_transaction::<_, StorageError, _>(|conn| {
            diesel::insert_into(sync_configs::table)
                .values(&row)
                .on_conflict(sync_configs::id)
                .do_update()
                .set(&row)
                .execute(conn)?;

            diesel::insert_into(sync_state::table)
                .values(SyncStateDB::empty(&config.id))
                .on_conflict(sync_state::config_id)
                .do_nothing()
                .execute(conn)?;
            Ok(())
        })
    }

    /// Delete a config and everything born with it: state, runs, conflicts.
    pub fn delete_config(&self, config_id: &str) -> Result<()> {
        use crate::schema::{sync_configs, sync_conflicts, sync_runs, sync_state};

        let mut conn = get_connection(&self.pool)?;
        conn.immediate_transaction::<_, StorageError, _>(|conn| {
            diesel::delete(sync_configs::table.find(config_id)).execute(conn)?;
            diesel::delete(sync_state::table.find(config_id)).execute(conn)?;
            diesel::delete(sync_runs::table.filter(sync_runs::config_id.eq(config_id)))
                .execute(conn)?;
            diesel::delete(sync_conflicts::table.filter(sync_conflicts::config_id.eq(config_id)))
                .execute(conn)?;
            Ok(())
        })
    }

    fn list_active_configs_blocking(pool: &Arc<SqlitePool>) -> Result<Vec<SyncConfig>> {
        use crate::schema::sync_configs::dsl;

        let mut conn = get_connection(pool)?;
        let rows = dsl::sync_configs
            .filter(dsl::active.eq(1))
            .order(dsl::id.asc())
            .load::<SyncConfigDB>(&mut conn)?;
        rows.into_iter().map(SyncConfigDB::into_domain).collect()
    }

    fn get_config_blocking(pool: &Arc<SqlitePool>, config_id: &str) -> Result<Option<SyncConfig>> {
        use crate::schema::sync_configs::dsl;

        let mut conn = get_connection(pool)?;
        let row = dsl::sync_configs
            .find(config_id)
            .first::<SyncConfigDB>(&mut conn)
            .optional()?;
        row.map(SyncConfigDB::into_domain).transpose()
    }

    fn get_state_blocking(pool: &Arc<SqlitePool>, config_id: &str) -> Result<SyncState> {
        use crate::schema::sync_state::dsl;

        let mut conn = get_connection(pool)?;
        let row = dsl::sync_state
            .find(config_id)
            .first::<SyncStateDB>(&mut conn)
            .optional()?;
        match row {
            Some(row) => row.into_domain(),
            None => Ok(SyncState::default()),
        }
    }

    fn record_sheet_sync_blocking(
        pool: &Arc<SqlitePool>,
        config_id: &str,
        at: DateTime<Utc>,
        etag: Option<String>,
    ) -> Result<()> {
        use crate::schema::sync_state;

        let mut conn = get_connection(pool)?;
        let now = ts_to_db(Utc::now());
        let row = SyncStateDB {
            config_id: config_id.to_string(),
            last_sheet_sync_at: Some(ts_to_db(at)),
            last_db_sync_at: None,
            sheet_etag: etag.clone(),
            db_last_change_id: 0,
            updated_at: now.clone(),
        };
        diesel::insert_into(sync_state::table)
            .values(&row)
            .on_conflict(sync_state::config_id)
            .do_update()
            .set((
                sync_state::last_sheet_sync_at.eq(Some(ts_to_db(at))),
                sync_state::sheet_etag.eq(etag),
                sync_state::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn record_table_sync_blocking(
        pool: &Arc<SqlitePool>,
        config_id: &str,
        at: DateTime<Utc>,
        last_change_id: i64,
    ) -> Result<()> {
        use crate::schema::sync_state;

        let mut conn = get_connection(pool)?;
        let now = ts_to_db(Utc::now());
        let row = SyncStateDB {
            config_id: config_id.to_string(),
            last_sheet_sync_at: None,
            last_db_sync_at: Some(ts_to_db(at)),
            sheet_etag: None,
            db_last_change_id: last_change_id,
            updated_at: now.clone(),
        };
        diesel::insert_into(sync_state::table)
            .values(&row)
            .on_conflict(sync_state::config_id)
            .do_update()
            .set((
                sync_state::last_db_sync_at.eq(Some(ts_to_db(at))),
                sync_state::db_last_change_id.eq(last_change_id),
                sync_state::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn create_run_blocking(pool: &Arc<SqlitePool>, run: &SyncRun) -> Result<()> {
        use crate::schema::sync_runs;

        let mut conn = get_connection(pool)?;
        let row = SyncRunDB::from_domain(run)?;
        diesel::insert_into(sync_runs::table).values(&row).execute(&mut conn)?;
        Ok(())
    }

    fn finish_run_blocking(pool: &Arc<SqlitePool>, run: &SyncRun) -> Result<()> {
        use crate::schema::sync_runs;

        let mut conn = get_connection(pool)?;
        let row = SyncRunDB::from_domain(run)?;
        diesel::update(sync_runs::table.find(&row.id)).set(&row).execute(&mut conn)?;
        Ok(())
    }

    fn record_conflict_blocking(pool: &Arc<SqlitePool>, record: &ConflictRecord) -> Result<()> {
        use crate::schema::sync_conflicts;

        let mut conn = get_connection(pool)?;
        let row = SyncConflictDB::from_domain(record)?;
        diesel::insert_into(sync_conflicts::table).values(&row).execute(&mut conn)?;
        Ok(())
    }

    /// Recent runs for a config, newest first.
    pub fn list_runs(&self, config_id: &str, limit: i64) -> Result<Vec<SyncRun>> {
        use crate::schema::sync_runs::dsl;

        let mut conn = get_connection(&self.pool)?;
        let rows = dsl::sync_runs
            .filter(dsl::config_id.eq(config_id))
            .order(dsl::started_at.desc())
            .limit(limit)
            .load::<SyncRunDB>(&mut conn)?;
        rows.into_iter().map(SyncRunDB::into_domain).collect()
    }

    /// Conflicts recorded for a config, oldest first.
    pub fn list_conflicts(&self, config_id: &str) -> Result<Vec<ConflictRecord>> {
        use crate::schema::sync_conflicts::dsl;

        let mut conn = get_connection(&self.pool)?;
        let rows = dsl::sync_conflicts
            .filter(dsl::config_id.eq(config_id))
            .order(dsl::created_at.asc())
            .load::<SyncConflictDB>(&mut conn)?;
        rows.into_iter().map(SyncConflictDB::into_domain).collect()
    }

    /// Conflicts persisted under the manual policy that still await a decision.
    pub fn list_unresolved_conflicts(&self, config_id: &str) -> Result<Vec<ConflictRecord>> {
        use crate::schema::sync_conflicts::dsl;

        let mut conn = get_connection(&self.pool)?;
        let rows = dsl::sync_conflicts
            .filter(dsl::config_id.eq(config_id))
            .filter(dsl::resolved_at.is_null())
            .order(dsl::created_at.asc())
            .load::<SyncConflictDB>(&mut conn)?;
        rows.into_iter().map(SyncConflictDB::into_domain).collect()
    }

    async fn run_blocking<T, F>(&self, job: F) -> sheetbridge_core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<SqlitePool>) -> Result<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let result = tokio::task::spawn_blocking(move || job(pool))
            .await
            .map_err(|e| SyncError::database(format!("blocking task failed: {e}")))?;
        result.map_err(SyncError::from)
    }
}

#[async_trait]
impl MetadataStore for MetadataRepository {
    async fn list_active_configs(&self) -> sheetbridge_core::Result<Vec<SyncConfig>> {
        self.run_blocking(|pool| Self::list_active_configs_blocking(&pool)).await
    }

    async fn get_config(&self, config_id: &str) -> sheetbridge_core::Result<Option<SyncConfig>> {
        let config_id = config_id.to_string();
        self.run_blocking(move |pool| Self::get_config_blocking(&pool, &config_id)).await
    }

    async fn get_state(&self, config_id: &str) -> sheetbridge_core::Result<SyncState> {
        let config_id = config_id.to_string();
        self.run_blocking(move |pool| Self::get_state_blocking(&pool, &config_id)).await
    }

    async fn record_sheet_sync(
        &self,
        config_id: &str,
        at: DateTime<Utc>,
        etag: Option<String>,
    ) -> sheetbridge_core::Result<()> {
        let config_id = config_id.to_string();
        self.run_blocking(move |pool| Self::record_sheet_sync_blocking(&pool, &config_id, at, etag))
            .await
    }

    async fn record_table_sync(
        &self,
        config_id: &str,
        at: DateTime<Utc>,
        last_change_id: i64,
    ) -> sheetbridge_core::Result<()> {
        let config_id = config_id.to_string();
        self.run_blocking(move |pool| {
            Self::record_table_sync_blocking(&pool, &config_id, at, last_change_id)
        })
        .await
    }

    async fn create_run(&self, run: &SyncRun) -> sheetbridge_core::Result<()> {
        let run = run.clone();
        self.run_blocking(move |pool| Self::create_run_blocking(&pool, &run)).await
    }

    async fn finish_run(&self, run: &SyncRun) -> sheetbridge_core::Result<()> {
        let run = run.clone();
        self.run_blocking(move |pool| Self::finish_run_blocking(&pool, &run)).await
    }

    async fn record_conflict(&self, record: &ConflictRecord) -> sheetbridge_core::Result<()> {
        let record = record.clone();
        self.run_blocking(move |pool| Self::record_conflict_blocking(&pool, &record)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_db;
    use sheetbridge_core::models::{
        ColumnMapping, ConflictPolicy, ConflictWinner, RunStatus, SyncDirection,
    };
    use uuid::Uuid;

    fn config(id: &str, active: bool) -> SyncConfig {
        SyncConfig {
            id: id.to_string(),
            name: format!("config {id}"),
            spreadsheet_id: "sheet-1".to_string(),
            range: "Sheet1!A1:C100".to_string(),
            target_table: "people".to_string(),
            mapping: ColumnMapping::from_pairs(&[("A", "id"), ("B", "name")]).unwrap(),
            conflict_policy: ConflictPolicy::LastWriteWins,
            interval_secs: 10,
            active,
        }
    }

    #[tokio::test]
    async fn config_upsert_creates_state_row() {
        let (pool, _dir) = setup_db();
        let repo = MetadataRepository::new(pool);
        repo.upsert_config(&config("cfg-1", true)).unwrap();

        let state = repo.get_state("cfg-1").await.unwrap();
        assert!(state.last_sheet_sync_at.is_none());
        assert_eq!(state.db_last_change_id, 0);

        let listed = repo.list_active_configs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "cfg-1");
    }

    #[tokio::test]
    async fn inactive_configs_are_not_listed() {
        let (pool, _dir) = setup_db();
        let repo = MetadataRepository::new(pool);
        repo.upsert_config(&config("cfg-on", true)).unwrap();
        repo.upsert_config(&config("cfg-off", false)).unwrap();

        let listed = repo.list_active_configs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "cfg-on");
        assert!(repo.get_config("cfg-off").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_markers_update_independently() {
        let (pool, _dir) = setup_db();
        let repo = MetadataRepository::new(pool);
        repo.upsert_config(&config("cfg-1", true)).unwrap();

        let sheet_at = Utc::now();
        repo.record_sheet_sync("cfg-1", sheet_at, Some("etag-3".to_string())).await.unwrap();
        let table_at = Utc::now();
        repo.record_table_sync("cfg-1", table_at, 42).await.unwrap();

        let state = repo.get_state("cfg-1").await.unwrap();
        assert!(state.last_sheet_sync_at.is_some());
        assert_eq!(state.sheet_etag.as_deref(), Some("etag-3"));
        assert!(state.last_db_sync_at.is_some());
        assert_eq!(state.db_last_change_id, 42);

        // A later sheet sync leaves the table markers alone.
        repo.record_sheet_sync("cfg-1", Utc::now(), None).await.unwrap();
        let state = repo.get_state("cfg-1").await.unwrap();
        assert_eq!(state.sheet_etag, None);
        assert_eq!(state.db_last_change_id, 42);
    }

    #[tokio::test]
    async fn run_lifecycle_round_trips() {
        let (pool, _dir) = setup_db();
        let repo = MetadataRepository::new(pool);
        repo.upsert_config(&config("cfg-1", true)).unwrap();

        let mut run = SyncRun::begin("cfg-1", SyncDirection::SheetToTable);
        repo.create_run(&run).await.unwrap();

        run.rows_affected = 2;
        run.finish(RunStatus::Success, None);
        repo.finish_run(&run).await.unwrap();

        let runs = repo.list_runs("cfg-1", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].rows_affected, 2);
        assert!(runs[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn unresolved_conflicts_are_queryable() {
        let (pool, _dir) = setup_db();
        let repo = MetadataRepository::new(pool);
        repo.upsert_config(&config("cfg-1", true)).unwrap();

        let resolved = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            config_id: "cfg-1".to_string(),
            row_key: "1".to_string(),
            sheet_value: serde_json::json!({"id": "1", "name": "a"}),
            table_value: serde_json::json!({"id": "1", "name": "b"}),
            sheet_changed_at: Some(Utc::now()),
            table_changed_at: Some(Utc::now()),
            policy: ConflictPolicy::LastWriteWins,
            winner: ConflictWinner::Table,
            resolved_value: Some(serde_json::json!({"id": "1", "name": "b"})),
            resolved_at: Some(Utc::now()),
        };
        let manual = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            row_key: "2".to_string(),
            policy: ConflictPolicy::Manual,
            winner: ConflictWinner::Manual,
            resolved_value: None,
            resolved_at: None,
            ..resolved.clone()
        };
        repo.record_conflict(&resolved).await.unwrap();
        repo.record_conflict(&manual).await.unwrap();

        assert_eq!(repo.list_conflicts("cfg-1").unwrap().len(), 2);
        let unresolved = repo.list_unresolved_conflicts("cfg-1").unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].row_key, "2");
    }

    #[tokio::test]
    async fn delete_config_tears_down_state_and_history() {
        let (pool, _dir) = setup_db();
        let repo = MetadataRepository::new(pool);
        repo.upsert_config(&config("cfg-1", true)).unwrap();

        let run = SyncRun::begin("cfg-1", SyncDirection::TableToSheet);
        repo.create_run(&run).await.unwrap();
        repo.delete_config("cfg-1").unwrap();

        assert!(repo.get_config("cfg-1").await.unwrap().is_none());
        assert!(repo.list_runs("cfg-1", 10).unwrap().is_empty());
        let state = repo.get_state("cfg-1").await.unwrap();
        assert_eq!(state, SyncState::default());
    }
}
