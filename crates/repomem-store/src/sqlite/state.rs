use super::SqliteChunkStore;
use crate::error::StoreError;
use crate::types::IndexState;

type StateRow = (String, String, String, String, String);

fn from_row(row: StateRow) -> Result<IndexState, StoreError> {
    let (repo_id, file_path, last_indexed_commit, content_hash, schema_version) = row;
    Ok(IndexState {
        repo_id,
        file_path,
        last_indexed_commit,
        content_hash,
        schema_version: schema_version.parse()?,
    })
}

impl SqliteChunkStore {
    pub(super) async fn load_index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> Result<Option<IndexState>, StoreError> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT repo_id, file_path, last_indexed_commit, content_hash, schema_version \
             FROM index_state WHERE repo_id = ? AND file_path = ?",
        )
        .bind(repo_id)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(from_row).transpose()
    }

    pub(super) async fn load_index_states(
        &self,
        repo_id: &str,
    ) -> Result<Vec<IndexState>, StoreError> {
        let rows: Vec<StateRow> = sqlx::query_as(
            "SELECT repo_id, file_path, last_indexed_commit, content_hash, schema_version \
             FROM index_state WHERE repo_id = ? ORDER BY file_path ASC",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(from_row).collect()
    }

    pub(super) async fn save_index_state(&self, state: &IndexState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO index_state \
             (repo_id, file_path, last_indexed_commit, content_hash, schema_version) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(repo_id, file_path) DO UPDATE SET \
             last_indexed_commit = excluded.last_indexed_commit, \
             content_hash = excluded.content_hash, \
             schema_version = excluded.schema_version",
        )
        .bind(&state.repo_id)
        .bind(&state.file_path)
        .bind(&state.last_indexed_commit)
        .bind(&state.content_hash)
        .bind(state.schema_version.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(super) async fn delete_index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM index_state WHERE repo_id = ? AND file_path = ?")
            .bind(repo_id)
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
