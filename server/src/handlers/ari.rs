//! ARI reads, staging, bulk edit, paste, local commit and clearing.

use chrono::{NaiveDate, Utc};
use innsync_engine::{
    AriCell, BulkEdit, CellKey, CommitEvent, LedgerOperation, PublishTask, Selection,
    SyncLogEntry, TaskId,
};
use serde::{Deserialize, Serialize};

use super::{auto_enqueue, connections_covering};
use crate::error::{AppError, Result};
use crate::AppState;

/// A full cell value addressed by its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellValue {
    #[serde(flatten)]
    pub key: CellKey,
    #[serde(flatten)]
    pub cell: AriCell,
}

impl CellValue {
    fn into_pair(self) -> (CellKey, AriCell) {
        (self.key, self.cell)
    }
}

/// Committed, staged and effective value of one cell.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveCell {
    #[serde(flatten)]
    pub key: CellKey,
    pub committed: Option<AriCell>,
    pub staged: Option<AriCell>,
    pub effective: Option<AriCell>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResponse {
    pub staged: usize,
}

/// Request body for pasting a selection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasteRequest {
    pub selection: Selection,
    /// Date the earliest copied cell lands on
    pub anchor: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub committed: usize,
    /// Publish tasks queued for the change
    pub tasks: Vec<PublishTask>,
}

/// Request body for clearing pending changes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearRequest {
    /// Cells to clear; every staged cell when empty
    #[serde(default)]
    pub cells: Vec<CellKey>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub cleared: usize,
    pub cancelled_tasks: Vec<TaskId>,
}

/// Staged value over committed value for one cell.
pub async fn get_effective(state: &AppState, key: CellKey) -> Result<EffectiveCell> {
    let (committed, staged) = state.store.get_cell(&key).await?;
    let effective = staged.clone().or_else(|| committed.clone());
    Ok(EffectiveCell {
        key,
        committed,
        staged,
        effective,
    })
}

/// Stage full cells. A later stage of the same key replaces the earlier one.
pub async fn stage_cells(state: &AppState, cells: Vec<CellValue>) -> Result<StageResponse> {
    let cells: Vec<_> = cells.into_iter().map(CellValue::into_pair).collect();
    state.store.stage_cells(&cells, Utc::now()).await?;
    tracing::debug!(count = cells.len(), "Staged ARI cells");
    Ok(StageResponse {
        staged: cells.len(),
    })
}

/// Apply a patch over a date range and stage the resulting full cells.
pub async fn bulk_edit(state: &AppState, edit: BulkEdit) -> Result<StageResponse> {
    if edit.patch.is_empty() {
        return Err(AppError::BadRequest("bulk edit changes nothing".to_string()));
    }
    if edit.range.end < edit.range.start {
        return Err(AppError::BadRequest(format!(
            "date range ends before it starts: {}..{}",
            edit.range.start, edit.range.end
        )));
    }

    let keys = edit.keys();
    let current = state.store.effective_cells(&keys).await?;
    let cells: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let cell = edit.patch.apply_to(current.get(&key));
            (key, cell)
        })
        .collect();

    state.store.stage_cells(&cells, Utc::now()).await?;
    tracing::info!(count = cells.len(), "Bulk edit staged");
    Ok(StageResponse {
        staged: cells.len(),
    })
}

/// Copy the selected effective values and stage them at a new anchor date.
pub async fn paste_selection(state: &AppState, request: PasteRequest) -> Result<StageResponse> {
    if request.selection.cells.is_empty() {
        return Err(AppError::BadRequest("selection is empty".to_string()));
    }

    let current = state.store.effective_cells(&request.selection.cells).await?;
    let clipboard = request.selection.copy(|key| current.get(key).cloned());
    let cells = clipboard.paste_at(request.anchor)?;

    state.store.stage_cells(&cells, Utc::now()).await?;
    tracing::info!(count = cells.len(), anchor = %request.anchor, "Selection pasted");
    Ok(StageResponse {
        staged: cells.len(),
    })
}

/// Write committed values directly and queue publish tasks for the change.
pub async fn commit_cells(state: &AppState, cells: Vec<CellValue>) -> Result<CommitResponse> {
    let cells: Vec<_> = cells.into_iter().map(CellValue::into_pair).collect();
    for (_, cell) in &cells {
        cell.validate()?;
    }

    let changes = state.store.commit_local(&cells).await?;
    let tasks = match CommitEvent::from_changes(&changes) {
        Some(event) => auto_enqueue(state, &event).await?,
        None => Vec::new(),
    };

    Ok(CommitResponse {
        committed: changes.len(),
        tasks,
    })
}

/// Drop staged changes and the queued tasks that would publish them.
///
/// Tasks already processing finish under their own retry policy.
pub async fn clear_pending(state: &AppState, request: ClearRequest) -> Result<ClearResponse> {
    let keys = if request.cells.is_empty() {
        state.store.staged_keys().await?
    } else {
        request.cells
    };

    let (cleared, cancelled_tasks) = state.store.clear_pending(&keys).await?;

    let now = Utc::now();
    for (connection, _) in connections_covering(state, &keys).await? {
        state
            .ledger
            .record(SyncLogEntry::new(
                &connection.id,
                LedgerOperation::StagingCleared,
                format!(
                    "cleared {cleared} staged cells, cancelled {} queued tasks",
                    cancelled_tasks.len()
                ),
                true,
                now,
            ))
            .await;
    }

    tracing::info!(
        cleared = cleared,
        cancelled = cancelled_tasks.len(),
        "Pending changes cleared"
    );
    Ok(ClearResponse {
        cleared,
        cancelled_tasks,
    })
}
