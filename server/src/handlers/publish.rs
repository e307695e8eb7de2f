//! Publish task creation, on request and after local commits.

use std::collections::BTreeSet;

use chrono::Utc;
use innsync_engine::{
    CellKey, CommitEvent, Connection, Error, MappingPair, PublishScope, PublishTask, PushType,
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::AppState;

/// Priority of tasks raised by local commits; lower runs first.
pub const COMMIT_PRIORITY: i32 = 0;

/// Request body for an explicit publish.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub scope: PublishScope,
    pub push_type: PushType,
    #[serde(default)]
    pub priority: i32,
}

/// Queue a publish task for a connection.
pub async fn enqueue_publish(
    state: &AppState,
    connection_id: &str,
    request: PublishRequest,
) -> Result<PublishTask> {
    if state.store.get_connection(connection_id).await?.is_none() {
        return Err(Error::not_found("connection", connection_id).into());
    }
    if request.scope.is_empty() {
        return Err(AppError::BadRequest("publish scope is empty".to_string()));
    }

    let scope = match request.scope {
        PublishScope::Cells { cells } => PublishScope::cells(cells),
        range => range,
    };
    let task = PublishTask::new(
        uuid::Uuid::new_v4().to_string(),
        connection_id,
        scope,
        request.push_type,
        request.priority,
        Utc::now(),
    );
    state.store.insert_task(&task).await?;

    tracing::info!(
        connection_id = %connection_id,
        task_id = %task.id,
        push_type = %task.push_type,
        "Publish task queued"
    );
    Ok(task)
}

/// Active connections with at least one mapped key, and those keys.
pub async fn connections_covering(
    state: &AppState,
    keys: &[CellKey],
) -> Result<Vec<(Connection, Vec<CellKey>)>> {
    let mut covering = Vec::new();
    for connection in state.store.list_connections().await? {
        if !connection.active {
            continue;
        }
        let mappings = state.store.mappings(&connection.id).await?;
        let mapped: Vec<CellKey> = keys
            .iter()
            .filter(|key| {
                let pair = MappingPair::new(key.room_type.clone(), key.rate_plan.clone());
                mappings.product_code(&pair).is_some()
            })
            .cloned()
            .collect();
        if !mapped.is_empty() {
            covering.push((connection, mapped));
        }
    }
    Ok(covering)
}

/// Queue publish tasks for every connection affected by a local commit.
pub async fn auto_enqueue(state: &AppState, event: &CommitEvent) -> Result<Vec<PublishTask>> {
    let now = Utc::now();
    let mut tasks = Vec::new();

    for (connection, cells) in connections_covering(state, &event.cells).await? {
        let task = PublishTask::new(
            uuid::Uuid::new_v4().to_string(),
            &connection.id,
            PublishScope::cells(cells),
            event.push_type,
            COMMIT_PRIORITY,
            now,
        );
        state.store.insert_task(&task).await?;
        tracing::info!(
            connection_id = %connection.id,
            task_id = %task.id,
            push_type = %task.push_type,
            "Publish task queued after local commit"
        );
        tasks.push(task);
    }

    if tasks.is_empty() {
        let pairs: BTreeSet<String> = event
            .cells
            .iter()
            .map(|k| format!("{}/{}", k.room_type, k.rate_plan))
            .collect();
        tracing::debug!(pairs = ?pairs, "Local commit touches no mapped connection");
    }
    Ok(tasks)
}
