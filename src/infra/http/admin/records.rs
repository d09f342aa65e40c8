use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::cache::{InvalidationOutcome, RecordAction, RecordChange, RecordRef};
use crate::infra::content::{ContentKind, ContentRecord};
use crate::infra::http::error::HttpError;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::records";

#[derive(Debug, Deserialize)]
pub(super) struct RecordForm {
    title: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Serialize)]
struct RecordChangeView {
    action: RecordAction,
    path: String,
    invalidation: InvalidationOutcome,
}

pub(super) async fn save_record(
    State(state): State<AdminState>,
    Path((segment, id)): Path<(String, u64)>,
    Json(form): Json<RecordForm>,
) -> Result<Response, HttpError> {
    let kind = parse_kind(&segment)?;
    let title = form.title.trim();
    if title.is_empty() {
        return Err(HttpError::rejected(
            SOURCE,
            StatusCode::UNPROCESSABLE_ENTITY,
            "Title is required",
            "record title must not be empty",
        ));
    }

    let action = state.content.upsert(
        kind,
        ContentRecord {
            id,
            title: title.to_string(),
            body: form.body,
        },
    );
    let status = match action {
        RecordAction::Insert => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(notify(&state, kind, id, action).await)).into_response())
}

pub(super) async fn delete_record(
    State(state): State<AdminState>,
    Path((segment, id)): Path<(String, u64)>,
) -> Result<Response, HttpError> {
    let kind = parse_kind(&segment)?;
    if state.content.remove(kind, id).is_none() {
        return Err(HttpError::rejected(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Record not found",
            format!("no {} with id {id}", kind.record_type()),
        ));
    }
    Ok(Json(notify(&state, kind, id, RecordAction::Delete).await).into_response())
}

async fn notify(
    state: &AdminState,
    kind: ContentKind,
    id: u64,
    action: RecordAction,
) -> RecordChangeView {
    let change = RecordChange::new(RecordRef::new(kind.record_type(), id), action);
    let invalidation = state.coordinator.on_record_changed(&change).await;
    RecordChangeView {
        action,
        path: kind.detail_path(id),
        invalidation,
    }
}

fn parse_kind(segment: &str) -> Result<ContentKind, HttpError> {
    ContentKind::from_segment(segment).ok_or_else(|| {
        HttpError::rejected(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Unknown record type",
            format!("`{segment}` is not a record type"),
        )
    })
}
