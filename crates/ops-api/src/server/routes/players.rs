#[derive(Debug, Serialize)]
struct SessionResponse {
    schema_version: String,
    player_id: String,
    cascade: CascadeReport,
}

async fn open_session(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
) -> Json<SessionResponse> {
    let cascade = state.api().open_session(&player_id);
    Json(SessionResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        cascade,
    })
}

#[derive(Debug, Serialize)]
struct ActiveOperationsResponse {
    schema_version: String,
    player_id: String,
    operations: Vec<ActiveOperationView>,
}

async fn list_active_operations(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
) -> Json<ActiveOperationsResponse> {
    let operations = state.api().list_active_operations(&player_id);
    Json(ActiveOperationsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        operations,
    })
}

#[derive(Debug, Serialize)]
struct InboxResponse {
    schema_version: String,
    player_id: String,
    messages: Vec<InboxMessage>,
}

async fn list_inbox(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
) -> Json<InboxResponse> {
    let messages = state.api().list_inbox_messages(&player_id);
    Json(InboxResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        messages,
    })
}

/// A terminal line or an already-structured action.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubmitActionRequest {
    Command { command: String },
    Action(PlayerAction),
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    schema_version: String,
    player_id: String,
    result: ValidationResult,
}

async fn submit_action(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<SubmitActionRequest>,
) -> Result<Json<ActionResponse>, HttpApiError> {
    let result = match request {
        SubmitActionRequest::Command { command } => state
            .api()
            .submit_command(&player_id, &command)
            .map_err(HttpApiError::from_api)?,
        SubmitActionRequest::Action(action) => state.api().submit_action(&player_id, &action),
    };

    Ok(Json(ActionResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        result,
    }))
}

async fn confirm_step(
    Path((player_id, operation_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, HttpApiError> {
    let result = state
        .api()
        .confirm_step(&player_id, &operation_id)
        .map_err(HttpApiError::from_api)?;

    Ok(Json(ActionResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        result,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct FilesystemQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct FilesystemResponse {
    schema_version: String,
    host_id: String,
    path: String,
    node: Option<FilesystemNode>,
}

async fn resolve_filesystem(
    Path((player_id, host_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Query(query): Query<FilesystemQuery>,
) -> Result<Json<FilesystemResponse>, HttpApiError> {
    let path = query
        .path
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| "/".to_string());
    if !path.trim_start().starts_with('/') {
        return Err(HttpApiError::invalid_query(
            "path must be absolute",
            Some(format!("path={path}")),
        ));
    }

    let node = state
        .api()
        .resolve_filesystem(&player_id, &host_id, &path)
        .map_err(HttpApiError::from_api)?;

    Ok(Json(FilesystemResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        host_id,
        path,
        node,
    }))
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    schema_version: String,
    progress: ProgressView,
}

async fn get_progress(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
) -> Json<ProgressResponse> {
    Json(ProgressResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        progress: state.api().get_progress_state(&player_id),
    })
}

#[derive(Debug, Deserialize, Default)]
struct PaginationQuery {
    cursor: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LedgerPage {
    schema_version: String,
    player_id: String,
    balance: i64,
    cursor: usize,
    next_cursor: Option<usize>,
    entries: Vec<LedgerEntry>,
}

async fn get_ledger(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<PaginationQuery>,
) -> Result<Json<LedgerPage>, HttpApiError> {
    let balance = state.api().get_progress_state(&player_id).credits;
    let entries = state
        .api()
        .ledger_entries(&player_id)
        .map_err(HttpApiError::from_api)?;
    let (start, end, next_cursor) = paginate(entries.len(), query.cursor, query.page_size)?;

    Ok(Json(LedgerPage {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        balance,
        cursor: start,
        next_cursor,
        entries: entries[start..end].to_vec(),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    after_sequence: Option<u64>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EventsPage {
    schema_version: String,
    player_id: String,
    next_after_sequence: Option<u64>,
    events: Vec<OperationEvent>,
}

async fn get_events(
    Path(player_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsPage>, HttpApiError> {
    let page_size = clamp_page_size(query.page_size);
    let events = state
        .api()
        .operation_events(&player_id, query.after_sequence.unwrap_or(0), page_size)
        .map_err(HttpApiError::from_api)?;
    let next_after_sequence = if events.len() == page_size {
        events.last().map(|event| event.sequence)
    } else {
        None
    };

    Ok(Json(EventsPage {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        player_id,
        next_after_sequence,
        events,
    }))
}
