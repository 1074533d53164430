#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PublishRequest {
    Batch(Vec<Operation>),
    Wrapped { operations: Vec<Operation> },
}

impl PublishRequest {
    fn into_operations(self) -> Vec<Operation> {
        match self {
            Self::Batch(operations) | Self::Wrapped { operations } => operations,
        }
    }
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    schema_version: String,
    report: PublishReport,
}

#[derive(Debug, Serialize)]
struct OperationListResponse {
    schema_version: String,
    operations: Vec<Operation>,
}

async fn publish_operations(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, HttpApiError> {
    let report = state
        .api()
        .publish_operations(request.into_operations())
        .map_err(HttpApiError::from_api)?;

    Ok(Json(PublishResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        report,
    }))
}

async fn list_operations(State(state): State<AppState>) -> Json<OperationListResponse> {
    Json(OperationListResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        operations: state.api().list_operations(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegisterHostsRequest {
    Batch(Vec<HostRecord>),
    Wrapped { hosts: Vec<HostRecord> },
}

impl RegisterHostsRequest {
    fn into_hosts(self) -> Vec<HostRecord> {
        match self {
            Self::Batch(hosts) | Self::Wrapped { hosts } => hosts,
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterHostsResponse {
    schema_version: String,
    registered: usize,
}

#[derive(Debug, Serialize)]
struct HostListResponse {
    schema_version: String,
    hosts: Vec<HostRecord>,
}

async fn register_hosts(
    State(state): State<AppState>,
    Json(request): Json<RegisterHostsRequest>,
) -> Result<Json<RegisterHostsResponse>, HttpApiError> {
    let registered = state
        .api()
        .register_hosts(request.into_hosts())
        .map_err(HttpApiError::from_api)?;

    Ok(Json(RegisterHostsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        registered,
    }))
}

async fn list_hosts(State(state): State<AppState>) -> Json<HostListResponse> {
    Json(HostListResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        hosts: state.api().list_hosts(),
    })
}
