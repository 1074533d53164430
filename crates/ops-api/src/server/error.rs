#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status,
            error: ApiError::new(code, message, details),
        }
    }

    fn operation_not_found(operation_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::OperationNotFound,
            "operation_id does not match a published operation",
            Some(format!("operation_id={operation_id}")),
        )
    }

    fn host_not_found(host_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::HostNotFound,
            "host_id is not in the host catalog",
            Some(format!("host_id={host_id}")),
        )
    }

    fn invalid_query(message: impl Into<String>, details: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidQuery, message, details)
    }

    fn invalid_action(message: impl Into<String>, details: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidAction, message, details)
    }

    fn invalid_definition(message: impl Into<String>, details: Option<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::InvalidDefinition,
            message,
            details,
        )
    }

    fn internal(message: impl Into<String>, details: Option<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            message,
            details,
        )
    }

    fn from_persistence(err: PersistenceError) -> Self {
        Self::internal("persistence operation failed", Some(err.to_string()))
    }

    fn from_api(err: EngineApiError) -> Self {
        match err {
            EngineApiError::Registry(err) => Self::invalid_definition(
                "operation definitions were rejected",
                Some(err.to_string()),
            ),
            EngineApiError::Catalog(err) => {
                Self::invalid_definition("host records were rejected", Some(err.to_string()))
            }
            EngineApiError::Parse(err) => {
                Self::invalid_action("command could not be parsed", Some(err.to_string()))
            }
            EngineApiError::UnknownHost(host_id) => Self::host_not_found(&host_id),
            EngineApiError::Persistence(err) => Self::from_persistence(err),
            EngineApiError::Engine(err) => match err {
                EngineError::UnknownOperation(operation_id) => {
                    Self::operation_not_found(&operation_id)
                }
                EngineError::NotActive(operation_id) => Self::new(
                    StatusCode::CONFLICT,
                    ErrorCode::StepNotSatisfied,
                    "operation is not active for this player",
                    Some(format!("operation_id={operation_id}")),
                ),
                EngineError::StepNotSatisfied {
                    operation_id,
                    step_id,
                } => Self::new(
                    StatusCode::CONFLICT,
                    ErrorCode::StepNotSatisfied,
                    "current step has not been satisfied",
                    Some(format!("operation_id={operation_id} step_id={step_id}")),
                ),
                other => Self::internal("engine operation failed", Some(other.to_string())),
            },
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = ?self.error.error_code, message = %self.error.message, "request failed");
        }
        (self.status, Json(self.error)).into_response()
    }
}
