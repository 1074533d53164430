use super::*;

#[test]
fn pagination_enforces_max_bounds() {
    let (start, end, next_cursor) = paginate(100, Some(10), Some(20)).expect("page should work");
    assert_eq!(start, 10);
    assert_eq!(end, 30);
    assert_eq!(next_cursor, Some(30));

    let (_, end, next_cursor) = paginate(100, Some(90), Some(50)).expect("tail page");
    assert_eq!(end, 100);
    assert_eq!(next_cursor, None);

    assert_eq!(clamp_page_size(Some(0)), 1);
    assert_eq!(clamp_page_size(Some(1_000_000)), MAX_PAGE_SIZE);

    let out_of_range = paginate(5, Some(10), Some(1));
    assert!(out_of_range.is_err());
}

#[test]
fn submit_request_accepts_command_lines_and_tagged_actions() {
    let command: SubmitActionRequest =
        serde_json::from_str(r#"{"command": "scan 10.0.0.5"}"#).expect("command body");
    assert!(matches!(
        command,
        SubmitActionRequest::Command { ref command } if command == "scan 10.0.0.5"
    ));

    let action: SubmitActionRequest =
        serde_json::from_str(r#"{"type": "connect", "target_ip": "10.0.0.5"}"#)
            .expect("tagged body");
    assert!(matches!(
        action,
        SubmitActionRequest::Action(PlayerAction::Connect { ref target_ip }) if target_ip == "10.0.0.5"
    ));

    let disconnect: SubmitActionRequest =
        serde_json::from_str(r#"{"type": "disconnect"}"#).expect("unit action");
    assert!(matches!(
        disconnect,
        SubmitActionRequest::Action(PlayerAction::Disconnect)
    ));
}

#[test]
fn publish_request_accepts_bare_and_wrapped_batches() {
    let bare: PublishRequest = serde_json::from_str("[]").expect("bare batch");
    assert!(bare.into_operations().is_empty());

    let wrapped: PublishRequest =
        serde_json::from_str(r#"{"operations": []}"#).expect("wrapped batch");
    assert!(wrapped.into_operations().is_empty());
}

#[test]
fn api_errors_map_to_status_codes() {
    let parse = HttpApiError::from_api(EngineApiError::Parse(
        "format c:".parse::<PlayerAction>().expect_err("unknown verb"),
    ));
    assert_eq!(parse.status, StatusCode::BAD_REQUEST);
    assert_eq!(parse.error.error_code, ErrorCode::InvalidAction);

    let host = HttpApiError::from_api(EngineApiError::UnknownHost("ghost".to_string()));
    assert_eq!(host.status, StatusCode::NOT_FOUND);
    assert_eq!(host.error.error_code, ErrorCode::HostNotFound);

    let unknown = HttpApiError::from_api(EngineApiError::Engine(EngineError::UnknownOperation(
        "SR-999".to_string(),
    )));
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    assert_eq!(unknown.error.error_code, ErrorCode::OperationNotFound);

    let pending = HttpApiError::from_api(EngineApiError::Engine(EngineError::StepNotSatisfied {
        operation_id: "SR-201".to_string(),
        step_id: "confirm".to_string(),
    }));
    assert_eq!(pending.status, StatusCode::CONFLICT);
    assert_eq!(pending.error.error_code, ErrorCode::StepNotSatisfied);

    let corrupt = serde_json::from_str::<u8>("x").expect_err("not a number");
    let stored = HttpApiError::from_api(EngineApiError::Persistence(PersistenceError::Serde(
        corrupt,
    )));
    assert_eq!(stored.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(stored.error.error_code, ErrorCode::InternalError);
}
