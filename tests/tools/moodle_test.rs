//! Moodle tool tests (configuration and spec shapes; no network).

use serde_json::json;

use lectern::tools::moodle::{
    assignments_definition, courses_definition, get_moodle_assignments_status, get_moodle_courses,
    MoodleConfig,
};
use lectern::tools::ToolError;

#[tokio::test]
async fn unconfigured_courses_call_reports_not_configured() {
    let config = MoodleConfig::default();
    let result = get_moodle_courses(&config, json!({"user_id": "42"})).await;
    assert!(matches!(result, Err(ToolError::NotConfigured(_))));
}

#[tokio::test]
async fn unconfigured_assignments_call_reports_not_configured() {
    let config = MoodleConfig::default();
    let result = get_moodle_assignments_status(&config, json!({"user_id": "42"})).await;
    assert!(matches!(result, Err(ToolError::NotConfigured(_))));
}

#[tokio::test]
async fn missing_user_id_is_invalid_input() {
    let config = MoodleConfig {
        url: Some("https://moodle.test".to_owned()),
        token: Some("tok".to_owned()),
    };
    let result = get_moodle_courses(&config, json!({})).await;
    assert!(matches!(result, Err(ToolError::InvalidInput(_))));

    let result = get_moodle_assignments_status(&config, json!({"user_id": "  "})).await;
    assert!(matches!(result, Err(ToolError::InvalidInput(_))));
}

#[test]
fn specs_declare_required_fields_and_defaults() {
    let courses = courses_definition();
    assert_eq!(courses.name, "get_moodle_courses");
    assert_eq!(courses.parameters["required"][0], "user_id");

    let assignments = assignments_definition();
    assert_eq!(assignments.name, "get_moodle_assignments_status");
    let props = &assignments.parameters["properties"];
    assert!(props["days_past"].is_object());
    assert!(props["days_future"].is_object());
    assert!(props["limit"].is_object());
}
