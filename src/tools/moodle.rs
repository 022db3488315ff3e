//! Moodle LMS reference tools.
//!
//! Two tools backed by the Moodle Web Services REST endpoint:
//! - `get_moodle_courses` — courses a user is enrolled in
//! - `get_moodle_assignments_status` — assignment completion/due/missed
//!   buckets, fanning out one submission-status call per assignment under a
//!   bounded concurrency semaphore.
//!
//! Required web-service functions: `core_enrol_get_users_courses`,
//! `mod_assign_get_assignments`, `mod_assign_get_submission_status`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::providers::ToolDefinition;

use super::ToolError;

/// Default look-back/look-ahead window in days.
const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Default bound on assignments checked per call.
const DEFAULT_ASSIGNMENT_LIMIT: usize = 40;

/// Concurrent submission-status requests.
const SUBMISSION_CONCURRENCY: usize = 8;

/// Moodle connection settings for the tools.
#[derive(Debug, Clone, Default)]
pub struct MoodleConfig {
    /// Moodle site URL.
    pub url: Option<String>,
    /// Web-service token.
    pub token: Option<String>,
}

impl MoodleConfig {
    /// Extract the Moodle knobs from process settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.moodle_url.clone(),
            token: settings.moodle_token.clone(),
        }
    }

    /// The REST endpoint, or a not-configured error.
    fn ws_url(&self) -> Result<(String, String), ToolError> {
        match (&self.url, &self.token) {
            (Some(url), Some(token)) => {
                let base = url.trim_end_matches('/');
                Ok((format!("{base}/webservice/rest/server.php"), token.clone()))
            }
            _ => Err(ToolError::NotConfigured(
                "MOODLE_URL and/or MOODLE_TOKEN not configured".to_owned(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// Function-calling spec for `get_moodle_courses`.
pub fn courses_definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_moodle_courses".to_owned(),
        description: "Get the list of courses a user is enrolled in from Moodle LMS".to_owned(),
        parameters: json!({
            "type": "object",
            "properties": {
                "user_id": {
                    "type": "string",
                    "description": "The Moodle user identifier (username or ID)"
                }
            },
            "required": ["user_id"]
        }),
    }
}

/// Function-calling spec for `get_moodle_assignments_status`.
pub fn assignments_definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_moodle_assignments_status".to_owned(),
        description:
            "Get Moodle assignment completion and due status for a user (completed, due, missed)"
                .to_owned(),
        parameters: json!({
            "type": "object",
            "properties": {
                "user_id": {
                    "type": "string",
                    "description": "The Moodle user identifier (numeric ID)"
                },
                "days_past": {
                    "type": "integer",
                    "description": "How many days back to look for recently-due assignments (default 30)",
                    "minimum": 0
                },
                "days_future": {
                    "type": "integer",
                    "description": "How many days ahead to look for upcoming assignments (default 30)",
                    "minimum": 0
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of assignments to check submission status for (default 40)",
                    "minimum": 1
                }
            },
            "required": ["user_id"]
        }),
    }
}

// ---------------------------------------------------------------------------
// Web-service plumbing
// ---------------------------------------------------------------------------

/// Call one Moodle web-service function.
///
/// Moodle reports errors as a 200 with an `exception` field, so that shape
/// is converted into a failure here.
async fn ws_get(
    client: &reqwest::Client,
    ws_url: &str,
    token: &str,
    function: &str,
    extra_params: &[(String, String)],
) -> Result<Value, ToolError> {
    let mut params: Vec<(String, String)> = vec![
        ("wstoken".to_owned(), token.to_owned()),
        ("wsfunction".to_owned(), function.to_owned()),
        ("moodlewsrestformat".to_owned(), "json".to_owned()),
    ];
    params.extend_from_slice(extra_params);

    let response = client
        .get(ws_url)
        .query(&params)
        .send()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("moodle request failed: {e}")))?;

    let data: Value = response
        .error_for_status()
        .map_err(|e| ToolError::ExecutionFailed(format!("moodle returned error status: {e}")))?
        .json()
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("moodle response parse error: {e}")))?;

    if let Some(exception) = data.get("exception") {
        let message = data
            .get("message")
            .or_else(|| data.get("errorcode"))
            .and_then(Value::as_str)
            .unwrap_or("Moodle API error");
        warn!(%exception, message, function, "moodle web-service error");
        return Err(ToolError::ExecutionFailed(message.to_owned()));
    }

    Ok(data)
}

fn http_client() -> Result<reqwest::Client, ToolError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .build()
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
}

// ---------------------------------------------------------------------------
// get_moodle_courses
// ---------------------------------------------------------------------------

/// Execute `get_moodle_courses`.
///
/// # Errors
///
/// Returns [`ToolError::InvalidInput`] when `user_id` is missing and
/// [`ToolError::NotConfigured`] when the Moodle knobs are unset.
pub async fn get_moodle_courses(config: &MoodleConfig, input: Value) -> Result<String, ToolError> {
    let user_id = require_user_id(&input)?;
    let (ws_url, token) = config.ws_url()?;
    let client = http_client()?;

    let courses = ws_get(
        &client,
        &ws_url,
        &token,
        "core_enrol_get_users_courses",
        &[("userid".to_owned(), user_id.clone())],
    )
    .await;

    match courses {
        Ok(data) => {
            let listed: Vec<Value> = data
                .as_array()
                .map(|courses| {
                    courses
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.get("id"),
                                "name": c.get("fullname"),
                                "shortname": c.get("shortname"),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(json!({
                "user_id": user_id,
                "courses": listed,
                "success": true,
                "source": "moodle_api",
            })
            .to_string())
        }
        Err(e) => Ok(json!({
            "user_id": user_id,
            "courses": [],
            "error": e.to_string(),
            "success": false,
        })
        .to_string()),
    }
}

// ---------------------------------------------------------------------------
// get_moodle_assignments_status
// ---------------------------------------------------------------------------

/// One assignment within the inspection window.
#[derive(Debug, Clone)]
struct Assignment {
    id: i64,
    name: String,
    course_id: i64,
    due_ts: Option<i64>,
}

/// Execute `get_moodle_assignments_status`.
///
/// Collects assignments across all enrolled courses, keeps those whose due
/// date falls in the `[now - days_past, now + days_future]` window, sorts by
/// due-date proximity, checks submission status for at most `limit` of them
/// (bounded fan-out), and buckets the results.
///
/// # Errors
///
/// Returns [`ToolError::InvalidInput`] when `user_id` is missing and
/// [`ToolError::NotConfigured`] when the Moodle knobs are unset.
pub async fn get_moodle_assignments_status(
    config: &MoodleConfig,
    input: Value,
) -> Result<String, ToolError> {
    let user_id = require_user_id(&input)?;
    let days_past = input
        .get("days_past")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_WINDOW_DAYS)
        .max(0);
    let days_future = input
        .get("days_future")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_WINDOW_DAYS)
        .max(0);
    let limit = input
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n.max(1) as usize)
        .unwrap_or(DEFAULT_ASSIGNMENT_LIMIT);

    let (ws_url, token) = config.ws_url()?;
    let client = http_client()?;

    let now_ts = chrono::Utc::now().timestamp();
    let window_start = now_ts - days_past * 86_400;
    let window_end = now_ts + days_future * 86_400;

    // Enrolled courses.
    let courses = ws_get(
        &client,
        &ws_url,
        &token,
        "core_enrol_get_users_courses",
        &[("userid".to_owned(), user_id.clone())],
    )
    .await?;

    let course_list = courses.as_array().cloned().unwrap_or_default();
    let course_ids: Vec<i64> = course_list
        .iter()
        .filter_map(|c| c.get("id").and_then(Value::as_i64))
        .collect();

    if course_ids.is_empty() {
        return Ok(json!({
            "user_id": user_id,
            "success": true,
            "source": "moodle_api",
            "counts": {"completed": 0, "due": 0, "missed": 0},
            "completed": [], "due": [], "missed": [],
            "note": "No enrolled courses found for user",
        })
        .to_string());
    }

    let course_name = |id: i64| -> Option<Value> {
        course_list
            .iter()
            .find(|c| c.get("id").and_then(Value::as_i64) == Some(id))
            .map(|c| json!({"id": id, "name": c.get("fullname"), "shortname": c.get("shortname")}))
    };

    // Assignments across those courses, windowed by due date.
    let course_params: Vec<(String, String)> = course_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (format!("courseids[{i}]"), id.to_string()))
        .collect();
    let assignments_payload = ws_get(
        &client,
        &ws_url,
        &token,
        "mod_assign_get_assignments",
        &course_params,
    )
    .await?;

    let mut assignments: Vec<Assignment> = Vec::new();
    for course in assignments_payload
        .get("courses")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
    {
        let course_id = course.get("id").and_then(Value::as_i64).unwrap_or(0);
        for a in course
            .get("assignments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            let due_ts = a.get("duedate").and_then(Value::as_i64).filter(|d| *d != 0);
            if let Some(due) = due_ts {
                if due < window_start || due > window_end {
                    continue;
                }
            }
            assignments.push(Assignment {
                id: a.get("id").and_then(Value::as_i64).unwrap_or(0),
                name: a
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                course_id,
                due_ts,
            });
        }
    }

    // Prioritize by due-date proximity; undated assignments go last.
    assignments.sort_by_key(|a| match a.due_ts {
        Some(due) => (0, (due - now_ts).abs()),
        None => (1, 0),
    });
    assignments.truncate(limit);

    // Fan out submission-status checks under a bounded semaphore.
    let semaphore = Arc::new(Semaphore::new(SUBMISSION_CONCURRENCY));
    let mut handles = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let client = client.clone();
        let ws_url = ws_url.clone();
        let token = token.clone();
        let user_id = user_id.clone();
        let assign_id = assignment.id;
        let semaphore = Arc::clone(&semaphore);

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            ws_get(
                &client,
                &ws_url,
                &token,
                "mod_assign_get_submission_status",
                &[
                    ("assignid".to_owned(), assign_id.to_string()),
                    ("userid".to_owned(), user_id),
                ],
            )
            .await
        }));
    }

    let mut completed = Vec::new();
    let mut due = Vec::new();
    let mut missed = Vec::new();
    let mut errors = Vec::new();

    for (assignment, handle) in assignments.iter().zip(handles) {
        let item = json!({
            "assignment_id": assignment.id,
            "assignment_name": assignment.name,
            "course": course_name(assignment.course_id),
            "due_ts": assignment.due_ts,
        });

        let submission = match handle.await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                errors.push(format!("assignid={}: {e}", assignment.id));
                continue;
            }
            Err(e) => {
                errors.push(format!("assignid={}: join error: {e}", assignment.id));
                continue;
            }
        };

        let status = submission
            .pointer("/lastattempt/submission/status")
            .or_else(|| submission.get("submissionstatus"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let graded = submission
            .get("graded")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let is_completed = graded || matches!(status.to_lowercase().as_str(), "submitted" | "graded");

        debug!(assignment = assignment.id, status, "submission status");

        let mut entry = item;
        if let Some(map) = entry.as_object_mut() {
            map.insert("submissionstatus".to_owned(), json!(status));
        }

        if is_completed {
            completed.push(entry);
        } else {
            match assignment.due_ts {
                Some(due_ts) if due_ts < now_ts => missed.push(entry),
                _ => due.push(entry),
            }
        }
    }

    Ok(json!({
        "user_id": user_id,
        "success": true,
        "source": "moodle_api",
        "window": {"days_past": days_past, "days_future": days_future, "limit": limit},
        "counts": {
            "completed": completed.len(),
            "due": due.len(),
            "missed": missed.len(),
        },
        "completed": completed,
        "due": due,
        "missed": missed,
        "errors": errors,
    })
    .to_string())
}

fn require_user_id(input: &Value) -> Result<String, ToolError> {
    input
        .get("user_id")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidInput("missing required field: user_id".to_owned()))
}
