//! Bearer authentication tests.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};

use lectern::gateway::{check_bearer, ApiError};

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(value).expect("header"));
    headers
}

#[test]
fn missing_header_is_unauthorized() {
    let result = check_bearer(&HeaderMap::new(), "secret");
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[test]
fn non_bearer_scheme_is_unauthorized() {
    let result = check_bearer(&headers_with("Basic abc"), "secret");
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[test]
fn wrong_key_is_unauthorized() {
    let result = check_bearer(&headers_with("Bearer nope"), "secret");
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[test]
fn correct_key_passes() {
    check_bearer(&headers_with("Bearer secret"), "secret").expect("authorized");
    // Surrounding whitespace is tolerated.
    check_bearer(&headers_with("Bearer  secret "), "secret").expect("authorized");
}
