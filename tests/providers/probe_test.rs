//! Status-probe classification tests.

use lectern::providers::probe::{classify_status, ProbeErrorCode};

#[test]
fn success_statuses_have_no_error_code() {
    assert_eq!(classify_status(200), None);
    assert_eq!(classify_status(204), None);
}

#[test]
fn auth_statuses_classified() {
    assert_eq!(classify_status(401), Some(ProbeErrorCode::InvalidKey));
    assert_eq!(classify_status(403), Some(ProbeErrorCode::Forbidden));
}

#[test]
fn quota_and_rate_limit_classified() {
    assert_eq!(classify_status(402), Some(ProbeErrorCode::QuotaExceeded));
    assert_eq!(classify_status(429), Some(ProbeErrorCode::RateLimited));
}

#[test]
fn other_failures_are_upstream() {
    assert_eq!(classify_status(500), Some(ProbeErrorCode::Upstream));
    assert_eq!(classify_status(404), Some(ProbeErrorCode::Upstream));
}
