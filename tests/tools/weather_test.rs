//! Weather tool tests (table lookups only; no network).

use lectern::tools::weather::{definition, describe_weather_code, lookup_city};

#[test]
fn known_cities_resolve() {
    let (lat, lon, label) = lookup_city("Tokyo");
    assert!((lat - 35.6762).abs() < 1e-6);
    assert!((lon - 139.6503).abs() < 1e-6);
    assert_eq!(label, "Tokyo, Japan");
}

#[test]
fn lookup_is_case_and_whitespace_insensitive() {
    let (_, _, label) = lookup_city("  NEW YORK ");
    assert_eq!(label, "New York, USA");
}

#[test]
fn unknown_city_defaults_to_paris() {
    let (_, _, label) = lookup_city("Atlantis");
    assert_eq!(label, "Paris, France");
}

#[test]
fn weather_codes_have_phrases() {
    assert_eq!(describe_weather_code(0), "clear sky");
    assert_eq!(describe_weather_code(63), "moderate rain");
    assert_eq!(describe_weather_code(95), "thunderstorm");
    assert_eq!(describe_weather_code(1234), "unknown conditions");
}

#[test]
fn spec_requires_city() {
    let spec = definition();
    assert_eq!(spec.name, "get_weather");
    assert_eq!(spec.parameters["required"][0], "city");
}
