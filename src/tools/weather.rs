//! Weather reference tool.
//!
//! Calls the free Open-Meteo forecast API (no key required) with a static
//! city → coordinates table. Unknown cities fall back to Paris.

use serde_json::{json, Value};
use tracing::warn;

use crate::providers::ToolDefinition;

use super::ToolError;

/// Known cities with their coordinates.
const CITY_COORDINATES: [(&str, f64, f64, &str); 10] = [
    ("paris", 48.8566, 2.3522, "Paris, France"),
    ("london", 51.5074, -0.1278, "London, UK"),
    ("new york", 40.7128, -74.0060, "New York, USA"),
    ("tokyo", 35.6762, 139.6503, "Tokyo, Japan"),
    ("sydney", -33.8688, 151.2093, "Sydney, Australia"),
    ("berlin", 52.5200, 13.4050, "Berlin, Germany"),
    ("madrid", 40.4168, -3.7038, "Madrid, Spain"),
    ("rome", 41.9028, 12.4964, "Rome, Italy"),
    ("amsterdam", 52.3676, 4.9041, "Amsterdam, Netherlands"),
    ("singapore", 1.3521, 103.8198, "Singapore"),
];

/// Function-calling spec for `get_weather`.
pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_weather".to_owned(),
        description:
            "Get the current temperature for a specified city. Returns temperature in Celsius."
                .to_owned(),
        parameters: json!({
            "type": "object",
            "properties": {
                "city": {
                    "type": "string",
                    "description": "The name of the city to get weather for (e.g., 'Paris', 'London', 'New York')"
                }
            },
            "required": ["city"]
        }),
    }
}

/// Resolve a city name to coordinates, defaulting to Paris.
#[doc(hidden)]
pub fn lookup_city(city: &str) -> (f64, f64, &'static str) {
    let needle = city.trim().to_lowercase();
    CITY_COORDINATES
        .iter()
        .find(|(name, ..)| *name == needle)
        .map(|(_, lat, lon, label)| (*lat, *lon, *label))
        .unwrap_or_else(|| {
            warn!(city, "city not in table, defaulting to Paris");
            let (_, lat, lon, label) = CITY_COORDINATES[0];
            (lat, lon, label)
        })
}

/// Map a WMO weather code to a human phrase.
#[doc(hidden)]
pub fn describe_weather_code(code: u64) -> &'static str {
    match code {
        0 => "clear sky",
        1 => "mainly clear",
        2 => "partly cloudy",
        3 => "overcast",
        45 => "foggy",
        48 => "depositing rime fog",
        51 => "light drizzle",
        53 => "moderate drizzle",
        55 => "dense drizzle",
        61 => "slight rain",
        63 => "moderate rain",
        65 => "heavy rain",
        71 => "slight snow",
        73 => "moderate snow",
        75 => "heavy snow",
        80 => "slight rain showers",
        81 => "moderate rain showers",
        82 => "violent rain showers",
        95 => "thunderstorm",
        _ => "unknown conditions",
    }
}

/// Execute the tool: fetch the current temperature for a city.
///
/// # Errors
///
/// Returns [`ToolError::InvalidInput`] when `city` is missing. Upstream
/// failures are reported inside the JSON payload, not as errors, so the
/// model can relay them.
pub async fn get_weather(input: Value) -> Result<String, ToolError> {
    let city = input
        .get("city")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput("missing required field: city".to_owned()))?;

    let (lat, lon, label) = lookup_city(city);
    let url = format!(
        "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}\
         &current=temperature_2m,weather_code&timezone=auto"
    );

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

    let result = async {
        let response = client.get(&url).send().await?;
        response.error_for_status()?.json::<Value>().await
    }
    .await;

    let payload = match result {
        Ok(payload) => payload,
        Err(e) => {
            let error = if e.is_timeout() {
                "weather service timeout".to_owned()
            } else {
                e.to_string()
            };
            return Ok(json!({"city": label, "error": error, "success": false}).to_string());
        }
    };

    let temperature = payload.pointer("/current/temperature_2m").cloned();
    let code = payload
        .pointer("/current/weather_code")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(json!({
        "city": label,
        "temperature_celsius": temperature,
        "conditions": describe_weather_code(code),
        "success": true,
    })
    .to_string())
}
