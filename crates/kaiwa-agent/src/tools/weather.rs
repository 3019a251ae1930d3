//! `weather` tool: canned conditions for a handful of cities.

use async_trait::async_trait;
use serde_json::json;

use super::{Tool, ToolResult};

/// (city, temperature °C, condition, humidity %)
const WEATHER_DATA: &[(&str, i64, &str, i64)] = &[
    ("Tokyo", 25, "Sunny", 60),
    ("New York", 18, "Cloudy", 70),
    ("London", 15, "Rainy", 80),
    ("Sydney", 28, "Sunny", 50),
    ("Paris", 20, "Partly Cloudy", 65),
];

pub struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Get weather information for a location"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The location to get weather for (city name)"
                }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(location) = input.get("location").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: location");
        };

        let Some(&(city, temperature, condition, humidity)) =
            WEATHER_DATA.iter().find(|(city, ..)| *city == location)
        else {
            // a lookup miss is an answer the model can act on, not a failure
            let available: Vec<&str> = WEATHER_DATA.iter().map(|(c, ..)| *c).collect();
            return ToolResult::json(json!({
                "error": "Location not found",
                "available_locations": available,
            }));
        };

        ToolResult::json(json!({
            "location": city,
            "temperature": temperature,
            "condition": condition,
            "humidity": humidity,
            "unit": "celsius",
            "time": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_city() {
        let r = WeatherTool.execute(json!({"location": "Tokyo"})).await;
        assert!(!r.is_error);
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["temperature"], 25);
        assert_eq!(v["condition"], "Sunny");
        assert_eq!(v["unit"], "celsius");
    }

    #[tokio::test]
    async fn unknown_city_lists_alternatives() {
        let r = WeatherTool.execute(json!({"location": "Atlantis"})).await;
        assert!(!r.is_error);
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["error"], "Location not found");
        assert_eq!(v["available_locations"].as_array().unwrap().len(), 5);
    }
}
