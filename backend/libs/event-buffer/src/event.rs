//! Tracked event records.
//!
//! [`Event`] is the storage shape: snake_case fields in exactly the column order of the
//! `events` table. It is what gets serialized into the queue and written to ClickHouse.
//! [`PublicEvent`] is the camelCase shape handed to live subscribers and enrichment
//! lookups.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const SCREEN_VIEW: &str = "screen_view";
pub const SESSION_START: &str = "session_start";
pub const SESSION_END: &str = "session_end";

/// Timestamp layout used by the analytical store (`DateTime64(3)`).
const STORE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Event in storage shape. Field order matches the destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sdk_name: Option<String>,
    #[serde(default)]
    pub sdk_version: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    pub project_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub referrer_name: Option<String>,
    #[serde(default)]
    pub referrer_type: Option<String>,
    /// Milliseconds
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Missing or null timestamps decode as empty and sort as epoch zero.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub created_at: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub browser_version: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub imported_at: Option<String>,
}

impl Event {
    /// Profile identifier, treating an empty string as absent.
    pub fn profile(&self) -> Option<&str> {
        self.profile_id.as_deref().filter(|p| !p.is_empty())
    }

    pub fn is_screen_view(&self) -> bool {
        self.name == SCREEN_VIEW
    }

    pub fn is_session_end(&self) -> bool {
        self.name == SESSION_END
    }

    /// Session lifecycle events are excluded from the tracked-event counter.
    pub fn is_session_lifecycle(&self) -> bool {
        self.name == SESSION_START || self.name == SESSION_END
    }

    /// `created_at` in epoch milliseconds; unparseable timestamps map to 0.
    pub fn created_at_ms(&self) -> i64 {
        parse_timestamp(&self.created_at)
            .map(|ts| ts.timestamp_millis())
            .unwrap_or(0)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse either the store layout (`2024-01-31 12:00:00.123`) or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, STORE_TIMESTAMP_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }

    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn normalize_timestamp(raw: &str) -> String {
    parse_timestamp(raw)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| raw.to_string())
}

/// Event in public (subscriber-facing) shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicEvent {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub profile_id: Option<String>,
    pub project_id: String,
    pub session_id: Option<String>,
    pub properties: Map<String, Value>,
    pub created_at: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub device: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub duration: i64,
    pub path: String,
    pub origin: String,
    pub referrer: Option<String>,
    pub referrer_name: Option<String>,
    pub referrer_type: Option<String>,
    pub imported_at: Option<String>,
    pub sdk_name: Option<String>,
    pub sdk_version: Option<String>,
}

impl From<&Event> for PublicEvent {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            name: event.name.clone(),
            device_id: event.device_id.clone(),
            profile_id: event.profile().map(str::to_string),
            project_id: event.project_id.clone(),
            session_id: event.session_id.clone(),
            properties: event.properties.clone(),
            created_at: normalize_timestamp(&event.created_at),
            country: event.country.clone(),
            city: event.city.clone(),
            region: event.region.clone(),
            longitude: event.longitude,
            latitude: event.latitude,
            os: event.os.clone(),
            os_version: event.os_version.clone(),
            browser: event.browser.clone(),
            browser_version: event.browser_version.clone(),
            device: event.device.clone(),
            brand: event.brand.clone(),
            model: event.model.clone(),
            duration: event.duration,
            path: event.path.clone(),
            origin: event.origin.clone(),
            referrer: event.referrer.clone(),
            referrer_name: event.referrer_name.clone(),
            referrer_type: event.referrer_type.clone(),
            imported_at: event.imported_at.as_deref().map(normalize_timestamp),
            sdk_name: event.sdk_name.clone(),
            sdk_version: event.sdk_version.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Minimal valid event used across module tests.
    pub fn event(id: &str, name: &str, created_at: &str) -> Event {
        Event {
            id: id.to_string(),
            name: name.to_string(),
            sdk_name: Some("web".to_string()),
            sdk_version: Some("1.0.0".to_string()),
            device_id: format!("device-{}", id),
            profile_id: None,
            project_id: "project-1".to_string(),
            session_id: Some("session-1".to_string()),
            path: "/".to_string(),
            origin: "https://example.com".to_string(),
            referrer: None,
            referrer_name: None,
            referrer_type: None,
            duration: 0,
            properties: Map::new(),
            created_at: created_at.to_string(),
            country: None,
            city: None,
            region: None,
            longitude: None,
            latitude: None,
            os: None,
            os_version: None,
            browser: None,
            browser_version: None,
            device: None,
            brand: None,
            model: None,
            imported_at: None,
        }
    }

    pub fn profile_event(id: &str, name: &str, profile_id: &str) -> Event {
        Event {
            profile_id: Some(profile_id.to_string()),
            ..event(id, name, "2024-05-01 10:00:00.000")
        }
    }
}
