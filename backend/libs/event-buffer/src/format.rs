//! Wire encoding for analytical store inserts.

use crate::config::WireFormat;
use crate::error::BufferResult;
use crate::event::Event;

/// Column order of the `events` table. Rows must be emitted in exactly this order.
pub const EVENT_COLUMNS: [&str; 29] = [
    "id",
    "name",
    "sdk_name",
    "sdk_version",
    "device_id",
    "profile_id",
    "project_id",
    "session_id",
    "path",
    "origin",
    "referrer",
    "referrer_name",
    "referrer_type",
    "duration",
    "properties",
    "created_at",
    "country",
    "city",
    "region",
    "longitude",
    "latitude",
    "os",
    "os_version",
    "browser",
    "browser_version",
    "device",
    "brand",
    "model",
    "imported_at",
];

/// Encoded body for a single insert call.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertPayload {
    pub format: WireFormat,
    pub body: String,
    pub rows: usize,
}

pub fn csv_header() -> String {
    EVENT_COLUMNS.join(",")
}

/// Quote a value for the single-quote CSV dialect.
///
/// Double quotes become single quotes first, then every single quote is doubled.
pub fn escape_csv_value(value: &str) -> String {
    let with_single_quotes = value.replace('"', "'");
    format!("'{}'", with_single_quotes.replace('\'', "''"))
}

fn text(value: &str) -> String {
    escape_csv_value(value)
}

fn optional_text(value: Option<&str>) -> String {
    value.map(escape_csv_value).unwrap_or_default()
}

fn optional_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn event_to_csv_row(event: &Event) -> BufferResult<String> {
    let properties = serde_json::to_string(&event.properties)?;

    let columns = [
        text(&event.id),
        text(&event.name),
        optional_text(event.sdk_name.as_deref()),
        optional_text(event.sdk_version.as_deref()),
        text(&event.device_id),
        optional_text(event.profile_id.as_deref()),
        text(&event.project_id),
        optional_text(event.session_id.as_deref()),
        text(&event.path),
        text(&event.origin),
        optional_text(event.referrer.as_deref()),
        optional_text(event.referrer_name.as_deref()),
        optional_text(event.referrer_type.as_deref()),
        event.duration.to_string(),
        text(&properties),
        text(&event.created_at),
        optional_text(event.country.as_deref()),
        optional_text(event.city.as_deref()),
        optional_text(event.region.as_deref()),
        optional_number(event.longitude),
        optional_number(event.latitude),
        optional_text(event.os.as_deref()),
        optional_text(event.os_version.as_deref()),
        optional_text(event.browser.as_deref()),
        optional_text(event.browser_version.as_deref()),
        optional_text(event.device.as_deref()),
        optional_text(event.brand.as_deref()),
        optional_text(event.model.as_deref()),
        optional_text(event.imported_at.as_deref()),
    ];

    Ok(columns.join(","))
}

pub fn encode_chunk(format: WireFormat, events: &[Event]) -> BufferResult<InsertPayload> {
    let mut lines = Vec::with_capacity(events.len() + 1);

    match format {
        WireFormat::Csv => {
            lines.push(csv_header());
            for event in events {
                lines.push(event_to_csv_row(event)?);
            }
        }
        WireFormat::JsonEachRow => {
            for event in events {
                lines.push(serde_json::to_string(event)?);
            }
        }
    }

    Ok(InsertPayload {
        format,
        body: lines.join("\n"),
        rows: events.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;
    use serde_json::json;

    #[test]
    fn test_escape_converts_and_doubles_quotes() {
        assert_eq!(
            escape_csv_value(r#"it's a "test""#),
            "'it''s a ''test'''"
        );
        assert_eq!(escape_csv_value("plain"), "'plain'");
        assert_eq!(escape_csv_value(""), "''");
    }

    #[test]
    fn test_header_matches_table_order() {
        let header = csv_header();
        assert!(header.starts_with("id,name,sdk_name,sdk_version,device_id,profile_id"));
        assert!(header.ends_with("brand,model,imported_at"));
        assert_eq!(header.split(',').count(), 29);
    }

    #[test]
    fn test_row_has_one_field_per_column() {
        let mut e = event("e1", "screen_view", "2024-05-01 10:00:00.000");
        e.duration = 1500;
        e.latitude = Some(59.5);
        let row = event_to_csv_row(&e).unwrap();
        let fields: Vec<&str> = row.split(',').collect();

        assert_eq!(fields.len(), EVENT_COLUMNS.len());
        assert_eq!(fields[0], "'e1'");
        assert_eq!(fields[5], ""); // profile_id absent
        assert_eq!(fields[13], "1500");
        assert_eq!(fields[14], "'{}'");
        assert_eq!(fields[15], "'2024-05-01 10:00:00.000'");
        assert_eq!(fields[19], ""); // longitude absent
        assert_eq!(fields[20], "59.5");
        assert_eq!(fields[28], "");
    }

    #[test]
    fn test_properties_json_is_escaped() {
        let mut e = event("e1", "click", "2024-05-01 10:00:00.000");
        e.properties.insert("title".to_string(), json!(r#"it's a "test""#));
        let row = event_to_csv_row(&e).unwrap();

        // JSON text {"title":"it's a \"test\""} after quote conversion and doubling
        assert!(row.contains(r#"'{''title'':''it''s a \''test\''''}'"#));
    }

    #[test]
    fn test_csv_payload_has_header_then_rows() {
        let events = vec![
            event("e1", "a", "2024-05-01 10:00:00.000"),
            event("e2", "b", "2024-05-01 10:00:01.000"),
        ];
        let payload = encode_chunk(WireFormat::Csv, &events).unwrap();
        let lines: Vec<&str> = payload.body.lines().collect();

        assert_eq!(payload.rows, 2);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], csv_header());
        assert!(lines[1].starts_with("'e1','a'"));
        assert!(lines[2].starts_with("'e2','b'"));
    }

    #[test]
    fn test_json_payload_is_one_object_per_line() {
        let events = vec![
            event("e1", "a", "2024-05-01 10:00:00.000"),
            event("e2", "b", "2024-05-01 10:00:01.000"),
        ];
        let payload = encode_chunk(WireFormat::JsonEachRow, &events).unwrap();

        let decoded: Vec<Event> = payload
            .body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(decoded, events);
    }
}
