use chrono::{DateTime, NaiveDateTime, Utc};

/// Wire format used for every stored timestamp. Second precision, UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Current UTC time truncated to second precision.
pub fn utc_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or_default()
}

/// Current UTC time rendered in the wire format.
pub fn timestamp() -> String {
    format_timestamp(utc_now())
}

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// RFC 7231 date used for Last-Modified and Expires headers.
pub fn format_http_date(t: DateTime<Utc>) -> String {
    t.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an If-Modified-Since style date. Returns None for ill-formed input.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Serde adapter keeping DateTime fields on the wire format.
pub mod timestamp_format {
    use super::*;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let value = String::deserialize(deserializer)?;
        parse_timestamp(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {}", value)))
    }
}
