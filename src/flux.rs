//! Flux count-query construction.
//!
//! Rendering is deterministic: the same bucket, range and filters always
//! produce byte-identical text, so a query printed in diagnostics can be pasted
//! into the Influx UI and reproduces the count exactly.

use crate::window::TimeWindow;

/// `from |> range |> filter* |> count` pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxQuery {
    bucket: String,
    start: String,
    stop: String,
    filters: Vec<(String, String)>,
}

impl FluxQuery {
    pub fn count(bucket: impl Into<String>, window: &TimeWindow) -> Self {
        Self {
            bucket: bucket.into(),
            start: window.start_rfc3339(),
            stop: window.end_rfc3339(),
            filters: Vec::new(),
        }
    }

    /// Add an equality filter `r["column"] == "value"`. Filters render in the
    /// order they were added.
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn filters(&self) -> &[(String, String)] {
        &self.filters
    }

    /// Flux treats `range(stop:)` as exclusive, so a record stamped exactly on
    /// the window end is not counted.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(128 + self.filters.len() * 64);
        out.push_str(&format!("from(bucket: {})\n", string_literal(&self.bucket)));
        out.push_str(&format!(
            "  |> range(start: {}, stop: {})\n",
            self.start, self.stop
        ));
        for (column, value) in &self.filters {
            out.push_str(&format!(
                "  |> filter(fn: (r) => r[{}] == {})\n",
                string_literal(column),
                string_literal(value)
            ));
        }
        out.push_str("  |> count()\n");
        out
    }
}

impl std::fmt::Display for FluxQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote `value` as a Flux string literal. `${` is escaped too, since Flux
/// would otherwise treat it as interpolation.
pub fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window() -> TimeWindow {
        TimeWindow::normalize(
            &Utc.with_ymd_and_hms(2025, 5, 13, 9, 30, 59).unwrap(),
            &Utc.with_ymd_and_hms(2025, 5, 13, 9, 31, 59).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_layout() {
        let q = FluxQuery::count("cotons_vet", &window())
            .filter("_measurement", "vital")
            .filter("_field", "status");
        assert_eq!(
            q.render(),
            "from(bucket: \"cotons_vet\")\n\
             \x20 |> range(start: 2025-05-13T09:30:59Z, stop: 2025-05-13T09:31:59Z)\n\
             \x20 |> filter(fn: (r) => r[\"_measurement\"] == \"vital\")\n\
             \x20 |> filter(fn: (r) => r[\"_field\"] == \"status\")\n\
             \x20 |> count()\n"
        );
    }

    #[test]
    fn test_filter_order_preserved() {
        let q = FluxQuery::count("b", &window())
            .filter("device_type", "2")
            .filter("device_id", "1000200");
        let text = q.render();
        let t = text.find("device_type").unwrap();
        let i = text.find("device_id").unwrap();
        assert!(t < i);
    }

    #[test]
    fn test_values_cannot_escape_literal() {
        assert_eq!(string_literal(r#"a"b"#), r#""a\"b""#);
        assert_eq!(string_literal(r"a\b"), r#""a\\b""#);
        assert_eq!(string_literal("x${y}"), r#""x\${y}""#);
        assert_eq!(string_literal("cost $5"), r#""cost $5""#);
    }
}
