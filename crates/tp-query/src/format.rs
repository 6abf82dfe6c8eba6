//! Output formatting for matched records.

use crate::plan::QueryPlan;
use crate::predicate::extract_field;
use serde::de::IgnoredAny;
use serde_json::Value;

/// Event type used for live matches.
pub const LIVE_EVENT_TYPE: &str = "log";

/// Renders a matched line for output.
///
/// Without projections the original line is returned as-is (minus its
/// terminator). With projections a compact object is built holding only the
/// projected fields under their aliases, in SELECT order.
pub fn format_record(plan: &QueryPlan, line: &[u8], record: &Value) -> String {
    if plan.projections.is_empty() {
        return strip_terminator(&String::from_utf8_lossy(line)).to_string();
    }

    let mut out = String::from("{");
    let mut first = true;
    for projection in &plan.projections {
        let Some(value) = extract_field(record, &projection.path) else {
            continue;
        };
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&Value::String(projection.alias.clone()).to_string());
        out.push(':');
        out.push_str(&value.to_string());
    }
    out.push('}');
    out
}

/// `{"type":"log","data":<record>}`. Valid JSON is embedded verbatim,
/// anything else as a JSON string.
pub fn format_live_event(record: &str) -> String {
    let record = strip_terminator(record);
    let data = if serde_json::from_str::<IgnoredAny>(record).is_ok() {
        record.to_string()
    } else {
        Value::String(record.to_string()).to_string()
    };
    format!(r#"{{"type":"{}","data":{}}}"#, LIVE_EVENT_TYPE, data)
}

fn strip_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::predicate::parse_record;

    fn format(sql: &str, line: &str) -> String {
        let plan = compile(sql).unwrap();
        let record = parse_record(line.as_bytes()).unwrap();
        format_record(&plan, line.as_bytes(), &record)
    }

    #[test]
    fn test_full_record_is_verbatim() {
        let line = "{\"b\": 1,  \"a\": \"x\"}\r\n";
        assert_eq!(format("SELECT * FROM app", line), "{\"b\": 1,  \"a\": \"x\"}");
    }

    #[test]
    fn test_projection_keeps_types_and_order() {
        let line = r#"{"line":{"cmd":"ls \"-la\"","n":3,"ok":false,"args":{"x":[1,2]}}}"#;
        assert_eq!(
            format("SELECT line.n, line.cmd AS command, line.ok, line.args FROM app", line),
            r#"{"n":3,"command":"ls \"-la\"","ok":false,"args":{"x":[1,2]}}"#
        );
    }

    #[test]
    fn test_live_event_envelope() {
        assert_eq!(
            format_live_event(r#"{"level":"error"}"#),
            r#"{"type":"log","data":{"level":"error"}}"#
        );
        assert_eq!(
            format_live_event("plain text"),
            r#"{"type":"log","data":"plain text"}"#
        );
    }
}
