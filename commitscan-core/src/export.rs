//! CSV rendering of scan results.

use std::borrow::Cow;

use crate::ledger::ScanResult;

const FIXED_COLUMNS: [&str; 5] =
    ["job_id", "commit_sha", "component_key", "instance", "created_at"];

/// Quote a field when it contains a delimiter, quote or line break.
pub fn escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

pub fn header(measure_keys: &[String]) -> String {
    let mut line = FIXED_COLUMNS
        .iter()
        .map(|c| Cow::Borrowed(*c))
        .chain(measure_keys.iter().map(|k| escape(k)))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// One line per result; measures missing from the result are empty cells.
pub fn row(result: &ScanResult, measure_keys: &[String]) -> String {
    let job_id = result.job_id.to_string();
    let created_at = result.created_at.to_rfc3339();
    let mut fields: Vec<Cow<'_, str>> = vec![
        Cow::Owned(job_id),
        escape(&result.commit_sha),
        escape(&result.component_key),
        escape(result.instance.as_deref().unwrap_or_default()),
        Cow::Owned(created_at),
    ];
    fields.extend(measure_keys.iter().map(|key| {
        escape(result.measures.get(key).map(String::as_str).unwrap_or_default())
    }));
    let mut line = fields.join(",");
    line.push('\n');
    line
}
