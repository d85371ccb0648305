pub mod failed_commits;
pub mod health;
pub mod jobs;
pub mod projects;
pub mod stats;

use axum::body::Bytes;
use serde::de::{DeserializeOwned, IntoDeserializer, value};

use crate::errors::{AppError, AppResult};

/// Parse a query value into one of the snake_case sort enums.
pub(crate) fn parse_choice<T: DeserializeOwned>(
    name: &str,
    raw: &str,
) -> AppResult<T> {
    T::deserialize(raw.trim().into_deserializer()).map_err(
        |_: value::Error| {
            AppError::bad_request(format!("unsupported {name} '{raw}'"))
        },
    )
}

/// Bodies that may be omitted entirely.
pub(crate) fn optional_json<T: DeserializeOwned + Default>(
    body: &Bytes,
) -> AppResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| AppError::bad_request(format!("invalid body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use commitscan_core::job::{JobSortField, RetryRequest, SortDirection};

    #[test]
    fn parses_sort_choices() {
        let field: JobSortField = parse_choice("sort_by", "retry_count").unwrap();
        assert_eq!(field, JobSortField::RetryCount);
        let dir: SortDirection = parse_choice("sort_dir", "asc").unwrap();
        assert_eq!(dir, SortDirection::Asc);
        assert!(parse_choice::<JobSortField>("sort_by", "colour").is_err());
    }

    #[test]
    fn empty_body_means_defaults() {
        let request: RetryRequest = optional_json(&Bytes::new()).unwrap();
        assert!(!request.reset_retries);
        let request: RetryRequest =
            optional_json(&Bytes::from_static(br#"{"reset_retries":true}"#))
                .unwrap();
        assert!(request.reset_retries);
    }
}
