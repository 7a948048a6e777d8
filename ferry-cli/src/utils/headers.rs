use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::AppError;

/// Parse "Name: Value" strings into a HeaderMap. Repeated names keep every value.
pub fn parse_headers(header_strings: &[String]) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();

    for header_str in header_strings {
        let Some((name, value)) = header_str.split_once(':') else {
            return Err(AppError::InvalidInput(format!(
                "invalid header '{header_str}', expected 'Name: Value'"
            )));
        };
        let (name, value) = (name.trim(), value.trim());

        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| AppError::InvalidInput(format!("invalid header name '{name}'")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| AppError::InvalidInput(format!("invalid value for header '{name}'")))?;

        debug!(name, "Adding request header");
        headers.append(header_name, header_value);
    }

    Ok(headers)
}
