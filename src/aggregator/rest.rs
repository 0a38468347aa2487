//! Shared helpers for decoding exchange REST responses.

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::AggregatorError;

const BODY_SNIPPET_LEN: usize = 256;

/// Decode a JSON body, mapping HTTP auth rejections to [`AggregatorError::Auth`]
/// and malformed bodies to [`AggregatorError::Parse`] carrying a snippet of
/// the offending payload for diagnosis.
pub async fn decode_json<T: DeserializeOwned>(
    path: &str,
    response: Response,
) -> Result<T, AggregatorError> {
    let status = response.status();
    let body = response.text().await?;
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AggregatorError::Auth(format!("{path}: {}", snippet(&body))));
    }
    if !status.is_success() {
        return Err(AggregatorError::Network(format!(
            "{path}: HTTP {status}: {}",
            snippet(&body)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|err| AggregatorError::Parse(format!("{path}: {err}; body: {}", snippet(&body))))
}

/// Parse an exchange-reported decimal string.
pub fn parse_f64(context: &str, value: &str) -> Result<f64, AggregatorError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| AggregatorError::Parse(format!("{context}: non-numeric value '{value}'")))
}

/// Like [`parse_f64`] but treats an empty string as 0 (Bybit reports absent
/// prices as `""`).
pub fn parse_f64_or_zero(context: &str, value: &str) -> Result<f64, AggregatorError> {
    if value.trim().is_empty() {
        Ok(0.0)
    } else {
        parse_f64(context, value)
    }
}

fn snippet(body: &str) -> &str {
    if body.len() <= BODY_SNIPPET_LEN {
        return body;
    }
    let mut end = BODY_SNIPPET_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exchange_decimal_strings() {
        assert_eq!(parse_f64("test", "-0.5").unwrap(), -0.5);
        assert_eq!(parse_f64("test", " 60000 ").unwrap(), 60_000.0);
        assert!(parse_f64("test", "n/a").is_err());
    }

    #[test]
    fn empty_string_means_zero() {
        assert_eq!(parse_f64_or_zero("test", "").unwrap(), 0.0);
        assert_eq!(parse_f64_or_zero("test", "42.5").unwrap(), 42.5);
    }
}
