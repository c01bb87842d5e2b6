use crate::error::AppError;
use tracing::debug;

/// Split `key=value` strings at the first `=`.
///
/// ```text
/// Referer=https://example.com  ->  ("Referer", "https://example.com")
/// ```
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>, AppError> {
    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .map(|(key, value)| {
                    debug!(key = %key.trim(), "Parsed parameter");
                    (key.trim().to_string(), value.trim().to_string())
                })
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid param format: {param}")))
        })
        .collect()
}
