//! Endpoint URL construction for the generation service.

/// Remove trailing slashes so joined paths never contain `//`.
///
/// ```
/// use causerie::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://example.com/v1beta///"), "https://example.com/v1beta");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// URL of the streaming endpoint for `model`, asking for SSE framing.
///
/// Accepts both bare model ids and the `models/<id>` resource form.
///
/// ```
/// use causerie::utils::url::stream_generate_url;
///
/// assert_eq!(
///     stream_generate_url("https://example.com/v1beta/", "models/gemini-pro"),
///     "https://example.com/v1beta/models/gemini-pro:streamGenerateContent?alt=sse"
/// );
/// ```
pub fn stream_generate_url(base_url: &str, model: &str) -> String {
    let model = model.trim().trim_start_matches('/');
    let model = model.strip_prefix("models/").unwrap_or(model);
    format!(
        "{}/models/{}:streamGenerateContent?alt=sse",
        normalize_base_url(base_url),
        model
    )
}
