//! String plumbing for reference URLs, tree paths and query-parameter values.

/// Normalize a database URL: default to `https://` when no scheme is given
/// and strip a trailing slash so that path segments can be appended blindly.
pub(crate) fn sanitize_url(url: &str) -> String {
    let mut url = if url.starts_with("https://") || url.starts_with("http://") {
        url.to_owned()
    } else {
        format!("https://{}", url)
    };
    if url.ends_with('/') {
        url.pop();
    }
    url
}

/// Trim leading and trailing slashes from a tree path. The empty string is
/// the root.
pub(crate) fn sanitize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Split a tree path into its non-empty segments.
pub(crate) fn split_path(path: &str) -> Vec<&str> {
    sanitize_path(path).split('/').filter(|s| !s.is_empty()).collect()
}

/// The direct child under the watched root that a (sanitized) event path
/// refers to. Empty for events rooted at the watched node itself.
pub(crate) fn first_segment(path: &str) -> &str {
    path.split('/').next().unwrap_or("")
}

/// Escape a filtering parameter value the way the REST endpoint expects:
/// integers and boolean literals go over the wire unquoted, everything else
/// is stripped of surrounding quotes and re-quoted as a JSON string.
pub(crate) fn escape_param(value: &str) -> String {
    if value.parse::<i64>().is_ok() || value.parse::<bool>().is_ok() {
        return value.to_owned();
    }
    serde_json::Value::String(value.trim_matches('"').to_owned()).to_string()
}
