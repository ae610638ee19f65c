/// Case-insensitive substring check. An empty needle matches everything.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Truncate a string to a maximum number of characters, adding ellipsis if needed
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Extract the bare host from a website value.
///
/// Websites are stored the way users typed them, so this accepts full URLs
/// (`https://www.example.com:8443/login`), bare hosts (`example.com`) and
/// anything in between. Scheme, credentials, port, path and a leading `www.`
/// are dropped and the result is lowercased.
pub fn host_of(website: &str) -> String {
    let trimmed = website.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let authority = without_scheme
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    let host = host_port.split(':').next().unwrap_or_default();
    let host = host.trim_end_matches('.').to_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// True when the credential's website belongs to the requested domain.
/// Subdomains of the requested domain match (`login.example.com` for
/// `example.com`); unrelated hosts sharing a suffix do not (`badexample.com`).
pub fn host_matches(website: &str, domain: &str) -> bool {
    let site = host_of(website);
    let wanted = host_of(domain);
    if site.is_empty() || wanted.is_empty() {
        return false;
    }
    site == wanted || site.ends_with(&format!(".{}", wanted))
}
