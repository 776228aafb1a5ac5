//! Shared naming helpers: namespace ids and deploy URLs derive from project ids.

/// Longest DNS label allowed by RFC 1035.
pub const MAX_DNS_LABEL: usize = 63;

/// Prefix shared by namespace ids and deployment hostnames.
pub const NAMESPACE_PREFIX: &str = "im-";

/// Convert text to a DNS-safe slug, limited to `max_len` characters.
///
/// Lowercases, maps anything outside `[a-z0-9]` to `-`, collapses runs of
/// dashes and trims them from both ends.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Namespace id for a project: `im-<slug>`, a valid DNS label.
pub fn namespace_id(project_id: &str) -> String {
    let slug = slugify(project_id, MAX_DNS_LABEL - NAMESPACE_PREFIX.len());
    if slug.is_empty() {
        // Project ids made only of punctuation still need a stable label.
        format!("{}project", NAMESPACE_PREFIX)
    } else {
        format!("{}{}", NAMESPACE_PREFIX, slug)
    }
}

/// Public URL of a project's deployment. Same project id, same URL.
pub fn deploy_url(project_id: &str, domain_suffix: &str) -> String {
    format!(
        "http://{}.{}",
        namespace_id(project_id),
        domain_suffix.trim_matches('.')
    )
}

/// First 12 characters of a commit hash, for directory names and logs.
pub fn short_commit(commit: &str) -> &str {
    match commit.char_indices().nth(12) {
        Some((idx, _)) => &commit[..idx],
        None => commit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("My Project", 40), "my-project");
        assert_eq!(slugify("p1", 40), "p1");
        assert_eq!(slugify("--a__b--", 40), "a-b");
    }

    #[test]
    fn test_slugify_non_ascii_becomes_dash() {
        assert_eq!(slugify("café/api", 40), "caf-api");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_dash() {
        assert_eq!(slugify("abcd-efgh", 5), "abcd");
    }

    #[test]
    fn test_namespace_id_is_dns_label() {
        assert_eq!(namespace_id("p1"), "im-p1");
        let long = "x".repeat(200);
        let id = namespace_id(&long);
        assert_eq!(id.len(), MAX_DNS_LABEL);
        assert!(id.starts_with("im-"));
        assert_eq!(namespace_id("!!!"), "im-project");
    }

    #[test]
    fn test_deploy_url_is_deterministic() {
        let first = deploy_url("p1", "shipyard.localhost");
        let second = deploy_url("p1", "shipyard.localhost");
        assert_eq!(first, "http://im-p1.shipyard.localhost");
        assert_eq!(first, second);
        assert_eq!(deploy_url("My_App", ".example.com."), "http://im-my-app.example.com");
    }

    #[test]
    fn test_short_commit() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_commit("abc"), "abc");
    }
}
