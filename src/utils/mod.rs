//! Utility functions and helpers.

pub mod clock;
pub mod duration;
#[cfg(feature = "http")]
pub mod http;
pub mod log;

use url::Url;

/// Normalize a source identifier to a bare lowercase host.
///
/// Accepts either a domain (`"www.Amazon.com.br"`) or a full URL
/// (`"https://www.amazon.com.br/deals"`). A leading `www.` is dropped so both
/// spellings land on the same registry entry.
pub fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let host = if trimmed.contains("://") {
        Url::parse(trimmed)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))?
    } else {
        trimmed
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(trimmed)
            .to_string()
    };

    let host = host.trim_end_matches('.').to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() { None } else { Some(host) }
}

/// Collapse runs of whitespace into single spaces.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("https://www.amazon.com.br/deals?x=1"),
            Some("amazon.com.br".to_string())
        );
        assert_eq!(
            normalize_domain("  Promobit.com.br "),
            Some("promobit.com.br".to_string())
        );
        assert_eq!(
            normalize_domain("pelando.com.br/ofertas"),
            Some("pelando.com.br".to_string())
        );
        assert_eq!(normalize_domain("   "), None);
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  Kabum \t  Store \n"), "Kabum Store");
    }
}
