/// Host-file line parsing
///
/// Community blocklists ship in the classic hosts format (`IP hostname
/// [aliases...]`) but in practice also contain bare domain lines and
/// trailing comments. The canonical form of a line is its last
/// whitespace-separated token interpreted as a hostname.

/// Tokens that mark a line as self-referential boilerplate rather than
/// a rule, e.g. `127.0.0.1 localhost`.
const SELF_REFERENCES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "0.0.0.0",
    "127.0.0.1",
    "::1",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
];

/// Extract the hostname from a single host-file line.
///
/// Returns `None` for empty lines, comments, self-referential entries
/// and anything that does not form a valid hostname.
pub fn parse_line(line: &str) -> Option<&str> {
    // Strip whole-line and trailing comments
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return None;
    }

    let candidate = line.split_whitespace().last()?;

    if SELF_REFERENCES
        .iter()
        .any(|s| candidate.eq_ignore_ascii_case(s))
    {
        return None;
    }

    if is_valid_hostname(candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Check if a token is a plausible DNS hostname.
pub fn is_valid_hostname(name: &str) -> bool {
    // Allow one trailing dot (fully-qualified form)
    let name = name.strip_suffix('.').unwrap_or(name);

    if name.is_empty() || name.len() > 253 {
        return false;
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return false;
        }

        let bytes = label.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            let edge = i == 0 || i == bytes.len() - 1;
            let ok = b.is_ascii_alphanumeric() || b == b'_' || (!edge && b == b'-');
            if !ok {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosts_format_lines() {
        assert_eq!(
            parse_line("0.0.0.0 ads.example.com"),
            Some("ads.example.com")
        );
        assert_eq!(
            parse_line("127.0.0.1 tracker.example.net"),
            Some("tracker.example.net")
        );
        // Last token wins when aliases are present
        assert_eq!(
            parse_line("0.0.0.0 ads.example.com alias.example.com"),
            Some("alias.example.com")
        );
    }

    #[test]
    fn test_bare_domain_lines() {
        assert_eq!(parse_line("doubleclick.net"), Some("doubleclick.net"));
        assert_eq!(parse_line("  spaced.example.org  "), Some("spaced.example.org"));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("# StevenBlack hosts"), None);
        assert_eq!(
            parse_line("0.0.0.0 ads.example.com # served from EU"),
            Some("ads.example.com")
        );
    }

    #[test]
    fn test_self_references_skipped() {
        assert_eq!(parse_line("127.0.0.1 localhost"), None);
        assert_eq!(parse_line("0.0.0.0 0.0.0.0"), None);
        assert_eq!(parse_line("::1 ip6-localhost"), None);
        assert_eq!(parse_line("255.255.255.255 broadcasthost"), None);
    }

    #[test]
    fn test_hostname_validation() {
        assert!(is_valid_hostname("example.com"));
        assert!(is_valid_hostname("sub.domain.example.com"));
        assert!(is_valid_hostname("example.com."));
        assert!(is_valid_hostname("xn--nxasmq6b.example"));
        assert!(is_valid_hostname("_dmarc.example.com"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-leading.example.com"));
        assert!(!is_valid_hostname("trailing-.example.com"));
        assert!(!is_valid_hostname("double..dot.example"));
        assert!(!is_valid_hostname(&format!("{}.com", "a".repeat(300))));
        assert!(!is_valid_hostname(&format!("{}.com", "a".repeat(64))));
    }
}
