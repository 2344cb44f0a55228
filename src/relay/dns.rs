//! MX record resolution.

use crate::error::{MailError, Result};
use std::time::Duration;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Per-query resolution timeout.
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub priority: u16,
}

/// Resolves the MX hosts for a domain, ordered by ascending priority.
/// Ties keep the order the DNS reply listed them in.
pub async fn resolve_mx(domain: &str) -> Result<Vec<MxRecord>> {
    debug!("Looking up MX records for {}", domain);

    let mut opts = ResolverOpts::default();
    opts.timeout = DNS_TIMEOUT;
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);

    let lookup = resolver.mx_lookup(domain).await.map_err(|e| {
        warn!("MX lookup failed for {}: {}", domain, e);
        MailError::DnsLookup(format!("MX lookup failed for {}: {}", domain, e))
    })?;

    let mut records: Vec<MxRecord> = lookup
        .iter()
        .map(|mx| MxRecord {
            host: mx
                .exchange()
                .to_string()
                .trim_end_matches('.')
                .to_string(),
            priority: mx.preference(),
        })
        .collect();

    if records.is_empty() {
        return Err(MailError::DnsLookup(format!("No MX records for {}", domain)));
    }

    // Stable sort: equal priorities stay in DNS reply order
    records.sort_by_key(|record| record.priority);

    debug!("Found {} MX record(s) for {}", records.len(), domain);
    Ok(records)
}

/// The domain of an address, or None when there is no `@`.
pub fn extract_domain(email: &str) -> Option<&str> {
    email.find('@').map(|pos| &email[pos + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("bob@example.com"), Some("example.com"));
        assert_eq!(extract_domain("no-at-sign"), None);
        assert_eq!(extract_domain("trailing@"), Some(""));
    }

    #[test]
    fn test_mx_sort_is_stable_on_ties() {
        let mut records = vec![
            MxRecord {
                host: "mx-b.example.com".to_string(),
                priority: 10,
            },
            MxRecord {
                host: "mx-primary.example.com".to_string(),
                priority: 5,
            },
            MxRecord {
                host: "mx-a.example.com".to_string(),
                priority: 10,
            },
        ];

        records.sort_by_key(|record| record.priority);

        assert_eq!(records[0].host, "mx-primary.example.com");
        // 10/10 tie preserves original order: b before a
        assert_eq!(records[1].host, "mx-b.example.com");
        assert_eq!(records[2].host, "mx-a.example.com");
    }
}
