//! Correlation id extraction rules shared by the listeners.

use ricochet_common::CorrelationId;

/// Label of the DNS-01 challenge record
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Matches names against the served zone and pulls correlation ids out of
/// DNS names, HTTP requests and mail addresses.
#[derive(Debug, Clone)]
pub struct ZoneMatcher {
    /// Lowercase, no trailing dot
    domain: String,
    root_tld: bool,
}

impl ZoneMatcher {
    pub fn new(domain: impl Into<String>, root_tld: bool) -> Self {
        let domain = normalize(&domain.into());
        Self { domain, root_tld }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn root_tld(&self) -> bool {
        self.root_tld
    }

    /// Id of the root-TLD singleton bucket (the bare domain)
    pub fn domain_id(&self) -> CorrelationId {
        CorrelationId::from_trusted(self.domain.clone())
    }

    /// `_acme-challenge.<domain>`
    pub fn acme_challenge_name(&self) -> String {
        format!("{}.{}", ACME_CHALLENGE_LABEL, self.domain)
    }

    /// Whether `name` is the zone apex or a name under it
    pub fn is_in_zone(&self, name: &str) -> bool {
        self.subdomain_part(&normalize(name)).is_some()
    }

    /// Everything left of the zone, e.g. `abc.xyz` for `abc.xyz.<domain>`.
    ///
    /// `Some("")` for the apex, `None` outside the zone.
    fn subdomain_part<'a>(&self, name: &'a str) -> Option<&'a str> {
        if name == self.domain {
            return Some("");
        }
        name.strip_suffix(self.domain.as_str())
            .and_then(|prefix| prefix.strip_suffix('.'))
            .filter(|prefix| !prefix.is_empty())
    }

    /// Id for a DNS query name: its leftmost label, or the domain id for the
    /// apex in root-TLD mode.
    pub fn dns_id(&self, qname: &str) -> Option<CorrelationId> {
        let name = normalize(qname);
        let prefix = self.subdomain_part(&name)?;
        if prefix.is_empty() {
            return self.root_tld.then(|| self.domain_id());
        }
        leftmost_id(prefix)
    }

    /// The full subdomain of a query name, recorded alongside the id
    pub fn full_id(&self, qname: &str) -> String {
        let name = normalize(qname);
        match self.subdomain_part(&name) {
            Some("") | None => name,
            Some(prefix) => prefix.to_string(),
        }
    }

    /// Id for an HTTP request: host label, then the first path segment, then
    /// the domain id for the apex in root-TLD mode.
    pub fn http_id(&self, host: Option<&str>, path: &str) -> Option<CorrelationId> {
        let host = host.map(strip_port).map(normalize);
        let prefix = host.as_deref().and_then(|h| self.subdomain_part(h));

        if let Some(id) = prefix.filter(|p| !p.is_empty()).and_then(leftmost_id) {
            return Some(id);
        }

        let segment = path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        if let Ok(id) = CorrelationId::parse(segment) {
            return Some(id);
        }

        (self.root_tld && prefix == Some("")).then(|| self.domain_id())
    }

    /// Id for an SMTP recipient: subdomain label of the address, then the
    /// local-part for mail to the apex, then the domain id in root-TLD mode.
    pub fn smtp_id(&self, recipient: &str) -> Option<CorrelationId> {
        let address = recipient
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        let (local, domain) = address.rsplit_once('@')?;
        let domain = normalize(domain);
        let prefix = self.subdomain_part(&domain)?;

        if !prefix.is_empty() {
            return leftmost_id(prefix);
        }
        if let Ok(id) = CorrelationId::parse(local) {
            return Some(id);
        }
        self.root_tld.then(|| self.domain_id())
    }
}

fn leftmost_id(prefix: &str) -> Option<CorrelationId> {
    let label = prefix.split('.').next()?;
    CorrelationId::parse(label).ok()
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals carry colons of their own
    if host.starts_with('[') {
        return host;
    }
    host.rsplit_once(':').map_or(host, |(h, _)| h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneMatcher {
        ZoneMatcher::new("Example.com.", false)
    }

    fn rooted() -> ZoneMatcher {
        ZoneMatcher::new("example.com", true)
    }

    fn id(s: &str) -> Option<CorrelationId> {
        Some(CorrelationId::parse(s).unwrap())
    }

    #[test]
    fn test_zone_membership() {
        let zone = zone();
        assert!(zone.is_in_zone("example.com"));
        assert!(zone.is_in_zone("ABC.example.com."));
        assert!(!zone.is_in_zone("badexample.com"));
        assert!(!zone.is_in_zone("example.org"));
    }

    #[test]
    fn test_dns_leftmost_label() {
        let zone = zone();
        assert_eq!(zone.dns_id("ABC123.example.com."), id("abc123"));
        assert_eq!(zone.dns_id("abc.nested.example.com"), id("abc"));
        assert_eq!(zone.full_id("abc.nested.example.com"), "abc.nested");
        assert_eq!(zone.dns_id("abc.example.org"), None);
    }

    #[test]
    fn test_dns_apex_only_in_root_tld_mode() {
        assert_eq!(zone().dns_id("example.com"), None);
        assert_eq!(
            rooted().dns_id("example.com."),
            Some(CorrelationId::from_trusted("example.com"))
        );
    }

    #[test]
    fn test_acme_challenge_is_not_an_id() {
        let zone = zone();
        assert_eq!(zone.acme_challenge_name(), "_acme-challenge.example.com");
        assert_eq!(zone.dns_id("_acme-challenge.example.com"), None);
    }

    #[test]
    fn test_http_host_then_path() {
        let zone = zone();
        assert_eq!(
            zone.http_id(Some("abc.example.com:8080"), "/other"),
            id("abc")
        );
        assert_eq!(zone.http_id(Some("example.com"), "/abc123?x=1"), id("abc123"));
        assert_eq!(zone.http_id(None, "/abc123/more"), id("abc123"));
        assert_eq!(zone.http_id(Some("example.com"), "/"), None);
        assert_eq!(zone.http_id(Some("example.com"), "/bad_id"), None);
    }

    #[test]
    fn test_http_root_tld_fallback() {
        assert_eq!(
            rooted().http_id(Some("example.com"), "/"),
            Some(CorrelationId::from_trusted("example.com"))
        );
        assert_eq!(rooted().http_id(Some("other.org"), "/"), None);
    }

    #[test]
    fn test_smtp_recipient_rules() {
        let zone = zone();
        assert_eq!(zone.smtp_id("<user@abc.example.com>"), id("abc"));
        assert_eq!(zone.smtp_id("abc123@example.com"), id("abc123"));
        assert_eq!(zone.smtp_id("abc@elsewhere.org"), None);
        assert_eq!(zone.smtp_id("no-at-sign"), None);
        assert_eq!(zone.smtp_id("bad.local@example.com"), None);
        assert_eq!(
            rooted().smtp_id("bad.local@example.com"),
            Some(CorrelationId::from_trusted("example.com"))
        );
    }
}
