//! Certificate selection criteria.

use super::model::{Certificate, CertificateSource};
use chrono::{DateTime, Utc};

/// Criteria applied to an enumerated certificate list.
///
/// All criteria are optional; the default filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateFilter {
    /// Keep only certificates from this backend
    pub source: Option<CertificateSource>,
    /// Case-insensitive substring over name, subject, issuer and serial number
    pub search: Option<String>,
    /// Keep only certificates inside their validity window
    pub valid_only: bool,
    /// Keep only certificates declaring this key usage
    pub required_key_usage: Option<String>,
}

impl CertificateFilter {
    /// Create a filter that accepts every certificate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one backend.
    pub fn with_source(mut self, source: CertificateSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set a free-text search term.
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Keep only currently valid certificates.
    pub fn with_valid_only(mut self, valid_only: bool) -> Self {
        self.valid_only = valid_only;
        self
    }

    /// Require a key usage name such as `"Non Repudiation"`.
    pub fn with_key_usage(mut self, usage: impl Into<String>) -> Self {
        self.required_key_usage = Some(usage.into());
        self
    }

    /// Whether `cert` satisfies every criterion, evaluating validity at `at`.
    pub fn matches(&self, cert: &Certificate, at: DateTime<Utc>) -> bool {
        if let Some(source) = self.source {
            if cert.source() != source {
                return false;
            }
        }

        if self.valid_only && !cert.is_valid_at(at) {
            return false;
        }

        if let Some(usage) = &self.required_key_usage {
            if !cert.has_key_usage(usage) {
                return false;
            }
        }

        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => {
                let term = term.to_lowercase();
                [cert.name(), cert.subject(), cert.issuer(), cert.serial_number()]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&term))
            },
            _ => true,
        }
    }

    /// Apply the filter to a list, preserving order.
    pub fn apply(&self, certs: Vec<Certificate>, at: DateTime<Utc>) -> Vec<Certificate> {
        certs.into_iter().filter(|c| self.matches(c, at)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{Fingerprint, KeyUsage, Locator};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn sample() -> Vec<Certificate> {
        let alice = Certificate::new(
            "Alice Rossi",
            Fingerprint::parse("aa"),
            Locator::File {
                path: PathBuf::from("/home/a/alice.p12"),
            },
        )
        .with_subject("CN=Alice Rossi,O=Example")
        .with_issuer("CN=Example CA")
        .with_serial_number("1A")
        .with_key_usage(vec![KeyUsage::DigitalSignature]);

        let bob = Certificate::new(
            "Bob",
            Fingerprint::parse("bb"),
            Locator::Store {
                nickname: "bob".to_string(),
            },
        )
        .with_issuer("CN=Other CA")
        .with_serial_number("BEEF")
        .with_key_usage(vec![KeyUsage::NonRepudiation])
        .with_validity(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
        );

        vec![alice, bob]
    }

    fn names(certs: &[Certificate]) -> Vec<&str> {
        certs.iter().map(|c| c.name()).collect()
    }

    #[test]
    fn test_default_filter_accepts_all() {
        let out = CertificateFilter::new().apply(sample(), Utc::now());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_filter_by_source() {
        let filter = CertificateFilter::new().with_source(CertificateSource::Store);
        let out = filter.apply(sample(), Utc::now());
        assert_eq!(names(&out), vec!["Bob"]);
    }

    #[test]
    fn test_search_matches_issuer_and_serial() {
        let now = Utc::now();
        let by_issuer = CertificateFilter::new().with_search("example ca");
        assert_eq!(names(&by_issuer.apply(sample(), now)), vec!["Alice Rossi"]);

        let by_serial = CertificateFilter::new().with_search("beef");
        assert_eq!(names(&by_serial.apply(sample(), now)), vec!["Bob"]);
    }

    #[test]
    fn test_blank_search_is_ignored() {
        let filter = CertificateFilter::new().with_search("   ");
        assert_eq!(filter.apply(sample(), Utc::now()).len(), 2);
    }

    #[test]
    fn test_valid_only_and_key_usage() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let valid = CertificateFilter::new().with_valid_only(true);
        assert_eq!(names(&valid.apply(sample(), at)), vec!["Alice Rossi"]);

        let nr = CertificateFilter::new().with_key_usage("non repudiation");
        assert_eq!(names(&nr.apply(sample(), at)), vec!["Bob"]);
    }
}
