//! Certificate registry.
//!
//! The registry owns no certificates. Every call enumerates the registered
//! backends afresh on worker threads, merges their results, removes
//! duplicates and ranks what is left. Backend failures never fail the
//! listing; they are reported as [`BackendWarning`]s next to the
//! certificates that were found.
//!
//! ## Ordering
//!
//! Certificates are sorted by backend preference (Store, then Token, then
//! File), then display name, then fingerprint. When the same fingerprint is
//! reachable through several backends only the most preferred copy is kept,
//! unless [`ListOptions::with_duplicates`] is set.

use crate::backends::{BackendAdapter, FileAdapter, StoreAdapter, TokenAdapter};
use crate::certificate::{Certificate, CertificateFilter, CertificateSource, Fingerprint};
use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use crate::secret::SecretPin;
use crate::signing::Signer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Options for one enumeration.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Give up on backends that have not answered within this time
    pub deadline: Option<Duration>,
    /// Keep lower-preference copies of the same certificate
    pub show_duplicates: bool,
    /// Criteria applied after deduplication
    pub filter: Option<CertificateFilter>,
    /// Instant used for validity checks (defaults to now)
    pub evaluation_time: Option<DateTime<Utc>>,
}

impl ListOptions {
    /// Default options: no deadline, no duplicates, no filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an enumeration deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Keep duplicates from other backends.
    pub fn with_duplicates(mut self, show: bool) -> Self {
        self.show_duplicates = show;
        self
    }

    /// Apply a filter.
    pub fn with_filter(mut self, filter: CertificateFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Evaluate validity at `at` instead of now.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.evaluation_time = Some(at);
        self
    }
}

/// A backend that failed or timed out during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendWarning {
    /// Backend tag
    pub source: CertificateSource,
    /// Adapter name
    pub adapter: String,
    /// What went wrong
    pub message: String,
    /// The adapter was abandoned at the deadline
    pub timed_out: bool,
}

/// Result of an enumeration.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateListing {
    /// Merged, deduplicated, ranked certificates
    pub certificates: Vec<Certificate>,
    /// One entry per failed or abandoned backend
    pub warnings: Vec<BackendWarning>,
    /// At least one backend did not finish before the deadline
    pub partial: bool,
}

impl CertificateListing {
    /// Find a certificate by fingerprint.
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<&Certificate> {
        self.certificates.iter().find(|c| c.fingerprint() == fingerprint)
    }

    /// Whether no certificate was found.
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

/// A certificate together with the adapter that produced it.
struct Found {
    adapter: usize,
    cert: Certificate,
}

struct Enumeration {
    found: Vec<Found>,
    warnings: Vec<BackendWarning>,
    partial: bool,
}

/// Fans enumeration out to backend adapters and resolves signers.
#[derive(Clone, Default)]
pub struct CertificateRegistry {
    adapters: Vec<Arc<dyn BackendAdapter>>,
    default_deadline: Option<Duration>,
}

impl CertificateRegistry {
    /// A registry with no adapters.
    pub fn new() -> Self {
        Self::default()
    }

    /// The three standard adapters built from `config`.
    pub fn from_config(config: &CredentialConfig) -> Self {
        let mut registry = Self::new()
            .with_adapter(Arc::new(StoreAdapter::from_config(config)))
            .with_adapter(Arc::new(TokenAdapter::from_config(config)))
            .with_adapter(Arc::new(FileAdapter::from_config(config)));
        registry.default_deadline = config.enumeration_timeout();
        registry
    }

    /// Register an adapter.
    pub fn with_adapter(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register an adapter in place.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        log::debug!("Registered {} adapter '{}'", adapter.source(), adapter.name());
        self.adapters.push(adapter);
    }

    /// Deadline used when [`ListOptions::deadline`] is unset.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    /// Registered adapters, in registration order.
    pub fn adapters(&self) -> &[Arc<dyn BackendAdapter>] {
        &self.adapters
    }

    /// Enumerate every backend and merge the results.
    pub fn list_all(&self, options: &ListOptions) -> CertificateListing {
        let at = options.evaluation_time.unwrap_or_else(Utc::now);
        let enumeration = self.enumerate(options.deadline.or(self.default_deadline));
        let merged = merge(enumeration.found, options.show_duplicates);

        let mut certificates: Vec<Certificate> = merged.into_iter().map(|f| f.cert).collect();
        if let Some(filter) = &options.filter {
            certificates = filter.apply(certificates, at);
        }

        log::info!(
            "Listed {} certificates ({} backend warnings{})",
            certificates.len(),
            enumeration.warnings.len(),
            if enumeration.partial { ", partial" } else { "" }
        );
        CertificateListing {
            certificates,
            warnings: enumeration.warnings,
            partial: enumeration.partial,
        }
    }

    /// [`list_all`](Self::list_all) restricted to certificates inside their
    /// validity window at the evaluation time.
    pub fn list_valid(&self, options: &ListOptions) -> CertificateListing {
        let at = options.evaluation_time.unwrap_or_else(Utc::now);
        let mut listing = self.list_all(options);
        listing.certificates.retain(|c| c.is_valid_at(at));
        listing
    }

    /// Resolve a fingerprint against a live enumeration and open a signer.
    pub fn get_signer(&self, fingerprint: &Fingerprint, pin: SecretPin) -> Result<Box<dyn Signer>> {
        let enumeration = self.enumerate(self.default_deadline);
        let preferred = merge(enumeration.found, false)
            .into_iter()
            .find(|f| f.cert.fingerprint() == fingerprint);

        let Some(found) = preferred else {
            if enumeration.partial {
                log::warn!("Fingerprint {} not found in a partial listing", fingerprint);
            }
            return Err(Error::NotFound(fingerprint.to_string()));
        };

        let adapter = &self.adapters[found.adapter];
        log::debug!(
            "Resolved {} to '{}' via {}",
            fingerprint,
            found.cert.name(),
            adapter.name()
        );
        adapter.get_signer(&found.cert, pin)
    }

    /// [`get_signer`](Self::get_signer) bounded by `deadline`.
    ///
    /// Resolution runs on a worker thread. If it finishes late, the signer it
    /// produced is dropped, which closes it.
    pub fn get_signer_with_deadline(
        &self,
        fingerprint: &Fingerprint,
        pin: SecretPin,
        deadline: Duration,
    ) -> Result<Box<dyn Signer>> {
        let (tx, rx) = mpsc::channel();
        let registry = self.clone();
        let fingerprint = fingerprint.clone();

        thread::Builder::new()
            .name("resolve-signer".to_string())
            .spawn(move || {
                let result = registry.get_signer(&fingerprint, pin);
                if tx.send(result).is_err() {
                    log::debug!("Signer for {} resolved after the deadline", fingerprint);
                }
            })?;

        match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::DeadlineExceeded(deadline)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::SigningFailed("signer resolution thread panicked".to_string()))
            },
        }
    }

    fn enumerate(&self, deadline: Option<Duration>) -> Enumeration {
        let (tx, rx) = mpsc::channel();
        let mut warnings = Vec::new();
        let mut spawned = vec![false; self.adapters.len()];

        for (idx, adapter) in self.adapters.iter().enumerate() {
            let tx = tx.clone();
            let worker_adapter = adapter.clone();
            let name = format!("enumerate-{}", adapter.source().name().to_ascii_lowercase());
            let result = thread::Builder::new().name(name).spawn(move || {
                let listed = worker_adapter.list_certificates();
                // Receiver gone means the deadline passed; drop the result.
                let _ = tx.send((idx, listed));
            });
            match result {
                Ok(_) => spawned[idx] = true,
                Err(e) => warnings.push(warning(adapter.as_ref(), e.to_string(), false)),
            }
        }
        drop(tx);

        let started = Instant::now();
        let mut outcomes: Vec<Option<Result<Vec<Certificate>>>> =
            (0..self.adapters.len()).map(|_| None).collect();
        let mut remaining = spawned.iter().filter(|s| **s).count();
        let mut timed_out = false;

        while remaining > 0 {
            let received = match deadline {
                Some(limit) => {
                    let left = limit.saturating_sub(started.elapsed());
                    match rx.recv_timeout(left) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            timed_out = true;
                            break;
                        },
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                },
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            let (idx, listed) = received;
            outcomes[idx] = Some(listed);
            remaining -= 1;
        }

        let mut found = Vec::new();
        let mut partial = false;
        for (idx, adapter) in self.adapters.iter().enumerate() {
            match outcomes[idx].take() {
                Some(Ok(certs)) => {
                    found.extend(certs.into_iter().map(|cert| Found { adapter: idx, cert }))
                },
                Some(Err(e)) => {
                    log::warn!("{} enumeration failed: {}", adapter.name(), e);
                    warnings.push(warning(adapter.as_ref(), e.to_string(), false));
                },
                None if spawned[idx] && timed_out => {
                    log::warn!("{} did not answer before the deadline", adapter.name());
                    partial = true;
                    warnings.push(warning(
                        adapter.as_ref(),
                        "enumeration deadline exceeded".to_string(),
                        true,
                    ));
                },
                None if spawned[idx] => {
                    warnings.push(warning(
                        adapter.as_ref(),
                        "enumeration worker panicked".to_string(),
                        false,
                    ));
                },
                None => {},
            }
        }

        Enumeration {
            found,
            warnings,
            partial,
        }
    }
}

fn warning(adapter: &dyn BackendAdapter, message: String, timed_out: bool) -> BackendWarning {
    BackendWarning {
        source: adapter.source(),
        adapter: adapter.name().to_string(),
        message,
        timed_out,
    }
}

/// Rank and deduplicate.
///
/// With `show_duplicates`, copies from other backends follow their preferred
/// copy; copies from the same backend are always dropped.
fn merge(mut found: Vec<Found>, show_duplicates: bool) -> Vec<Found> {
    found.sort_by(|a, b| {
        a.cert
            .source()
            .preference()
            .cmp(&b.cert.source().preference())
            .then_with(|| a.cert.name().cmp(b.cert.name()))
            .then_with(|| a.cert.fingerprint().cmp(b.cert.fingerprint()))
    });

    let mut seen: HashSet<(Fingerprint, CertificateSource)> = HashSet::new();
    let mut primary = Vec::new();
    let mut extras: HashMap<Fingerprint, Vec<Found>> = HashMap::new();

    for entry in found {
        let fingerprint = entry.cert.fingerprint().clone();
        let first_for_fingerprint = !primary_contains(&seen, &fingerprint);
        if !seen.insert((fingerprint.clone(), entry.cert.source())) {
            continue;
        }
        if first_for_fingerprint {
            primary.push(entry);
        } else if show_duplicates {
            extras.entry(fingerprint).or_default().push(entry);
        }
    }

    let mut out = Vec::with_capacity(primary.len());
    for entry in primary {
        let more = extras.remove(entry.cert.fingerprint());
        out.push(entry);
        if let Some(more) = more {
            out.extend(more);
        }
    }
    out
}

fn primary_contains(seen: &HashSet<(Fingerprint, CertificateSource)>, fingerprint: &Fingerprint) -> bool {
    CertificateSource::ALL
        .iter()
        .any(|source| seen.contains(&(fingerprint.clone(), *source)))
}
