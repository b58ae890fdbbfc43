//! List signing certificates
//!
//! Enumerates every configured backend and prints the merged listing as JSON.
//!
//! Usage:
//!   cargo run --bin list_certificates
//!   cargo run --bin list_certificates -- --config credentials.json --valid-only
//!   RUST_LOG=debug cargo run --bin list_certificates -- --source token --timeout-ms 5000

use pdf_credentials::certificate::{CertificateFilter, CertificateSource};
use pdf_credentials::config::CredentialConfig;
use pdf_credentials::registry::{CertificateRegistry, ListOptions};
use std::path::PathBuf;
use std::time::Duration;

struct ListConfig {
    config_path: Option<PathBuf>,
    source: Option<CertificateSource>,
    search: Option<String>,
    valid_only: bool,
    show_duplicates: bool,
    timeout: Option<Duration>,
}

impl ListConfig {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().collect();
        let mut config = ListConfig {
            config_path: None,
            source: None,
            search: None,
            valid_only: false,
            show_duplicates: false,
            timeout: None,
        };

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    i += 1;
                    config.config_path = args.get(i).map(PathBuf::from);
                },
                "--source" => {
                    i += 1;
                    let name = args.get(i).ok_or("--source needs a value")?;
                    config.source = Some(
                        CertificateSource::from_name(name)
                            .ok_or_else(|| format!("unknown source '{}'", name))?,
                    );
                },
                "--search" => {
                    i += 1;
                    config.search = args.get(i).cloned();
                },
                "--timeout-ms" => {
                    i += 1;
                    let ms: u64 = args
                        .get(i)
                        .and_then(|v| v.parse().ok())
                        .ok_or("--timeout-ms needs a number")?;
                    config.timeout = Some(Duration::from_millis(ms));
                },
                "--valid-only" => config.valid_only = true,
                "--duplicates" => config.show_duplicates = true,
                "--help" | "-h" => {
                    println!(
                        "Usage: list_certificates [--config FILE] [--source file|token|store] \
                         [--search TEXT] [--valid-only] [--duplicates] [--timeout-ms N]"
                    );
                    std::process::exit(0);
                },
                other => return Err(format!("unknown argument '{}'", other)),
            }
            i += 1;
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = ListConfig::from_args()?;
    let config = match &args.config_path {
        Some(path) => CredentialConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => CredentialConfig::default(),
    };

    let mut filter = CertificateFilter::new().with_valid_only(args.valid_only);
    if let Some(source) = args.source {
        filter = filter.with_source(source);
    }
    if let Some(search) = &args.search {
        filter = filter.with_search(search.clone());
    }

    let mut options = ListOptions::new()
        .with_duplicates(args.show_duplicates)
        .with_filter(filter);
    if let Some(timeout) = args.timeout {
        options = options.with_deadline(timeout);
    }

    let registry = CertificateRegistry::from_config(&config);
    let listing = registry.list_all(&options);

    for warning in &listing.warnings {
        eprintln!("warning: {}: {}", warning.adapter, warning.message);
    }
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}
