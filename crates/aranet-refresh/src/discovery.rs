//! Finding a paired sensor again, and listing new ones.
//!
//! Peripherals can rotate the address they advertise under, so a direct
//! lookup by the stored identifier is only the fast path. When it misses,
//! a full scan is filtered down to advertisements carrying an Aranet4 data
//! service and matched by identifier.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use aranet_refresh_types::uuids::DATA_SERVICE_UUIDS;

use crate::error::{Error, Result};
use crate::transport::{Advertisement, Transport, advertises_any, matches_identifier};

/// How an advertisement was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPath {
    /// The direct lookup by identifier hit.
    Direct,
    /// The direct lookup missed and the fallback scan matched.
    Scan,
}

impl fmt::Display for DiscoveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryPath::Direct => f.write_str("direct"),
            DiscoveryPath::Scan => f.write_str("scan"),
        }
    }
}

/// A resolved advertisement and the path that found it.
#[derive(Debug)]
pub struct Resolved {
    /// The matching advertisement.
    pub advertisement: Box<dyn Advertisement>,
    /// Which path produced it.
    pub path: DiscoveryPath,
}

/// Locate the advertisement for a previously paired `identifier`.
///
/// Returns [`Error::DiscoveryFailure`] if neither the direct lookup nor the
/// filtered scan match. A failed scan is reported the same way, after
/// logging the underlying error.
#[tracing::instrument(level = "debug", skip(transport))]
pub async fn resolve(
    transport: &dyn Transport,
    identifier: &str,
    find_timeout: Duration,
    scan_duration: Duration,
) -> Result<Resolved> {
    match transport.find_by_identifier(identifier, find_timeout).await {
        Ok(advertisement) => {
            debug!("Found by direct lookup");
            return Ok(Resolved {
                advertisement,
                path: DiscoveryPath::Direct,
            });
        }
        Err(e) => {
            info!(error = %e, "Direct lookup missed, falling back to scan");
        }
    }

    let candidates = match transport.scan(scan_duration).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(error = %e, "Fallback scan failed");
            return Err(Error::device_not_found(identifier));
        }
    };
    let seen = candidates.len();

    let found = candidates.into_iter().find(|adv| {
        advertises_any(adv.as_ref(), &DATA_SERVICE_UUIDS)
            && matches_identifier(adv.as_ref(), identifier)
    });

    match found {
        Some(advertisement) => {
            info!(seen, "Rediscovered by scan");
            Ok(Resolved {
                advertisement,
                path: DiscoveryPath::Scan,
            })
        }
        None => {
            debug!(seen, "No matching advertisement in scan results");
            Err(Error::device_not_found(identifier))
        }
    }
}

/// A sensor seen during a pairing scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCandidate {
    /// Identifier to store when pairing.
    pub identifier: String,
    /// Advertised name.
    pub display_name: String,
}

/// Scan for sensors that could be paired.
///
/// Keeps advertisements that have a name and carry at least one Aranet4
/// data service UUID.
pub async fn pairing_candidates(
    transport: &dyn Transport,
    scan_timeout: Duration,
) -> Result<Vec<PairingCandidate>> {
    let advertisements = transport.scan(scan_timeout).await?;

    let candidates: Vec<PairingCandidate> = advertisements
        .iter()
        .filter(|adv| advertises_any(adv.as_ref(), &DATA_SERVICE_UUIDS))
        .filter_map(|adv| {
            adv.display_name().map(|name| PairingCandidate {
                identifier: adv.identifier().to_string(),
                display_name: name.to_string(),
            })
        })
        .collect();

    info!(
        seen = advertisements.len(),
        found = candidates.len(),
        "Pairing scan complete"
    );
    Ok(candidates)
}
