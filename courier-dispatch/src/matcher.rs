//! Routing table lookup: exact lowercased address first, then bare domain,
//! then the table's default entry.

use ahash::AHashMap;
use courier_common::address::{self, AddressError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchKind {
    Exact,
    Domain,
    Default,
}

/// Look `addr` up in a table keyed by lowercased full addresses and bare
/// domains. An address that cannot be split is an error for the caller to
/// dress up, except that with `allow_empty` the empty string falls through
/// to the default: it is a valid envelope sender (bounces) though not a
/// valid address. Recipients never get that exemption.
pub(crate) fn lookup<'a, V>(
    addr: &str,
    table: &'a AHashMap<String, V>,
    default: &'a V,
    allow_empty: bool,
) -> Result<(&'a V, MatchKind), AddressError> {
    let full = addr.to_lowercase();
    if let Some(entry) = table.get(&full) {
        return Ok((entry, MatchKind::Exact));
    }

    match address::split(addr) {
        Ok((_, domain)) => {
            if let Some(entry) = table.get(&domain.to_lowercase()) {
                return Ok((entry, MatchKind::Domain));
            }
        }
        Err(err) if !(allow_empty && addr.is_empty()) => return Err(err),
        Err(_) => {}
    }

    Ok((default, MatchKind::Default))
}
