use thiserror::Error;

/// Failure to decompose an envelope address into its local part and domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("missing '@' separator")]
    MissingSeparator,
    #[error("empty local part")]
    EmptyLocalPart,
    #[error("empty domain")]
    EmptyDomain,
}

/// Split an envelope address into `(local_part, domain)`.
///
/// The split happens at the last `@` so that quoted local parts containing
/// `@` are handled. The empty string is *not* accepted here: it is a valid
/// SMTP envelope sender (bounce messages) but not a valid address, and
/// callers that deal with envelopes are expected to special-case it.
///
/// # Errors
/// Returns an error if the separator is missing or either side is empty.
pub fn split(addr: &str) -> Result<(&str, &str), AddressError> {
    let (local, domain) = addr.rsplit_once('@').ok_or(AddressError::MissingSeparator)?;
    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart);
    }
    if domain.is_empty() {
        return Err(AddressError::EmptyDomain);
    }
    Ok((local, domain))
}

/// The domain of an address, if it has one.
#[must_use]
pub fn domain(addr: &str) -> Option<&str> {
    split(addr).map(|(_, domain)| domain).ok()
}
