use snmp2::Oid;

use crate::error::PollError;

/// Parse a dotted OID from configuration.
pub fn parse_oid(oid_str: &str) -> Result<Oid<'static>, PollError> {
    oid_str
        .parse::<Oid>()
        .map_err(|e| PollError::Config(format!("invalid OID '{}': {:?}", oid_str, e)))
        .map(|oid| oid.to_owned())
}

/// Dotted form, used as the row field name for scalar GETs.
pub fn oid_to_string(oid: &Oid) -> String {
    oid.to_id_string()
}

/// Whether `oid` lies in the subtree rooted at `parent` (inclusive).
pub fn oid_starts_with(oid: &Oid, parent: &Oid) -> bool {
    oid.starts_with(parent)
}

/// Arcs of `oid` below `parent`, dotted. `None` if `oid` is not strictly
/// inside `parent`.
pub fn oid_suffix(oid: &str, parent: &str) -> Option<String> {
    let parent = parent.trim_end_matches('.');
    let rest = oid.strip_prefix(parent)?.strip_prefix('.')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Split a table entry suffix ("10.3") into column ("10") and row index ("3").
pub fn split_column(suffix: &str) -> Option<(&str, &str)> {
    suffix
        .split_once('.')
        .filter(|(_, index)| !index.is_empty())
}
