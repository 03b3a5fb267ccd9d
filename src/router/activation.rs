//! Activation-id format: `"<vendor-slug>:<vendor-activation-id>"`.
//!
//! The vendor prefix is the sole routing key for post-purchase operations.

/// Compose the public activation id from a vendor slug and the vendor's raw
/// activation id.
pub fn format_activation_id(vendor: &str, raw_id: &str) -> String {
    format!("{}:{}", vendor, raw_id)
}

/// Split an activation id into `(vendor_slug, raw_id)`.
///
/// Returns `None` when the prefix is missing or not a legal slug
/// (`^[a-z0-9_-]+$`); callers fall back to probing all vendors.
pub fn parse_activation_id(activation_id: &str) -> Option<(&str, &str)> {
    let (vendor, raw_id) = activation_id.split_once(':')?;
    if vendor.is_empty() || raw_id.is_empty() {
        return None;
    }
    let legal = vendor
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !legal {
        return None;
    }
    Some((vendor, raw_id))
}
