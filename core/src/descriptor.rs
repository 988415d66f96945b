//! Matching advertised BLE names to engine descriptors.

use crate::engine::Descriptor;
use crate::error::HandshakeError;
use crate::storage::normalize_device_type;

/// First descriptor whose product name appears in the advertised name.
///
/// Longer product names are tried first so that "Perdix AI" wins over
/// "Perdix" for a device advertising "Perdix AI 123".
pub fn identify<'a>(
    advertised_name: &str,
    descriptors: &'a [Descriptor],
) -> Result<&'a Descriptor, HandshakeError> {
    let mut candidates: Vec<&Descriptor> = descriptors
        .iter()
        .filter(|d| !d.product.is_empty() && advertised_name.contains(d.product.as_str()))
        .collect();
    candidates.sort_by_key(|d| std::cmp::Reverse(d.product.len()));
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| HandshakeError::UnsupportedDevice(advertised_name.to_string()))
}

/// Device type used in fingerprint keys.
pub fn device_type(descriptor: &Descriptor) -> String {
    normalize_device_type(&format!("{} {}", descriptor.vendor, descriptor.product))
}
