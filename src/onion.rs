//! Onion URL classification.

use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};

/// Length of a v3 onion address label (base32, without `.onion`).
pub const V3_ADDRESS_LEN: usize = 56;

/// Length of a legacy v2 onion address label.
pub const V2_ADDRESS_LEN: usize = 16;

/// Classification of a URL's host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnionInfo {
    /// Host ends in `.onion`.
    pub is_onion: bool,
    /// Host is a well-formed v3 address.
    pub is_v3: bool,
    /// Host is a well-formed legacy v2 address.
    pub is_v2: bool,
    /// Lowercased host.
    pub host: String,
}

/// Classifies `url`.
///
/// Subdomains are allowed (`www.<address>.onion`). A `.onion` host whose
/// address label is neither 56 nor 16 base32 characters is still reported
/// as onion, with both version flags false.
///
/// # Errors
///
/// Returns [`Error::Validation`] if `url` does not parse or has no host.
///
/// # Example
///
/// ```rust
/// use tor_manager::onion::classify;
///
/// let v3 = format!("http://{}.onion/", "a".repeat(56));
/// assert!(classify(&v3).unwrap().is_v3);
/// assert!(!classify("https://example.com").unwrap().is_onion);
/// assert!(classify("not a url").is_err());
/// ```
pub fn classify(url: &str) -> Result<OnionInfo> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| Error::Validation(format!("malformed URL {:?}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Validation(format!("URL {:?} has no host", url)))?
        .trim_end_matches('.')
        .to_ascii_lowercase();

    let label = host
        .strip_suffix(".onion")
        .map(|rest| rest.rsplit('.').next().unwrap_or(rest));

    let (is_onion, is_v3, is_v2) = match label {
        Some(label) => (
            true,
            is_base32_address(label, V3_ADDRESS_LEN),
            is_base32_address(label, V2_ADDRESS_LEN),
        ),
        None => (false, false, false),
    };

    Ok(OnionInfo {
        is_onion,
        is_v3,
        is_v2,
        host,
    })
}

fn is_base32_address(label: &str, len: usize) -> bool {
    label.len() == len && label.bytes().all(|b| matches!(b, b'a'..=b'z' | b'2'..=b'7'))
}
