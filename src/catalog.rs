//! Static catalogs of exit-node countries and pluggable transports.
//!
//! Both tables are immutable `static` data, so lookups never allocate a fresh
//! catalog per call. They back the UI-facing `list_country_codes()` and
//! `list_transport_types()` operations and the validation of exit policies.

use serde::Serialize;

use crate::bridges::Transport;

/// An ISO 3166-1 alpha-2 country code usable in `ExitNodes {cc}` policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountryCode {
    /// Lowercase two-letter code, as Tor expects it inside braces.
    pub code: &'static str,
    /// Human-readable country name.
    pub name: &'static str,
}

/// Description of a supported pluggable transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportType {
    /// Transport as used in bridge lines.
    pub transport: Transport,
    /// Short description for display.
    pub description: &'static str,
}

macro_rules! countries {
    ($($code:literal => $name:literal),* $(,)?) => {
        &[$(CountryCode { code: $code, name: $name }),*]
    };
}

static COUNTRY_CODES: &[CountryCode] = countries! {
    "ar" => "Argentina",
    "at" => "Austria",
    "au" => "Australia",
    "be" => "Belgium",
    "bg" => "Bulgaria",
    "br" => "Brazil",
    "ca" => "Canada",
    "ch" => "Switzerland",
    "cl" => "Chile",
    "cz" => "Czechia",
    "de" => "Germany",
    "dk" => "Denmark",
    "ee" => "Estonia",
    "es" => "Spain",
    "fi" => "Finland",
    "fr" => "France",
    "gb" => "United Kingdom",
    "gr" => "Greece",
    "hk" => "Hong Kong",
    "hu" => "Hungary",
    "ie" => "Ireland",
    "il" => "Israel",
    "in" => "India",
    "is" => "Iceland",
    "it" => "Italy",
    "jp" => "Japan",
    "kr" => "South Korea",
    "lt" => "Lithuania",
    "lu" => "Luxembourg",
    "lv" => "Latvia",
    "md" => "Moldova",
    "mx" => "Mexico",
    "nl" => "Netherlands",
    "no" => "Norway",
    "nz" => "New Zealand",
    "pl" => "Poland",
    "pt" => "Portugal",
    "ro" => "Romania",
    "rs" => "Serbia",
    "ru" => "Russia",
    "se" => "Sweden",
    "sg" => "Singapore",
    "si" => "Slovenia",
    "sk" => "Slovakia",
    "tw" => "Taiwan",
    "ua" => "Ukraine",
    "us" => "United States",
    "za" => "South Africa",
};

static TRANSPORT_TYPES: &[TransportType] = &[
    TransportType {
        transport: Transport::None,
        description: "Plain bridge without obfuscation",
    },
    TransportType {
        transport: Transport::Obfs4,
        description: "Randomized look-like-nothing obfuscation",
    },
    TransportType {
        transport: Transport::MeekLite,
        description: "Domain-fronted HTTPS tunnel through a CDN",
    },
    TransportType {
        transport: Transport::Snowflake,
        description: "WebRTC tunnel through volunteer proxies",
    },
    TransportType {
        transport: Transport::Webtunnel,
        description: "HTTPS WebSocket tunnel mimicking a web server",
    },
];

/// Returns every country code known to the catalog, sorted by code.
pub fn country_codes() -> &'static [CountryCode] {
    COUNTRY_CODES
}

/// Returns every supported transport type.
pub fn transport_types() -> &'static [TransportType] {
    TRANSPORT_TYPES
}

/// Looks up the display name for a country code (case-insensitive).
pub fn country_name(code: &str) -> Option<&'static str> {
    let code = code.to_ascii_lowercase();
    COUNTRY_CODES
        .binary_search_by(|c| c.code.cmp(code.as_str()))
        .ok()
        .map(|i| COUNTRY_CODES[i].name)
}

/// Returns true if `code` is a two-letter code present in the catalog.
pub fn is_known_country(code: &str) -> bool {
    code.len() == 2 && country_name(code).is_some()
}
