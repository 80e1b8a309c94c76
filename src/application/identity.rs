//! Best-effort caller identity from proxy headers.
//!
//! Nothing here is authenticated. The identity only partitions the daily
//! cache, so a missing or spoofed header degrades memoization and nothing
//! else.

use axum::http::{HeaderMap, HeaderName, header::AsHeaderName};

pub const DEFAULT_PLATFORM_HEADER: &str = "x-vercel-forwarded-for";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";

/// Placeholder some proxies write when they could not see the client.
const UNKNOWN: &str = "unknown";

/// Who is asking, as far as the proxies can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(String),
    /// No usable address header was present.
    Unknown,
}

impl Identity {
    pub fn as_str(&self) -> &str {
        match self {
            Identity::Known(value) => value,
            Identity::Unknown => UNKNOWN,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

/// Picks the caller address from, in order: the hosting platform's forwarding
/// header, the first hop of `x-forwarded-for`, then `x-real-ip`. Blank values
/// and the `unknown` placeholder count as missing.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    platform_header: HeaderName,
}

impl IdentityResolver {
    pub fn new(platform_header: HeaderName) -> Self {
        Self { platform_header }
    }

    pub fn resolve(&self, headers: &HeaderMap) -> Identity {
        header_value(headers, &self.platform_header)
            .or_else(|| {
                header_value(headers, FORWARDED_FOR_HEADER)
                    .and_then(|list| list.split(',').next())
                    .map(str::trim)
                    .filter(|first| is_usable(first))
            })
            .or_else(|| header_value(headers, REAL_IP_HEADER))
            .map(|value| Identity::Known(value.to_string()))
            .unwrap_or(Identity::Unknown)
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_PLATFORM_HEADER))
    }
}

fn header_value<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| is_usable(value))
}

fn is_usable(value: &str) -> bool {
    !value.is_empty() && !value.eq_ignore_ascii_case(UNKNOWN)
}
