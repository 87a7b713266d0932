//! Development-only admin bypass.

use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BypassDecision {
    NotRequested,
    Enabled,
    Declined,
}

/// `ALLOW_ADMIN_BYPASS=1` only counts together with `PULSE_DEV=true` or
/// `NODE_ENV=development`.
pub(crate) fn decide(
    allow: Option<&str>,
    pulse_dev: Option<&str>,
    node_env: Option<&str>,
) -> BypassDecision {
    if allow != Some("1") {
        return BypassDecision::NotRequested;
    }
    let dev = pulse_dev == Some("true") || node_env.is_some_and(|v| v.eq_ignore_ascii_case("development"));
    if dev {
        BypassDecision::Enabled
    } else {
        BypassDecision::Declined
    }
}

static ADMIN_BYPASS: Lazy<bool> = Lazy::new(|| {
    let decision = decide(
        std::env::var("ALLOW_ADMIN_BYPASS").ok().as_deref(),
        std::env::var("PULSE_DEV").ok().as_deref(),
        std::env::var("NODE_ENV").ok().as_deref(),
    );
    match decision {
        BypassDecision::Enabled => {
            warn!(target: "security", "Admin authentication bypass ENABLED (development mode)");
            true
        }
        BypassDecision::Declined => {
            warn!(target: "security", "Ignoring ALLOW_ADMIN_BYPASS outside development mode");
            false
        }
        BypassDecision::NotRequested => false,
    }
});

/// Evaluated once per process.
#[must_use]
pub fn enabled() -> bool {
    *ADMIN_BYPASS
}
