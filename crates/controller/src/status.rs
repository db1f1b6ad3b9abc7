//! Config lifecycle transitions.
//!
//! ```text
//!  create ──► modified ◄──────────── content change ───┐
//!               │  ▲                                    │
//!   report ok   │  │ activate()                         │
//!               ▼  │                                    │
//!            applied ◄──► error ────────────────────────┘
//!               │
//!  deactivate() ▼
//!        deactivating ──► deactivated (device confirms)
//!               │
//!               └──► error (device failed to apply the empty config)
//! ```

use common::api::ConfigStatus;
use thiserror::Error;

pub const DEFAULT_ERROR_REASON: &str = "Reason not reported by the device.";
const TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("status transition from \"{from}\" to \"{to}\" is not allowed")]
    NotAllowed {
        from: ConfigStatus,
        to: ConfigStatus,
    },
}

/// Status after a device reported `reported` while in `current`.
pub fn apply_report(
    current: ConfigStatus,
    reported: ConfigStatus,
) -> Result<ConfigStatus, TransitionError> {
    use ConfigStatus::*;
    let allowed = match reported {
        Applied | Modified => matches!(current, Modified | Applied | Error),
        Error => matches!(current, Modified | Applied | Error | Deactivating),
        Deactivated => matches!(current, Deactivating | Deactivated),
        Deactivating => false,
    };
    if allowed {
        Ok(reported)
    } else {
        Err(TransitionError::NotAllowed {
            from: current,
            to: reported,
        })
    }
}

/// Status after the compiled checksum changed. Deactivation states are
/// only left through `activate()`.
pub fn after_content_change(current: ConfigStatus) -> ConfigStatus {
    if current.is_deactivation() {
        current
    } else {
        ConfigStatus::Modified
    }
}

/// Bound an error reason, marking truncation with `...`. Missing or blank
/// reasons get a default message.
pub fn normalize_error_reason(reason: Option<&str>, max_len: usize) -> String {
    let reason = match reason.map(str::trim) {
        Some(reason) if !reason.is_empty() => reason,
        _ => DEFAULT_ERROR_REASON,
    };
    if reason.chars().count() <= max_len {
        return reason.to_string();
    }
    let keep = max_len.saturating_sub(TRUNCATION_MARKER.len());
    let mut truncated: String = reason.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
