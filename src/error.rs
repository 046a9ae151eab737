use std::time::Duration;

use thiserror::Error;

/// Why the in-page language model cannot serve a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityCause {
    /// The page is a browser-internal or extension page.
    InternalPage,
    /// The page is neither http:// nor https://.
    UnsupportedScheme,
    /// The page is a regular web page but the API is not exposed, usually
    /// because the browser flag is off.
    FeatureDisabled,
    /// The API exists but the on-device model has not been downloaded.
    ModelNotProvisioned,
}

impl CapabilityCause {
    pub fn message(&self) -> &'static str {
        match self {
            CapabilityCause::InternalPage => {
                "Prompt API is not available on Chrome internal pages. Please navigate to a regular website (https://)."
            }
            CapabilityCause::UnsupportedScheme => {
                "Prompt API is only available on http:// and https:// pages."
            }
            CapabilityCause::FeatureDisabled => {
                "Prompt API is not available. Make sure Chrome flags are enabled: chrome://flags/#prompt-api-for-gemini-nano"
            }
            CapabilityCause::ModelNotProvisioned => {
                "Language model not available. Check chrome://components/ for \"Optimization Guide On Device Model\" and ensure it's downloaded."
            }
        }
    }
}

/// Every way a relayed prompt can fail.
///
/// Malformed model output never appears here: it is downgraded to a
/// synthesized result by [`crate::response::parse_model_output`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{0}")]
    IneligiblePage(String),

    #[error("Could not reach the page helper ({0}). Reload the page and try again.")]
    BridgeUnreachable(String),

    #[error("Page helper rejected the request: {0}")]
    RelayRejected(String),

    #[error("{}", .0.message())]
    CapabilityUnavailable(CapabilityCause),

    #[error("Prompt API failed: {0}")]
    SessionExecutionFailure(String),

    /// Failure reported by the Session Host, already human-readable.
    #[error("{0}")]
    PageFailure(String),

    #[error("No response from the page after {}s. Reload the page and try again.", .0.as_secs())]
    Timeout(Duration),

    #[error("Request was cancelled")]
    Cancelled,
}

impl RelayError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::IneligiblePage(_) => "ineligible_page",
            RelayError::BridgeUnreachable(_) => "bridge_unreachable",
            RelayError::RelayRejected(_) => "relay_rejected",
            RelayError::CapabilityUnavailable(_) => "capability_unavailable",
            RelayError::SessionExecutionFailure(_) => "session_execution_failure",
            RelayError::PageFailure(_) => "page_failure",
            RelayError::Timeout(_) => "timeout",
            RelayError::Cancelled => "cancelled",
        }
    }
}
