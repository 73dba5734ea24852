//! Forward-compatibility gate
//!
//! ATR entries and staged documents can carry a `forward_compat` map written
//! by newer protocol versions. At a fixed set of decision points the engine
//! consults the requirements listed under the stage's wire name and either
//! proceeds, retries (optionally after a server-supplied delay), or fails the
//! operation. Unknown behaviors fail closed: a future protocol we cannot
//! interpret must not be silently trampled.

use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Protocol version this client implements.
const PROTOCOL_MAJOR: u64 = 2;
const PROTOCOL_MINOR: u64 = 0;

/// Decision points at which the gate is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompatStage {
    WwcReadingAtr,
    WwcReplacing,
    WwcRemoving,
    WwcInserting,
    WwcInsertingGet,
    Gets,
    GetsReadingAtr,
    CleanupEntry,
}

impl ForwardCompatStage {
    /// The key this stage is filed under inside a `forward_compat` map.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ForwardCompatStage::WwcReadingAtr => "WW_R",
            ForwardCompatStage::WwcReplacing => "WW_RP",
            ForwardCompatStage::WwcRemoving => "WW_RM",
            ForwardCompatStage::WwcInserting => "WW_I",
            ForwardCompatStage::WwcInsertingGet => "WW_IG",
            ForwardCompatStage::Gets => "G",
            ForwardCompatStage::GetsReadingAtr => "G_A",
            ForwardCompatStage::CleanupEntry => "CL_E",
        }
    }
}

impl fmt::Display for ForwardCompatStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Outcome of consulting the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardCompatResult {
    /// No requirement blocks this client.
    Ok,
    /// Retry the operation, optionally after the given delay.
    Retry { delay: Option<Duration> },
    /// The operation must fail with a forward-compatibility failure.
    Fail,
}

/// Evaluate the requirements for `stage` in a `forward_compat` map.
pub fn check(stage: ForwardCompatStage, forward_compat: Option<&Value>) -> ForwardCompatResult {
    let Some(map) = forward_compat.and_then(|fc| fc.as_object()) else {
        return ForwardCompatResult::Ok;
    };
    let Some(requirements) = map.get(stage.wire_name()).and_then(|r| r.as_array()) else {
        return ForwardCompatResult::Ok;
    };

    for requirement in requirements {
        let protocol = requirement.get("p").and_then(|p| p.as_str());
        if protocol.map(protocol_supported).unwrap_or(false) {
            continue;
        }
        // This client is too old for the advertised protocol; apply the
        // requested behavior.
        match requirement.get("b").and_then(|b| b.as_str()) {
            Some("r") => {
                let delay = requirement
                    .get("ra")
                    .and_then(|ra| ra.as_u64())
                    .map(Duration::from_millis);
                return ForwardCompatResult::Retry { delay };
            }
            // "f" and anything we do not recognize fail closed.
            _ => return ForwardCompatResult::Fail,
        }
    }
    ForwardCompatResult::Ok
}

/// Whether this client implements protocol version `p` ("major.minor").
fn protocol_supported(p: &str) -> bool {
    let mut parts = p.splitn(2, '.');
    let major = parts.next().and_then(|s| s.parse::<u64>().ok());
    let minor = parts.next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
    match major {
        Some(major) => (major, minor) <= (PROTOCOL_MAJOR, PROTOCOL_MINOR),
        // An unparseable version is a future protocol by definition.
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_map_passes() {
        assert_eq!(check(ForwardCompatStage::Gets, None), ForwardCompatResult::Ok);
    }

    #[test]
    fn test_other_stage_passes() {
        let fc = json!({ "CL_E": [{ "p": "9.9", "b": "f" }] });
        assert_eq!(
            check(ForwardCompatStage::Gets, Some(&fc)),
            ForwardCompatResult::Ok
        );
    }

    #[test]
    fn test_supported_protocol_passes() {
        let fc = json!({ "G": [{ "p": "1.0", "b": "f" }] });
        assert_eq!(
            check(ForwardCompatStage::Gets, Some(&fc)),
            ForwardCompatResult::Ok
        );
    }

    #[test]
    fn test_future_protocol_fails() {
        let fc = json!({ "G": [{ "p": "2.5", "b": "f" }] });
        assert_eq!(
            check(ForwardCompatStage::Gets, Some(&fc)),
            ForwardCompatResult::Fail
        );
    }

    #[test]
    fn test_future_protocol_retry_with_delay() {
        let fc = json!({ "WW_R": [{ "p": "3.0", "b": "r", "ra": 25 }] });
        assert_eq!(
            check(ForwardCompatStage::WwcReadingAtr, Some(&fc)),
            ForwardCompatResult::Retry {
                delay: Some(Duration::from_millis(25))
            }
        );
    }

    #[test]
    fn test_unknown_behavior_fails_closed() {
        let fc = json!({ "G": [{ "p": "4.0", "b": "x" }] });
        assert_eq!(
            check(ForwardCompatStage::Gets, Some(&fc)),
            ForwardCompatResult::Fail
        );
        let fc = json!({ "G": [{ "p": "not-a-version", "b": "f" }] });
        assert_eq!(
            check(ForwardCompatStage::Gets, Some(&fc)),
            ForwardCompatResult::Fail
        );
    }
}
