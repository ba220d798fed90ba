use serde::{Deserialize, Deserializer, Serialize};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pass,
    NeedsWork,
    Error,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalStatus::Pass => write!(f, "PASS"),
            SignalStatus::NeedsWork => write!(f, "NEEDS_WORK"),
            SignalStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Nit,
    #[default]
    Other,
}

/// Unknown severity strings map to `Other` -- the parser is lenient on
/// findings, strict on the four required signal fields.
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "major" => Severity::Major,
            "minor" => Severity::Minor,
            "nit" => Severity::Nit,
            _ => Severity::Other,
        })
    }
}

impl Severity {
    /// Map a finding severity to a tracker priority for discovery filing.
    pub fn priority(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::Major => 1,
            Severity::Minor => 2,
            Severity::Nit | Severity::Other => 3,
        }
    }
}

// --- Structs ---

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    pub title: String,
    pub severity: Severity,
    pub description: String,
}

/// Accepts both a plain string (title only) and a full object.
/// This makes deserialization resilient to agents that output
/// `"findings": ["some title"]` instead of the structured format.
impl<'de> Deserialize<'de> for Finding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum FindingRaw {
            String(String),
            Struct {
                title: String,
                #[serde(default)]
                severity: Severity,
                #[serde(default)]
                description: String,
            },
        }

        match FindingRaw::deserialize(deserializer)? {
            FindingRaw::String(title) => Ok(Finding {
                title,
                severity: Severity::Other,
                description: String::new(),
            }),
            FindingRaw::Struct {
                title,
                severity,
                description,
            } => Ok(Finding {
                title,
                severity,
                description,
            }),
        }
    }
}

/// The structured status object every phase must emit as the last JSON
/// object on stdout, on a single line.
///
/// `files_changed` and `findings` are normalized to empty vectors, never
/// absent, so consumers can iterate without null checks. Extra fields in
/// the emitted JSON (e.g. `commit_hash` from the merge phase) are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Signal {
    pub status: SignalStatus,
    pub feedback: String,
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl Signal {
    /// Synthesize an ERROR signal for output that contained no valid signal.
    /// The orchestrator treats synthetic ERRORs like real ones.
    pub fn synthetic_error(feedback: &str) -> Self {
        Signal {
            status: SignalStatus::Error,
            feedback: feedback.to_string(),
            summary: "no signal".to_string(),
            files_changed: Vec::new(),
            findings: Vec::new(),
        }
    }
}

// --- Extraction ---

/// Required top-level fields a JSON object must carry to qualify as a signal.
const REQUIRED_FIELDS: [&str; 4] = ["status", "feedback", "summary", "files_changed"];

/// Extract the last valid signal from arbitrary process output.
///
/// Scans lines from the last line backward; the first line that parses as a
/// single JSON object with all four required fields, a valid `status` enum
/// value, and an array `files_changed` wins. Completion processes emit prose
/// around the machine-readable result, so surrounding noise is expected and
/// ignored. Multi-line (pretty-printed) JSON never matches -- the contract
/// requires the signal on a single line.
///
/// If no line qualifies, returns a synthetic ERROR signal rather than
/// failing the phase fatally.
pub fn parse_signal(output: &str) -> Signal {
    for line in output.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Some(signal) = validate_candidate(&value) {
            return signal;
        }
    }

    Signal::synthetic_error("no valid signal in process output")
}

/// Check a parsed JSON value against the signal contract and deserialize it.
///
/// Field checks run before deserialization so that a line which is valid
/// JSON but not a signal (a log record, say) is skipped rather than
/// rejected.
fn validate_candidate(value: &serde_json::Value) -> Option<Signal> {
    let obj = value.as_object()?;

    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            return None;
        }
    }

    let status = obj.get("status")?.as_str()?;
    if !matches!(status, "PASS" | "NEEDS_WORK" | "ERROR") {
        return None;
    }

    if !obj.get("files_changed")?.is_array() {
        return None;
    }

    if !obj.get("feedback")?.is_string() || !obj.get("summary")?.is_string() {
        return None;
    }

    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_priority_mapping() {
        assert_eq!(Severity::Critical.priority(), 0);
        assert_eq!(Severity::Major.priority(), 1);
        assert_eq!(Severity::Minor.priority(), 2);
        assert_eq!(Severity::Nit.priority(), 3);
        assert_eq!(Severity::Other.priority(), 3);
    }

    #[test]
    fn unknown_severity_maps_to_other() {
        let finding: Finding =
            serde_json::from_str(r#"{"title":"t","severity":"blocker","description":"d"}"#)
                .unwrap();
        assert_eq!(finding.severity, Severity::Other);
    }

    #[test]
    fn finding_accepts_plain_string() {
        let finding: Finding = serde_json::from_str(r#""missing edge case""#).unwrap();
        assert_eq!(finding.title, "missing edge case");
        assert_eq!(finding.severity, Severity::Other);
    }
}
