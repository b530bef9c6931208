#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Dispatch,
    Layer,
    Guard,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl EvidenceEntry {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.record_fields(kind, summary, BTreeMap::new());
    }

    pub fn record_fields(
        &mut self,
        kind: EvidenceKind,
        summary: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
            fields,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: EvidenceLedger) {
        self.entries.extend(other.entries);
    }

    /// One JSON object per line, in recording order.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

thread_local! {
    static CAPTURE_STACK: RefCell<Vec<EvidenceLedger>> = const { RefCell::new(Vec::new()) };
}

/// Scoped, thread-local evidence capture. Entries recorded on this thread
/// while the capture is the innermost one land in its ledger. Dropping the
/// capture without calling [`EvidenceCapture::finish`] discards the entries.
#[derive(Debug)]
pub struct EvidenceCapture {
    depth: usize,
    finished: bool,
}

impl EvidenceCapture {
    #[must_use]
    pub fn begin() -> Self {
        let depth = CAPTURE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(EvidenceLedger::new());
            stack.len()
        });
        Self {
            depth,
            finished: false,
        }
    }

    #[must_use]
    pub fn finish(mut self) -> EvidenceLedger {
        self.finished = true;
        self.take()
    }

    fn take(&self) -> EvidenceLedger {
        CAPTURE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.truncate(self.depth);
            if stack.len() == self.depth {
                stack.pop().unwrap_or_default()
            } else {
                EvidenceLedger::new()
            }
        })
    }
}

impl Drop for EvidenceCapture {
    fn drop(&mut self) {
        if !self.finished {
            let _discarded = self.take();
        }
    }
}

/// Runs `f` under a fresh capture and returns its result with the evidence.
pub fn capture_evidence<R>(f: impl FnOnce() -> R) -> (R, EvidenceLedger) {
    let capture = EvidenceCapture::begin();
    let result = f();
    (result, capture.finish())
}

#[must_use]
pub fn evidence_capture_active() -> bool {
    CAPTURE_STACK.with(|stack| !stack.borrow().is_empty())
}

/// Records into the innermost active capture on this thread; a no-op when
/// nothing is capturing.
pub fn record_evidence<I, K, V>(kind: EvidenceKind, summary: impl Into<String>, fields: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    CAPTURE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(ledger) = stack.last_mut() {
            let fields = fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect();
            ledger.record_fields(kind, summary, fields);
        }
    });
}

pub const DEFAULT_MAX_DISPATCH_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub record_evidence: bool,
    pub max_dispatch_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            record_evidence: true,
            max_dispatch_depth: DEFAULT_MAX_DISPATCH_DEPTH,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_dispatch_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_dispatch_depth",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_max_dispatch_depth(mut self, max_dispatch_depth: usize) -> Self {
        self.max_dispatch_depth = max_dispatch_depth;
        self
    }

    #[must_use]
    pub fn with_record_evidence(mut self, record_evidence: bool) -> Self {
        self.record_evidence = record_evidence;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(error) => write!(f, "runtime config parse failure: {error}"),
            Self::Invalid { field, reason } => {
                write!(f, "invalid runtime config field '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{
        ConfigError, DEFAULT_MAX_DISPATCH_DEPTH, EvidenceCapture, EvidenceKind, EvidenceLedger,
        RuntimeConfig, capture_evidence, evidence_capture_active, record_evidence,
    };

    #[test]
    fn ledger_records_plain_and_structured_events() {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Policy, "policy initialized");
        let mut fields = BTreeMap::new();
        fields.insert("key".to_string(), "CPU".to_string());
        ledger.record_fields(EvidenceKind::Dispatch, "dispatch decision", fields);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()[1].kind, EvidenceKind::Dispatch);
        assert_eq!(ledger.entries()[1].field("key"), Some("CPU"));
        assert_eq!(ledger.entries_of(EvidenceKind::Policy).count(), 1);
    }

    #[test]
    fn recording_without_capture_is_a_no_op() {
        assert!(!evidence_capture_active());
        record_evidence(EvidenceKind::Layer, "ignored", [("id", "2")]);
        assert!(!evidence_capture_active());
    }

    #[test]
    fn capture_collects_entries_recorded_on_this_thread() {
        let ((), ledger) = capture_evidence(|| {
            assert!(evidence_capture_active());
            record_evidence(EvidenceKind::Layer, "push", [("key", "Batched"), ("id", "2")]);
            record_evidence(EvidenceKind::Layer, "pop", [("key", "Batched")]);
        });
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()[0].field("id"), Some("2"));
        assert!(!evidence_capture_active());
    }

    #[test]
    fn nested_captures_only_see_their_own_window() {
        let outer = EvidenceCapture::begin();
        record_evidence(EvidenceKind::Policy, "outer-before", std::iter::empty::<(String, String)>());
        let ((), inner) = capture_evidence(|| {
            record_evidence(EvidenceKind::Policy, "inner", std::iter::empty::<(String, String)>());
        });
        record_evidence(EvidenceKind::Policy, "outer-after", std::iter::empty::<(String, String)>());
        let outer = outer.finish();

        assert_eq!(inner.len(), 1);
        assert_eq!(inner.entries()[0].summary, "inner");
        let summaries: Vec<&str> = outer
            .entries()
            .iter()
            .map(|entry| entry.summary.as_str())
            .collect();
        assert_eq!(summaries, vec!["outer-before", "outer-after"]);
    }

    #[test]
    fn dropped_capture_is_discarded_and_unwinds_the_stack() {
        {
            let _capture = EvidenceCapture::begin();
            record_evidence(EvidenceKind::Policy, "lost", std::iter::empty::<(String, String)>());
        }
        assert!(!evidence_capture_active());
    }

    fn explode() {
        panic!("kernel blew up");
    }

    #[test]
    fn capture_is_released_when_the_closure_panics() {
        let outcome = std::panic::catch_unwind(|| {
            capture_evidence(|| {
                record_evidence(EvidenceKind::Policy, "before panic", std::iter::empty::<(String, String)>());
                explode();
            })
        });
        assert!(outcome.is_err());
        assert!(!evidence_capture_active());
    }

    #[test]
    fn json_lines_round_trip_through_serde() {
        let ((), ledger) = capture_evidence(|| {
            record_evidence(EvidenceKind::Dispatch, "op=test::id", [("key", "CPU")]);
        });
        let lines = ledger.to_json_lines().expect("ledger should serialize");
        assert_eq!(lines.lines().count(), 1);
        let decoded: super::EvidenceEntry =
            serde_json::from_str(lines.trim_end()).expect("line should decode");
        assert_eq!(decoded.kind, EvidenceKind::Dispatch);
        assert_eq!(decoded.field("key"), Some("CPU"));
        assert!(lines.contains("\"kind\":\"dispatch\""));
    }

    #[test]
    fn config_defaults_and_overrides_parse() {
        let config = RuntimeConfig::from_json_str("{}").expect("empty config uses defaults");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.max_dispatch_depth, DEFAULT_MAX_DISPATCH_DEPTH);
        assert!(config.record_evidence);

        let config = RuntimeConfig::from_json_str(
            r#"{"record_evidence": false, "max_dispatch_depth": 8}"#,
        )
        .expect("explicit config should parse");
        assert!(!config.record_evidence);
        assert_eq!(config.max_dispatch_depth, 8);
    }

    #[test]
    fn config_rejects_unknown_fields_and_zero_depth() {
        let err = RuntimeConfig::from_json_str(r#"{"trace": true}"#)
            .expect_err("unknown field must fail closed");
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("unknown field"));

        let err = RuntimeConfig::from_json_str(r#"{"max_dispatch_depth": 0}"#)
            .expect_err("zero depth must fail validation");
        assert_eq!(
            err,
            ConfigError::Invalid {
                field: "max_dispatch_depth",
                reason: "must be at least 1",
            }
        );
    }

    proptest! {
        #[test]
        fn prop_capture_preserves_recording_order(count in 0usize..32) {
            let ((), ledger) = capture_evidence(|| {
                for idx in 0..count {
                    record_evidence(EvidenceKind::Dispatch, format!("call-{idx}"), [("idx", idx.to_string())]);
                }
            });
            prop_assert_eq!(ledger.len(), count);
            for (idx, entry) in ledger.entries().iter().enumerate() {
                let expected = idx.to_string();
                prop_assert_eq!(entry.field("idx"), Some(expected.as_str()));
            }
        }
    }
}
