//! Mutation proposals and the content guardrail

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Patterns that never belong in a parameter change.
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    "__import__",
    "import os",
    "os.system",
    "subprocess",
    "eval(",
    "exec(",
    "rm -rf",
    "<script",
    "$(",
];

/// A proposed change to a strategy's tunable parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MutationProposal {
    /// Name of the strategy the change targets.
    pub strategy: String,
    /// New values, keyed by parameter name.
    pub params: BTreeMap<String, Value>,
    /// Why the change is expected to help. Required.
    pub rationale: String,
}

impl MutationProposal {
    /// Parse and validate. Anything malformed is a validation error and the
    /// proposal is never partially used.
    pub fn from_value(value: Value) -> Result<Self> {
        let proposal: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed mutation proposal: {}", e)))?;
        proposal.validate()?;
        Ok(proposal)
    }

    pub fn validate(&self) -> Result<()> {
        if self.strategy.trim().is_empty() {
            return Err(Error::Validation("proposal names no strategy".into()));
        }
        if self.rationale.trim().is_empty() {
            return Err(Error::Validation("proposal rationale is empty".into()));
        }
        if self.params.is_empty() {
            return Err(Error::Validation("proposal changes no parameters".into()));
        }
        if self.params.keys().any(|k| k.trim().is_empty()) {
            return Err(Error::Validation("empty parameter name".into()));
        }
        Ok(())
    }

    /// JSON schema handed to the suggestion source.
    pub fn schema() -> Value {
        schemars::schema_for!(MutationProposal).into()
    }
}

/// Case-insensitive substring blocklist over the proposal text.
#[derive(Debug, Clone)]
pub struct Guardrail {
    patterns: Vec<String>,
}

impl Default for Guardrail {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Guardrail {
    pub fn new(extra: &[String]) -> Self {
        let patterns = DEFAULT_BLOCKLIST
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned())
            .map(|p| p.to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn inspect(&self, text: &str) -> Result<()> {
        let lowered = text.to_lowercase();
        match self.patterns.iter().find(|p| lowered.contains(p.as_str())) {
            Some(p) => Err(Error::Guardrail(format!("matched blocked pattern {:?}", p))),
            None => Ok(()),
        }
    }

    /// Scan the raw text of every field: names, rationale, parameter keys and
    /// string values at any depth.
    pub fn inspect_proposal(&self, proposal: &MutationProposal) -> Result<()> {
        self.inspect(&proposal.strategy)?;
        self.inspect(&proposal.rationale)?;
        for (key, value) in &proposal.params {
            self.inspect(key)?;
            self.inspect_value(value)?;
        }
        Ok(())
    }

    fn inspect_value(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(s) => self.inspect(s),
            Value::Array(items) => items.iter().try_for_each(|v| self.inspect_value(v)),
            Value::Object(map) => map.iter().try_for_each(|(k, v)| {
                self.inspect(k)?;
                self.inspect_value(v)
            }),
            _ => Ok(()),
        }
    }
}

/// Per-parameter textual diff of two parameter dumps, `-` for the old value
/// and `+` for the new one, in key order.
pub fn param_diff(before: &Value, after: &Value) -> Vec<String> {
    let (b, a) = match (before, after) {
        (Value::Object(b), Value::Object(a)) => (b, a),
        _ if before == after => return Vec::new(),
        _ => return vec![format!("- {}", before), format!("+ {}", after)],
    };
    let mut keys: Vec<&String> = b.keys().chain(a.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut lines = Vec::new();
    for key in keys {
        match (b.get(key), a.get(key)) {
            (Some(old), Some(new)) if old == new => {}
            (old, new) => {
                if let Some(old) = old {
                    lines.push(format!("- {}: {}", key, old));
                }
                if let Some(new) = new {
                    lines.push(format!("+ {}: {}", key, new));
                }
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rationale_is_mandatory() {
        let missing = json!({"strategy": "arb", "params": {"min_profit_bps": 30}});
        assert!(matches!(
            MutationProposal::from_value(missing),
            Err(Error::Validation(_))
        ));

        let blank = json!({"strategy": "arb", "params": {"x": 1}, "rationale": "  "});
        assert!(MutationProposal::from_value(blank).is_err());

        let extra = json!({"strategy": "arb", "params": {"x": 1}, "rationale": "r", "code": "x"});
        assert!(MutationProposal::from_value(extra).is_err());

        let ok = json!({"strategy": "arb", "params": {"x": 1}, "rationale": "spread widened"});
        assert_eq!(MutationProposal::from_value(ok).unwrap().params["x"], json!(1));
    }

    #[test]
    fn schema_lists_required_fields() {
        let schema = MutationProposal::schema();
        let required = schema["required"].as_array().unwrap();
        for field in ["strategy", "params", "rationale"] {
            assert!(required.contains(&json!(field)), "{field} not required");
        }
    }

    #[test]
    fn guardrail_blocks_code_execution_markers() {
        let guard = Guardrail::new(&["DROP TABLE".to_string()]);
        let mut p = MutationProposal {
            strategy: "arb".into(),
            params: BTreeMap::from([("slippage".to_string(), json!(0.5))]),
            rationale: "tighter fills".into(),
        };
        guard.inspect_proposal(&p).unwrap();

        p.rationale = "run __IMPORT__('os')".into();
        assert!(matches!(
            guard.inspect_proposal(&p),
            Err(Error::Guardrail(_))
        ));

        p.rationale = "fine".into();
        p.params.insert("note".into(), json!("drop table users"));
        assert!(guard.inspect_proposal(&p).is_err());
    }

    #[test]
    fn guardrail_matches_quotes_and_backslashes_verbatim() {
        let guard = Guardrail::new(&["popen(\"".to_string(), "c:\\windows".to_string()]);
        let mut p = MutationProposal {
            strategy: "arb".into(),
            params: BTreeMap::from([("slippage".to_string(), json!(0.5))]),
            rationale: "call popen(\"sh\") on start".into(),
        };
        assert!(matches!(
            guard.inspect_proposal(&p),
            Err(Error::Guardrail(_))
        ));

        p.rationale = "tighter fills".into();
        guard.inspect_proposal(&p).unwrap();
        p.params.insert(
            "hooks".into(),
            json!({"paths": ["/tmp", "C:\\Windows\\system32"]}),
        );
        assert!(guard.inspect_proposal(&p).is_err());
    }

    #[test]
    fn diff_reports_changed_added_and_removed_keys() {
        let before = json!({"a": 1, "b": 2, "gone": true});
        let after = json!({"a": 1, "b": 3, "new": "x"});
        assert_eq!(
            param_diff(&before, &after),
            vec!["- b: 2", "+ b: 3", "- gone: true", "+ new: \"x\""]
        );
        assert!(param_diff(&before, &before).is_empty());
    }
}
