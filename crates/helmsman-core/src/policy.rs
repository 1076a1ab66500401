//! Step oversight policy
//!
//! Decides which step results need a human look before the session moves on.
//! A step is flagged when its capability is on the review list, or when its
//! instruction or result matches one of the configured patterns.

use crate::error::{Error, Result};
use crate::session::{Step, StepOutput};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Serializable oversight settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OversightConfig {
    /// Regexes matched against step instructions
    #[serde(default = "default_instruction_patterns")]
    pub instruction_patterns: Vec<String>,
    /// Regexes matched against step results
    #[serde(default)]
    pub result_patterns: Vec<String>,
    /// Capabilities whose results are always reviewed
    #[serde(default)]
    pub review_capabilities: Vec<String>,
}

fn default_instruction_patterns() -> Vec<String> {
    vec![
        r"(?i)\b(delete|remove|drop|truncate|wipe)\b".to_string(),
        r"(?i)\b(purchase|buy|pay|checkout|transfer)\b".to_string(),
        r"(?i)\b(send|publish|post)\s+(an?\s+)?(email|message|tweet)\b".to_string(),
        r"rm\s+-rf".to_string(),
    ]
}

impl Default for OversightConfig {
    fn default() -> Self {
        Self {
            instruction_patterns: default_instruction_patterns(),
            result_patterns: Vec::new(),
            review_capabilities: Vec::new(),
        }
    }
}

/// Compiled oversight rules. The default flags nothing.
#[derive(Debug, Clone, Default)]
pub struct OversightPolicy {
    instruction_patterns: Vec<Regex>,
    result_patterns: Vec<Regex>,
    review_capabilities: BTreeSet<String>,
}

impl OversightPolicy {
    /// Policy that flags nothing
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Compile a policy from settings
    pub fn from_config(config: &OversightConfig) -> Result<Self> {
        Ok(Self {
            instruction_patterns: compile(&config.instruction_patterns)?,
            result_patterns: compile(&config.result_patterns)?,
            review_capabilities: config
                .review_capabilities
                .iter()
                .map(|c| c.trim().to_string())
                .collect(),
        })
    }

    /// Always review results of this capability
    #[must_use]
    pub fn with_review_capability(mut self, capability: impl Into<String>) -> Self {
        self.review_capabilities.insert(capability.into());
        self
    }

    /// Flag steps whose instruction matches `pattern`
    pub fn with_instruction_pattern(mut self, pattern: &str) -> Result<Self> {
        self.instruction_patterns.push(compile_one(pattern)?);
        Ok(self)
    }

    /// Flag steps whose result matches `pattern`
    pub fn with_result_pattern(mut self, pattern: &str) -> Result<Self> {
        self.result_patterns.push(compile_one(pattern)?);
        Ok(self)
    }

    /// Why the step's result needs review, or `None` to continue unattended
    #[must_use]
    pub fn review_reason(&self, step: &Step, output: &StepOutput) -> Option<String> {
        if self.review_capabilities.contains(&step.capability) {
            return Some(format!("capability '{}' is always reviewed", step.capability));
        }
        if let Some(re) = self
            .instruction_patterns
            .iter()
            .find(|re| re.is_match(&step.instruction))
        {
            return Some(format!("instruction matches /{}/", re.as_str()));
        }
        self.result_patterns
            .iter()
            .find(|re| re.is_match(&output.text))
            .map(|re| format!("result matches /{}/", re.as_str()))
    }

    /// Whether the policy can ever flag a step
    #[must_use]
    pub fn is_permissive(&self) -> bool {
        self.instruction_patterns.is_empty()
            && self.result_patterns.is_empty()
            && self.review_capabilities.is_empty()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile_one(p)).collect()
}

fn compile_one(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Configuration(format!("bad oversight pattern '{pattern}': {e}")))
}
