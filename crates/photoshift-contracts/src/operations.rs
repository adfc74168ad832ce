use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transformations a consumer can request for a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    RemoveBackground,
    EnhanceLighting,
    LifestyleContext,
    StyleTransfer,
    CustomPrompt,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::RemoveBackground,
        OperationKind::EnhanceLighting,
        OperationKind::LifestyleContext,
        OperationKind::StyleTransfer,
        OperationKind::CustomPrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoveBackground => "remove-background",
            Self::EnhanceLighting => "enhance-lighting",
            Self::LifestyleContext => "lifestyle-context",
            Self::StyleTransfer => "style-transfer",
            Self::CustomPrompt => "custom-prompt",
        }
    }

    fn default_cost(&self) -> u64 {
        match self {
            Self::RemoveBackground | Self::EnhanceLighting => 1,
            Self::LifestyleContext | Self::StyleTransfer | Self::CustomPrompt => 2,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown operation '{}'", raw.trim()))
    }
}

/// Credit cost per operation, in catalog order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostTable {
    costs: IndexMap<OperationKind, u64>,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            costs: OperationKind::ALL
                .iter()
                .map(|kind| (*kind, kind.default_cost()))
                .collect(),
        }
    }
}

impl CostTable {
    pub fn cost(&self, kind: OperationKind) -> u64 {
        self.costs
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_cost())
    }

    pub fn set(&mut self, kind: OperationKind, cost: u64) {
        self.costs.insert(kind, cost);
    }

    pub fn entries(&self) -> impl Iterator<Item = (OperationKind, u64)> + '_ {
        self.costs.iter().map(|(kind, cost)| (*kind, *cost))
    }

    /// Merges a JSON object of `{"<operation>": <cost>}` over the current table.
    ///
    /// Unknown operations and non-integer costs are skipped; the returned list
    /// names every skipped key so callers can surface it.
    pub fn merge_overrides_json(&mut self, raw: &str) -> anyhow::Result<Vec<String>> {
        let parsed: Value = serde_json::from_str(raw)?;
        let Some(rows) = parsed.as_object() else {
            anyhow::bail!("credit cost overrides must be a JSON object");
        };
        let mut skipped = Vec::new();
        for (key, value) in rows {
            match (key.parse::<OperationKind>(), value.as_u64()) {
                (Ok(kind), Some(cost)) => self.set(kind, cost),
                _ => skipped.push(key.clone()),
            }
        }
        Ok(skipped)
    }
}
