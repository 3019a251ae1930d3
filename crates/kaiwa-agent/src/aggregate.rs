//! Reassembles streamed tool-call fragments into complete invocations.
//!
//! Providers stream each tool call as a series of deltas keyed by the call's
//! position in the turn. Deltas for different positions may interleave, and
//! the provider id often arrives only on the first delta. Text is always
//! appended, never replaced.

use std::collections::BTreeMap;

use kaiwa_core::turn::ToolInvocation;
use serde_json::Value;

use crate::stream::ToolCallFragment;

/// A finalized invocation whose arguments parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyCall {
    pub invocation: ToolInvocation,
    pub input: Value,
}

/// The model produced arguments that are not valid JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tool call #{index} ({name}) has malformed arguments: {message}")]
pub struct ToolArgumentParseError {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    by_index: BTreeMap<usize, ToolInvocation>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment. The first fragment for an index allocates the
    /// invocation; an id fills in only while the invocation has none.
    pub fn apply(&mut self, fragment: ToolCallFragment) {
        let entry = self
            .by_index
            .entry(fragment.index)
            .or_insert_with(|| ToolInvocation::new(fragment.index));

        if let Some(id) = fragment.id {
            if entry.id.is_empty() {
                entry.id = id;
            }
        }
        if let Some(name) = fragment.name {
            entry.name.push_str(&name);
        }
        if let Some(arguments) = fragment.arguments {
            entry.arguments.push_str(&arguments);
        }
    }

    /// Current invocations ordered 0..N-1. Indices no fragment referenced
    /// are backfilled with empty placeholders so positions stay aligned.
    pub fn snapshot(&self) -> Vec<ToolInvocation> {
        let Some(&max) = self.by_index.keys().next_back() else {
            return Vec::new();
        };
        (0..=max)
            .map(|i| {
                self.by_index
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| ToolInvocation::new(i))
            })
            .collect()
    }

    /// At least one real (non-placeholder) invocation has been seen.
    pub fn has_pending(&self) -> bool {
        self.by_index.values().any(|inv| !inv.is_placeholder())
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Parse every real invocation's arguments, in index order.
    ///
    /// Blank arguments become `{}`. An invocation that never received an id
    /// gets `call_{index}` so its tool result can still reference it. A parse
    /// failure only affects its own entry. Calling this again yields the same
    /// result; the aggregator is not consumed.
    pub fn finalize(&self) -> Vec<Result<ReadyCall, ToolArgumentParseError>> {
        self.by_index
            .values()
            .filter(|inv| !inv.is_placeholder())
            .map(|inv| {
                let mut invocation = inv.clone();
                if invocation.id.is_empty() {
                    invocation.id = format!("call_{}", invocation.index);
                }

                let raw = if invocation.arguments.trim().is_empty() {
                    "{}"
                } else {
                    invocation.arguments.as_str()
                };

                match serde_json::from_str::<Value>(raw) {
                    Ok(input) => {
                        // keep the stored text in sync with what was executed
                        if invocation.arguments.trim().is_empty() {
                            invocation.arguments = "{}".to_string();
                        }
                        Ok(ReadyCall { invocation, input })
                    }
                    Err(e) => Err(ToolArgumentParseError {
                        index: invocation.index,
                        id: invocation.id,
                        name: invocation.name,
                        message: e.to_string(),
                    }),
                }
            })
            .collect()
    }
}
