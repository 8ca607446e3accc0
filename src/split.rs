use std::collections::HashMap;

use serde::Serialize;

use crate::error::DispatchError;
use crate::normalize::CallRequest;
use crate::rules::{Group, Target};

/// Consecutive call indices of one group that share a credential; submitted as
/// one batched invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Split {
    pub indices: Vec<usize>,
    pub target: Target,
}

/// Cut a group into maximal runs of consecutive indices with equal
/// `token_auth`.
///
/// Contiguity is judged per group on raw call indices, so any call between two
/// members (grouped under another method or not grouped at all) ends the run.
pub fn split_group(group: &Group, calls: &[CallRequest]) -> Vec<Split> {
    let mut indices = group.indices.clone();
    indices.sort_unstable();

    let mut splits = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut last: Option<(usize, &str)> = None;

    for idx in indices {
        let token = calls.get(idx).map(CallRequest::token_auth).unwrap_or("");
        let joins = match last {
            None => true,
            Some((last_idx, last_token)) => idx == last_idx + 1 && token == last_token,
        };
        if !joins {
            splits.push(Split {
                indices: std::mem::take(&mut current),
                target: group.target.clone(),
            });
        }
        current.push(idx);
        last = Some((idx, token));
    }

    splits.push(Split {
        indices: current,
        target: group.target.clone(),
    });
    splits
}

/// Execution units for one dispatch: every split plus every ungrouped index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub call_count: usize,
    pub splits: Vec<Split>,
    pub singles: Vec<usize>,
    #[serde(skip)]
    split_of: HashMap<usize, usize>,
}

/// One step of the plan in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanUnit<'a> {
    Batch(&'a Split),
    Single(usize),
}

impl ExecutionPlan {
    /// Fails when a rule source handed back groups that overlap or point past
    /// the end of the request.
    pub fn build(groups: &[Group], calls: &[CallRequest]) -> Result<Self, DispatchError> {
        let mut splits = Vec::new();
        for group in groups {
            splits.extend(
                split_group(group, calls)
                    .into_iter()
                    .filter(|s| !s.indices.is_empty()),
            );
        }

        let mut split_of = HashMap::new();
        for (pos, split) in splits.iter().enumerate() {
            for &idx in &split.indices {
                if idx >= calls.len() {
                    return Err(DispatchError::InvalidPlan {
                        message: format!(
                            "split for {} references call {idx} but only {} call(s) exist",
                            split.target,
                            calls.len()
                        ),
                    });
                }
                if split_of.insert(idx, pos).is_some() {
                    return Err(DispatchError::InvalidPlan {
                        message: format!("call {idx} appears in more than one split"),
                    });
                }
            }
        }

        let singles = (0..calls.len())
            .filter(|idx| !split_of.contains_key(idx))
            .collect();

        Ok(Self {
            call_count: calls.len(),
            splits,
            singles,
            split_of,
        })
    }

    pub fn split_for(&self, index: usize) -> Option<&Split> {
        self.split_of.get(&index).map(|&pos| &self.splits[pos])
    }

    /// Units in the order the scheduler will run them.
    pub fn units(&self) -> Vec<PlanUnit<'_>> {
        let mut seen = vec![false; self.call_count];
        let mut out = Vec::new();
        for i in 0..self.call_count {
            if seen[i] {
                continue;
            }
            match self.split_for(i) {
                Some(split) => {
                    for &idx in split.indices.iter().filter(|&&idx| idx >= i) {
                        seen[idx] = true;
                    }
                    out.push(PlanUnit::Batch(split));
                }
                None => {
                    seen[i] = true;
                    out.push(PlanUnit::Single(i));
                }
            }
        }
        out
    }
}
