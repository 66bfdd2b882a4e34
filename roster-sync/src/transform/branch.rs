//! Branch selection under `when` predicates

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value as Json;

use crate::error::{Result, SyncError};
use crate::mapping::{Value, When};

use super::resolve::{branch_value, relative_to};

/// Picks branches of a list by predicate, priority rank and ordering field
#[derive(Debug, Clone, Copy)]
pub struct BranchSelector<'a> {
    ordering_field: &'a str,
}

/// An eligible branch and its rank vector (one entry per predicate path)
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    index: usize,
    rank: Vec<usize>,
}

impl<'a> BranchSelector<'a> {
    pub fn new(ordering_field: &'a str) -> Self {
        BranchSelector { ordering_field }
    }

    /// Best branch for a flat target
    ///
    /// Lowest priority rank wins, then the greatest ordering field. Remaining
    /// ties go to the earlier branch.
    pub fn select_best(
        &self,
        branches: &[Json],
        when: Option<&When>,
        list: &[String],
    ) -> Result<Option<usize>> {
        let candidates = self.eligible(branches, when, list)?;

        let mut best: Option<(&Candidate, Value)> = None;
        for candidate in &candidates {
            let ordering = self.ordering_value(&branches[candidate.index]);
            let replace = match &best {
                None => true,
                Some((current, current_ordering)) => match candidate.rank.cmp(&current.rank) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => ordering.cmp_ordering(current_ordering) == Ordering::Greater,
                },
            };
            if replace {
                best = Some((candidate, ordering));
            }
        }

        Ok(best.map(|(candidate, _)| candidate.index))
    }

    /// Every eligible branch for a branched target, in source order
    pub fn select_all(
        &self,
        branches: &[Json],
        when: Option<&When>,
        list: &[String],
    ) -> Result<Vec<usize>> {
        Ok(self
            .eligible(branches, when, list)?
            .into_iter()
            .map(|c| c.index)
            .collect())
    }

    fn eligible(
        &self,
        branches: &[Json],
        when: Option<&When>,
        list: &[String],
    ) -> Result<Vec<Candidate>> {
        let Some(when) = when.filter(|w| !w.is_empty()) else {
            return Ok((0..branches.len())
                .map(|index| Candidate {
                    index,
                    rank: Vec::new(),
                })
                .collect());
        };

        let mut ranks: Vec<Option<Vec<usize>>> = vec![Some(Vec::new()); branches.len()];

        for (path, allowed) in when.entries() {
            let rest = relative_to(path, list);
            let mut present_anywhere = false;

            for (branch, rank) in branches.iter().zip(ranks.iter_mut()) {
                let actual = branch_value(branch, rest);
                present_anywhere |= actual.is_some();

                let position = actual.as_ref().and_then(|v| allowed.rank(v));
                match position {
                    Some(p) => {
                        if let Some(r) = rank {
                            r.push(p);
                        }
                    }
                    None => *rank = None,
                }
            }

            if !branches.is_empty() && !present_anywhere {
                return Err(SyncError::InvalidBranchReference {
                    list: list.join("."),
                    path: path.to_string(),
                });
            }
        }

        Ok(ranks
            .into_iter()
            .enumerate()
            .filter_map(|(index, rank)| rank.map(|rank| Candidate { index, rank }))
            .collect())
    }

    fn ordering_value(&self, branch: &Json) -> Value {
        branch
            .get(self.ordering_field)
            .and_then(Value::from_json)
            .unwrap_or_default()
    }
}

/// Per-record cache of flat best-branch selections
///
/// Keyed by list and predicate so every object and field selecting from the
/// same list under the same predicate shares one computation.
#[derive(Debug, Default)]
pub struct BranchCache {
    selections: HashMap<(String, String), Option<usize>>,
    hits: usize,
}

impl BranchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached `select_best`
    pub fn best(
        &mut self,
        selector: &BranchSelector<'_>,
        branches: &[Json],
        when: Option<&When>,
        list: &[String],
    ) -> Result<Option<usize>> {
        let key = (
            list.join("."),
            when.map(|w| w.to_string()).unwrap_or_default(),
        );
        if let Some(selection) = self.selections.get(&key) {
            self.hits += 1;
            return Ok(*selection);
        }
        let selection = selector.select_best(branches, when, list)?;
        self.selections.insert(key, selection);
        Ok(selection)
    }

    /// Number of lookups answered from the cache
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Forget all selections (next source record)
    pub fn clear(&mut self) {
        self.selections.clear();
    }
}
