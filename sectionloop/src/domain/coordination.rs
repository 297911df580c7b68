//! Coordination problems and groups (spec §3, §4.7).

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoordinationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Misaligned,
    UnaddressedNote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationProblem {
    pub index: usize,
    pub section: String,
    pub kind: ProblemKind,
    pub description: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationGroup {
    pub problems: Vec<usize>,
    pub strategy: Strategy,
    pub reason: String,
    /// Union of the member problems' files; computed once the group is
    /// validated, not trusted from the planner's reply.
    #[serde(default)]
    pub files: BTreeSet<PathBuf>,
}

impl CoordinationGroup {
    pub fn derive_files(&mut self, problems: &[CoordinationProblem]) {
        self.files = self
            .problems
            .iter()
            .filter_map(|&i| problems.get(i))
            .flat_map(|p| p.files.iter().cloned())
            .collect();
    }
}

/// Validates that group indices partition `[0, problem_count)` exactly
/// (spec §4.7 step 2, §8). On any structural error, the caller falls
/// back to one problem per group.
pub fn validate_partition(groups: &[CoordinationGroup], problem_count: usize) -> Result<(), CoordinationError> {
    let mut seen = BTreeSet::new();
    for group in groups {
        for &index in &group.problems {
            if index >= problem_count || !seen.insert(index) {
                return Err(CoordinationError::InvalidPartition(problem_count));
            }
        }
    }
    if seen.len() == problem_count {
        Ok(())
    } else {
        Err(CoordinationError::InvalidPartition(problem_count))
    }
}

/// One problem per group, parallel strategy — the fallback plan used
/// when the planner's reply doesn't validate.
pub fn one_problem_per_group(problems: &[CoordinationProblem]) -> Vec<CoordinationGroup> {
    problems
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mut group = CoordinationGroup {
                problems: vec![i],
                strategy: Strategy::Parallel,
                reason: "fallback: unparseable coordination plan".to_string(),
                files: BTreeSet::new(),
            };
            group.derive_files(std::slice::from_ref(p));
            group
        })
        .collect()
}

/// Greedily batches groups so that every batch's member groups have
/// pairwise-disjoint file sets (spec §4.7 step 3, §8). Groups with an
/// empty file set are always isolated into their own batch, since an
/// empty set is vacuously "disjoint" from everything and we don't want
/// them silently riding along with unrelated work.
pub fn batch_groups(groups: Vec<CoordinationGroup>) -> Vec<Vec<CoordinationGroup>> {
    let mut batches: Vec<Vec<CoordinationGroup>> = Vec::new();
    'groups: for group in groups {
        if group.files.is_empty() {
            batches.push(vec![group]);
            continue;
        }
        for batch in &mut batches {
            let disjoint = batch.iter().all(|existing| existing.files.is_disjoint(&group.files));
            if disjoint && batch.iter().all(|existing| !existing.files.is_empty()) {
                batch.push(group);
                continue 'groups;
            }
        }
        batches.push(vec![group]);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(index: usize, files: &[&str]) -> CoordinationProblem {
        CoordinationProblem {
            index,
            section: "01".to_string(),
            kind: ProblemKind::Misaligned,
            description: "d".to_string(),
            files: files.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn validates_exact_partition() {
        let groups = vec![
            CoordinationGroup { problems: vec![0, 1], strategy: Strategy::Parallel, reason: "r".into(), files: BTreeSet::new() },
            CoordinationGroup { problems: vec![2], strategy: Strategy::Sequential, reason: "r".into(), files: BTreeSet::new() },
        ];
        assert!(validate_partition(&groups, 3).is_ok());
    }

    #[test]
    fn rejects_duplicate_or_missing_indices() {
        let dup = vec![
            CoordinationGroup { problems: vec![0, 0], strategy: Strategy::Parallel, reason: "r".into(), files: BTreeSet::new() },
        ];
        assert!(validate_partition(&dup, 1).is_err());

        let missing = vec![
            CoordinationGroup { problems: vec![0], strategy: Strategy::Parallel, reason: "r".into(), files: BTreeSet::new() },
        ];
        assert!(validate_partition(&missing, 2).is_err());
    }

    #[test]
    fn batches_keep_disjoint_file_sets_together() {
        let problems = vec![problem(0, &["a.go"]), problem(1, &["b.go"]), problem(2, &["a.go"])];
        let mut g0 = CoordinationGroup { problems: vec![0], strategy: Strategy::Parallel, reason: "r".into(), files: BTreeSet::new() };
        g0.derive_files(&problems);
        let mut g1 = CoordinationGroup { problems: vec![1], strategy: Strategy::Parallel, reason: "r".into(), files: BTreeSet::new() };
        g1.derive_files(&problems);
        let mut g2 = CoordinationGroup { problems: vec![2], strategy: Strategy::Parallel, reason: "r".into(), files: BTreeSet::new() };
        g2.derive_files(&problems);

        let batches = batch_groups(vec![g0, g1, g2]);
        // g0 and g2 both touch a.go and must land in different batches.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }
}
