//! [`OutputAnalyzer`]: freshness analysis over a [`Target`] (spec.md
//! §4.3).

use std::{
    collections::{HashMap, HashSet},
    io,
    time::SystemTime,
};

use crate::{graph::NodeKey, remover::RemovalReason, target::Target};

/// A timestamp extended with `-inf`/`+inf` sentinels. `+inf` stands in
/// for "missing output" (spec.md §4.3): it is "newer than everything",
/// which is what forces re-execution of the owning node and, once
/// propagated, of its dependents.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timestamp {
    NegInf,
    At(SystemTime),
    PosInf,
}

impl Timestamp {
    fn from_output(result: io::Result<Option<SystemTime>>) -> io::Result<Timestamp> {
        Ok(match result? {
            Some(t) => Timestamp::At(t),
            None => Timestamp::PosInf,
        })
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        match (self, other) {
            (Timestamp::NegInf, Timestamp::NegInf) => Equal,
            (Timestamp::NegInf, _) => Less,
            (_, Timestamp::NegInf) => Greater,
            (Timestamp::PosInf, Timestamp::PosInf) => Equal,
            (Timestamp::PosInf, _) => Greater,
            (_, Timestamp::PosInf) => Less,
            (Timestamp::At(a), Timestamp::At(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-output timestamps, after any invalidation overwrite has been
/// applied (spec.md §4.3). Keyed by node, each node's vector is in the
/// same order as `node.variant.task().outputs()`.
pub type TimestampMap = HashMap<NodeKey, Vec<Timestamp>>;

/// The result of running the analyzer over a [`Target`].
pub struct Analysis {
    pub invalid: HashSet<NodeKey>,
    pub timestamps: TimestampMap,
}

impl Analysis {
    /// Whether `key` either was marked invalid, or never had a
    /// complete set of present outputs to begin with. Used by
    /// fresh-skipping (spec.md §4.5) to find the tail nodes that must
    /// re-run: a node the analyzer never touches (e.g. a structure
    /// node) is never "missing".
    pub fn is_missing_or_invalid(&self, key: &NodeKey) -> bool {
        if self.invalid.contains(key) {
            return true;
        }
        match self.timestamps.get(key) {
            Some(stamps) if !stamps.is_empty() => {
                stamps.iter().any(|t| *t == Timestamp::PosInf)
            }
            _ => false,
        }
    }
}

/// Reads output timestamps and decides which nodes must be
/// re-executed, per spec.md §4.3's `maxDep`/`minOut` recurrence.
pub struct OutputAnalyzer;

impl OutputAnalyzer {
    /// Runs the analysis described in spec.md §4.3. Fails only if an
    /// `Output::timestamp()` call itself returns an I/O error;
    /// "missing" (`Ok(None)`) is not an error and becomes `+inf`.
    pub fn analyze(target: &Target) -> io::Result<Analysis> {
        crate::scoped_metric!("analyzer.analyze");
        let mut timestamps: TimestampMap = HashMap::new();
        for key in target.keys() {
            let node = target.graph().node(key).expect("target invariant");
            let stamps = match node.variant.task() {
                Some(task) => task
                    .outputs()
                    .iter()
                    .map(|o| Timestamp::from_output(o.timestamp()))
                    .collect::<io::Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            timestamps.insert(key.clone(), stamps);
        }

        let mut invalid: HashSet<NodeKey> = HashSet::new();
        let mut max_dep: HashMap<NodeKey, Timestamp> = HashMap::new();

        for key in target.graph().topo_order() {
            if !target.contains(key) {
                continue;
            }
            let node = target.graph().node(key).expect("target invariant");

            let mut dep_bound = Timestamp::NegInf;
            for dep in node.dependencies.iter().filter(|d| target.contains(d)) {
                let dep_out_max = timestamps[dep]
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(Timestamp::NegInf);
                let dep_max = max_dep.get(dep).copied().unwrap_or(Timestamp::NegInf);
                dep_bound = dep_bound.max(dep_out_max).max(dep_max);
            }
            max_dep.insert(key.clone(), dep_bound);

            if node.is_task() {
                let min_out = timestamps[key]
                    .iter()
                    .copied()
                    .min()
                    .unwrap_or(Timestamp::PosInf);
                let any_missing = timestamps[key].iter().any(|t| *t == Timestamp::PosInf);
                if dep_bound > min_out || any_missing {
                    invalid.insert(key.clone());
                    if let Some(stamps) = timestamps.get_mut(key) {
                        for s in stamps.iter_mut() {
                            *s = Timestamp::PosInf;
                        }
                    }
                }
            }
        }

        Ok(Analysis { invalid, timestamps })
    }

    /// Analyzes `target`, then deletes the outputs of every invalid
    /// node with reason `PredatesDependency` (spec.md §4.3).
    pub fn remove_invalid_output(
        target: &Target,
        filter: Option<&dyn crate::remover::OutputRemovalFilter>,
    ) -> io::Result<(Analysis, Vec<io::Error>)> {
        let analysis = Self::analyze(target)?;
        let errors = crate::remover::OutputRemover::remove(
            target.graph(),
            analysis.invalid.iter(),
            RemovalReason::PredatesDependency,
            filter,
        );
        Ok((analysis, errors))
    }
}
