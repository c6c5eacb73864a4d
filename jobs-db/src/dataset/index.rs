//! Dataset index arithmetic
//!
//! Every dataset carries a string index like `1`, `2`, `0_1` or `0_1_2`:
//! non-negative integers joined by `_`. The index is the dataset's durable
//! identity, embedded in its table names, and its ordering is the datasets'
//! physical age: level-by-level numeric comparison, shorter indices extended
//! with virtual zeros (`1 < 1_1 < 2`, `0_1 < 0_1_1 < 0_2`).
//!
//! Plain datasets get single-level indices (`1`, `2`, ...). A dataset
//! squeezed between two existing ones gets a nested index computed by
//! [`compute_insert_idx`]; a dataset imported from another cluster is fronted
//! before the pre-existing sequence with a `0_k` index computed by
//! [`compute_cluster_migration_idx`].

use std::cmp::Ordering;

use crate::{dataset::Dataset, error::Error};

/// A parsed dataset index.
///
/// The string form is the durable identity; the parsed levels are carried in
/// memory so comparisons don't re-tokenize.
#[derive(Debug, Clone)]
pub struct DsIndex {
    levels: Vec<u64>,
    text: String,
}

impl DsIndex {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn levels(&self) -> &[u64] {
        &self.levels
    }

    fn from_levels(levels: Vec<u64>) -> Self {
        let text = levels
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("_");
        Self { levels, text }
    }

    /// Depth of the index for insertion purposes. The leading `0` level of a
    /// cluster-import index is positional, not structural: `0_2` sits at the
    /// same depth as `2`.
    fn effective_depth(&self) -> usize {
        self.levels.len() - usize::from(self.levels.first() == Some(&0))
    }

    /// The first index nested directly under this one: `1` -> `1_1`.
    fn child(&self) -> Self {
        let mut levels = self.levels.clone();
        levels.push(1);
        Self::from_levels(levels)
    }

    /// This index with its last level incremented: `1_1` -> `1_2`.
    fn incremented(&self) -> Self {
        let mut levels = self.levels.clone();
        if let Some(last) = levels.last_mut() {
            *last += 1;
        }
        Self::from_levels(levels)
    }
}

impl std::str::FromStr for DsIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::index_arithmetic(s, "empty dataset index"));
        }
        let levels = s
            .split('_')
            .map(|level| {
                level
                    .parse::<u64>()
                    .map_err(|_| Error::index_arithmetic(s, format!("non-numeric level {level:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            levels,
            text: s.to_owned(),
        })
    }
}

impl std::fmt::Display for DsIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl Ord for DsIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.levels.len().max(other.levels.len());
        for i in 0..len {
            let a = self.levels.get(i).copied().unwrap_or(0);
            let b = other.levels.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for DsIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality must agree with the zero-extending comparison above, so it cannot
// be derived from the fields.
impl PartialEq for DsIndex {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DsIndex {}

/// Computes the index for a dataset inserted strictly between two consecutive
/// datasets.
///
/// A `before` at its base depth gains a nested level (`1`/`2` -> `1_1`,
/// `0_1`/`0_2` -> `0_1_1`), while a `before` that is itself a nested
/// insertion has its last level incremented (`1_1`/`2` -> `1_2`). Errors when
/// the pair is not ordered or the gap between them has no free index.
pub fn compute_insert_idx(before: &DsIndex, after: &DsIndex) -> Result<DsIndex, Error> {
    if before >= after {
        return Err(Error::index_arithmetic(
            format!("{before} {after}"),
            "not a valid insert request: indices are not in order",
        ));
    }
    let computed = if before.effective_depth() <= 1 {
        before.child()
    } else {
        before.incremented()
    };
    if &computed <= before || &computed >= after {
        return Err(Error::index_arithmetic(
            format!("{before} {after}"),
            format!("no insertable index between them (computed {computed})"),
        ));
    }
    Ok(computed)
}

/// Computes the index for an imported dataset that must be fronted before the
/// pre-existing sequence.
///
/// The first import gets `0_1`; later imports get `0_<k+1>` where `k` is the
/// highest second level among existing `0_*` datasets. Fails on an empty
/// dataset list, an `after` index deeper than two levels or non-numeric, or
/// when `after` collides with an existing nested (`a_b`) index.
pub fn compute_cluster_migration_idx(
    ds_list: &[Dataset],
    after_index: &str,
) -> Result<DsIndex, Error> {
    let after: DsIndex = after_index.parse()?;
    if after.levels().len() > 2 {
        return Err(Error::index_arithmetic(
            after_index,
            "import target index has more than two levels",
        ));
    }
    if ds_list.is_empty() {
        return Err(Error::index_arithmetic(
            after_index,
            "cannot front an import dataset on an empty dataset list",
        ));
    }
    if after.levels().len() == 2
        && ds_list
            .iter()
            .any(|ds| ds.index.levels().len() == 2 && ds.index == after)
    {
        return Err(Error::index_arithmetic(
            after_index,
            "import target collides with an existing nested dataset index",
        ));
    }

    if ds_list[0].index.levels().len() == 1 {
        return "0_1".parse();
    }
    let max_import_level = ds_list
        .iter()
        .filter(|ds| ds.index.levels().first() == Some(&0))
        .filter_map(|ds| ds.index.levels().get(1))
        .max()
        .copied()
        .unwrap_or(0);
    Ok(DsIndex::from_levels(vec![0, max_import_level + 1]))
}
