// src/weighting/indicator.rs

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{CalibrationError, Result};
use crate::geography::GeographyAssignment;
use crate::records::Record;
use crate::targets::{AttrValue, TargetStore, TargetType, ValueKey};

/// Upper bound on per-block partial vectors in `estimates`.
const MAX_PARTIALS: usize = 64;

/// Sparse row × target contribution matrix in CSR layout.
///
/// Column `j` corresponds to store target `columns[j]`. A COUNT column holds 1
/// for member rows; a SUM column holds the row's value of the target variable.
#[derive(Debug, Clone)]
pub struct IndicatorMatrix {
    n_rows: usize,
    columns: Vec<usize>,
    kinds: Vec<TargetType>,
    indptr: Vec<usize>,
    indices: Vec<u32>,
    values: Vec<f64>,
    chunk_size: usize,
}

impl IndicatorMatrix {
    /// Assembles a matrix from per-row `(column, value)` entries.
    pub fn from_rows(
        n_cols: usize,
        rows: &[Vec<(usize, f64)>],
        chunk_size: usize,
    ) -> Result<Self> {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);

        for row in rows {
            let mut entries = row.clone();
            entries.sort_by_key(|(c, _)| *c);
            for (col, value) in entries {
                if col >= n_cols {
                    return Err(CalibrationError::DimensionMismatch {
                        expected: n_cols,
                        got: col + 1,
                    });
                }
                if value != 0.0 {
                    indices.push(col as u32);
                    values.push(value);
                }
            }
            indptr.push(indices.len());
        }

        Ok(Self {
            n_rows: rows.len(),
            columns: (0..n_cols).collect(),
            kinds: vec![TargetType::Count; n_cols],
            indptr,
            indices,
            values,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Store target index of each column.
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    pub fn kind(&self, col: usize) -> TargetType {
        self.kinds[col]
    }

    /// Column indices and values of one row.
    pub fn row(&self, r: usize) -> (&[u32], &[f64]) {
        let span = self.indptr[r]..self.indptr[r + 1];
        (&self.indices[span.clone()], &self.values[span])
    }

    /// `estimate[t] = Σ_rows weights[row] × A[row, t]`.
    ///
    /// Rows are reduced in fixed blocks whose partial totals are added in
    /// block order. Blocks span at least `chunk_size` rows and there are at
    /// most `MAX_PARTIALS` of them, so scratch stays `O(MAX_PARTIALS × n_cols)`.
    pub fn estimates(&self, weights: ArrayView1<f64>) -> Array1<f64> {
        let n_cols = self.n_cols();
        let block = self.reduction_block();
        let n_blocks = self.n_rows.div_ceil(block);

        let partials: Vec<Vec<f64>> = (0..n_blocks)
            .into_par_iter()
            .map(|b| {
                let start = b * block;
                let end = (start + block).min(self.n_rows);
                let mut acc = vec![0.0; n_cols];
                for r in start..end {
                    let w = weights[r];
                    let (cols, vals) = self.row(r);
                    for (&c, &v) in cols.iter().zip(vals) {
                        acc[c as usize] += w * v;
                    }
                }
                acc
            })
            .collect();

        let mut totals = Array1::zeros(n_cols);
        for partial in partials {
            for (t, v) in totals.iter_mut().zip(partial) {
                *t += v;
            }
        }
        totals
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Rows per reduction block; depends only on the row count and chunk size.
    fn reduction_block(&self) -> usize {
        self.chunk_size.max(self.n_rows.div_ceil(MAX_PARTIALS)).max(1)
    }

    /// `out[row] = Σ_t A[row, t] × coef[t]`.
    pub fn row_products(&self, coef: ArrayView1<f64>) -> Array1<f64> {
        let out: Vec<f64> = (0..self.n_rows)
            .into_par_iter()
            .map(|r| {
                let (cols, vals) = self.row(r);
                cols.iter()
                    .zip(vals)
                    .map(|(&c, &v)| v * coef[c as usize])
                    .sum::<f64>()
            })
            .collect();
        Array1::from_vec(out)
    }

    /// Number of rows contributing to each column.
    pub fn column_support(&self) -> Vec<usize> {
        let mut support = vec![0; self.n_cols()];
        for &c in &self.indices {
            support[c as usize] += 1;
        }
        support
    }
}

/// Children of one stratum, split by whether they can be looked up.
#[derive(Debug, Default)]
struct ChildIndex {
    /// variable -> value -> children whose first equality constraint matches
    by_value: BTreeMap<String, HashMap<ValueKey, Vec<usize>>>,
    /// children without an equality constraint, tested one by one
    scan: Vec<usize>,
}

impl ChildIndex {
    fn build(store: &TargetStore, children: &[usize]) -> Self {
        let mut index = ChildIndex::default();
        for &child in children {
            let keyed = store
                .stratum(child)
                .constraints
                .iter()
                .find_map(|c| c.equality_key().map(|k| (c.variable.clone(), k)));
            match keyed {
                Some((variable, key)) => index
                    .by_value
                    .entry(variable)
                    .or_default()
                    .entry(key)
                    .or_default()
                    .push(child),
                None => index.scan.push(child),
            }
        }
        index
    }
}

/// What a row looks like to the constraints: its record's attributes, with
/// the geography attribute replaced by the row's assigned fine geography.
struct RowView<'a> {
    record: &'a Record,
    geography: &'a AttrValue,
    geography_attribute: &'a str,
}

impl<'a> RowView<'a> {
    fn get(&self, variable: &str) -> Option<&'a AttrValue> {
        if variable == self.geography_attribute {
            Some(self.geography)
        } else {
            self.record.attr(variable)
        }
    }
}

/// Builds the indicator matrix for the given target columns.
///
/// Each row descends the stratum forest from the roots and only visits the
/// children of strata it belongs to. Equality-constrained children are found
/// through a per-parent hash index.
pub fn build_indicator(
    store: &TargetStore,
    columns: &[usize],
    records: &[Record],
    assignment: &GeographyAssignment,
    geography_attribute: &str,
    chunk_size: usize,
) -> Result<IndicatorMatrix> {
    let chunk_size = chunk_size.max(1);
    let n_strata = store.strata().len();

    // columns attached to each stratum
    let mut stratum_columns: Vec<Vec<(u32, TargetType, &str)>> = vec![Vec::new(); n_strata];
    let mut kinds = Vec::with_capacity(columns.len());
    for (col, &t) in columns.iter().enumerate() {
        let target = store.target(t);
        let s = store.stratum_index(target.stratum_id).ok_or_else(|| {
            CalibrationError::Schema(format!(
                "target {} references missing stratum {}",
                target.id, target.stratum_id
            ))
        })?;
        stratum_columns[s].push((col as u32, target.target_type, target.variable.as_str()));
        kinds.push(target.target_type);
    }

    // subtrees without any column need not be visited
    let mut has_columns = vec![false; n_strata];
    for s in store.top_down().into_iter().rev() {
        let below = store.children(s).iter().any(|&c| has_columns[c]);
        has_columns[s] = below || !stratum_columns[s].is_empty();
    }

    let live = |ids: &[usize]| -> Vec<usize> {
        ids.iter().copied().filter(|&s| has_columns[s]).collect()
    };
    let root_index = ChildIndex::build(store, &live(store.roots()));
    let child_index: Vec<ChildIndex> = (0..n_strata)
        .map(|s| ChildIndex::build(store, &live(store.children(s))))
        .collect();

    let geography_values: Vec<AttrValue> = assignment
        .geographies()
        .iter()
        .map(|g| AttrValue::Text(g.clone()))
        .collect();

    let fragments: Vec<(Vec<usize>, Vec<u32>, Vec<f64>)> = assignment
        .rows()
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut lengths = Vec::with_capacity(chunk.len());
            let mut indices = Vec::new();
            let mut values = Vec::new();
            let mut entries: Vec<(u32, f64)> = Vec::new();
            let mut stack: Vec<usize> = Vec::new();

            for row in chunk {
                let view = RowView {
                    record: &records[row.record_index],
                    geography: &geography_values[row.geography as usize],
                    geography_attribute,
                };
                entries.clear();
                stack.clear();
                push_members(store, &root_index, &view, &mut stack);

                while let Some(s) = stack.pop() {
                    for &(col, kind, variable) in &stratum_columns[s] {
                        let value = match kind {
                            TargetType::Count => 1.0,
                            TargetType::Sum => view
                                .get(variable)
                                .and_then(AttrValue::as_f64)
                                .unwrap_or(0.0),
                        };
                        if value != 0.0 {
                            entries.push((col, value));
                        }
                    }
                    push_members(store, &child_index[s], &view, &mut stack);
                }

                entries.sort_by_key(|(c, _)| *c);
                lengths.push(entries.len());
                for &(c, v) in &entries {
                    indices.push(c);
                    values.push(v);
                }
            }
            (lengths, indices, values)
        })
        .collect();

    let mut indptr = Vec::with_capacity(assignment.len() + 1);
    let mut indices = Vec::new();
    let mut values = Vec::new();
    indptr.push(0);
    for (lengths, frag_indices, frag_values) in fragments {
        let mut offset = indices.len();
        for len in lengths {
            offset += len;
            indptr.push(offset);
        }
        indices.extend(frag_indices);
        values.extend(frag_values);
    }

    let matrix = IndicatorMatrix {
        n_rows: assignment.len(),
        columns: columns.to_vec(),
        kinds,
        indptr,
        indices,
        values,
        chunk_size,
    };

    let empty = matrix.column_support().iter().filter(|&&n| n == 0).count();
    if empty > 0 {
        warn!(columns = empty, "targets with no contributing rows");
    }
    info!(
        rows = matrix.n_rows(),
        columns = matrix.n_cols(),
        nnz = matrix.nnz(),
        "indicator matrix built"
    );

    Ok(matrix)
}

/// Pushes every child in `index` whose constraints the row satisfies.
fn push_members(store: &TargetStore, index: &ChildIndex, view: &RowView<'_>, stack: &mut Vec<usize>) {
    let satisfies = |s: usize| {
        store
            .stratum(s)
            .constraints
            .iter()
            .all(|c| c.matches(view.get(&c.variable)))
    };

    for (variable, by_key) in &index.by_value {
        let Some(value) = view.get(variable) else {
            continue;
        };
        if let Some(candidates) = by_key.get(&value.key()) {
            stack.extend(candidates.iter().copied().filter(|&s| satisfies(s)));
        }
    }
    stack.extend(index.scan.iter().copied().filter(|&s| satisfies(s)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssignmentMode, CalibrationConfig};
    use crate::geography::{assign, Crosswalk};
    use crate::targets::{
        Constraint, Predicate, Stratum, Target, TargetSelection, VariableSchema, VariableType,
    };
    use approx::assert_relative_eq;
    use ndarray::array;

    fn schema() -> VariableSchema {
        VariableSchema::new()
            .with("state_fips", VariableType::Categorical)
            .with("geography_id", VariableType::Categorical)
            .with("agi", VariableType::Numeric)
    }

    fn strata() -> Vec<Stratum> {
        vec![
            Stratum::new(1, None, "national"),
            Stratum::new(2, Some(1), "states").with_constraint(Constraint::new(
                "state_fips",
                Predicate::Equals(AttrValue::from("06")),
            )),
            Stratum::new(3, Some(1), "states").with_constraint(Constraint::new(
                "state_fips",
                Predicate::Equals(AttrValue::from("48")),
            )),
            Stratum::new(4, Some(2), "agi").with_constraint(Constraint::new(
                "agi",
                Predicate::InRange { low: 0.0, high: 50_000.0 },
            )),
            Stratum::new(5, Some(2), "counties").with_constraint(Constraint::new(
                "geography_id",
                Predicate::Equals(AttrValue::from("06075")),
            )),
        ]
    }

    fn records() -> Vec<Record> {
        vec![
            Record::new(1, 1.0, "06").with_attr("state_fips", "06").with_attr("agi", 20_000.0),
            Record::new(2, 1.0, "06").with_attr("state_fips", "06").with_attr("agi", 80_000.0),
            Record::new(3, 1.0, "48").with_attr("state_fips", "48").with_attr("agi", 10_000.0),
            Record::new(4, 1.0, "48"),
        ]
    }

    fn build(targets: Vec<Target>, mode: AssignmentMode) -> IndicatorMatrix {
        let store = TargetStore::new(strata(), targets, &schema()).unwrap();
        let crosswalk = Crosswalk::new(vec![
            ("06", "06037", 0.5),
            ("06", "06075", 0.5),
            ("48", "48201", 1.0),
        ])
        .unwrap();
        let config = CalibrationConfig::new().with_assignment_mode(mode);
        let records = records();
        let assignment = assign(&records, Some(&crosswalk), &config).unwrap();
        let columns = store.selected_targets(&TargetSelection::default());
        build_indicator(&store, &columns, &records, &assignment, "geography_id", 2).unwrap()
    }

    #[test]
    fn test_count_and_sum_columns() {
        let targets = vec![
            Target::count(1, 1, "returns", 4.0),
            Target::count(2, 2, "returns", 2.0),
            Target::sum(3, 3, "agi", 10_000.0),
            Target::count(4, 4, "returns", 1.0),
        ];
        let a = build(targets, AssignmentMode::Sampling);

        let totals = a.estimates(array![1.0, 1.0, 1.0, 1.0].view());
        assert_eq!(totals.to_vec(), vec![4.0, 2.0, 10_000.0, 1.0]);
        assert_eq!(a.row(0).0, &[0, 1, 3]);
        // record 4 has no state, so it only reaches the national stratum
        assert_eq!(a.row(3).0, &[0]);
    }

    #[test]
    fn test_stacked_rows_see_their_geography() {
        let targets = vec![
            Target::count(1, 1, "returns", 4.0),
            Target::count(5, 5, "returns", 1.0),
        ];
        let a = build(targets, AssignmentMode::Stacking);

        // two records in 06 split into 06037 and 06075 rows
        assert_eq!(a.n_rows(), 6);
        assert_eq!(a.column_support(), vec![6, 2]);

        let weights = array![0.5, 0.5, 0.5, 0.5, 1.0, 1.0];
        let totals = a.estimates(weights.view());
        assert_relative_eq!(totals[0], 4.0, epsilon = 1e-12);
        assert_relative_eq!(totals[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_row_products() {
        let rows = vec![vec![(0, 1.0), (1, 2.0)], vec![(1, 3.0)]];
        let a = IndicatorMatrix::from_rows(2, &rows, 1).unwrap();
        let out = a.row_products(array![10.0, 1.0].view());
        assert_eq!(out.to_vec(), vec![12.0, 3.0]);
    }

    #[test]
    fn test_estimates_independent_of_chunking() {
        let rows: Vec<Vec<(usize, f64)>> = (0..1000)
            .map(|i| vec![(i % 3, 1.0 / (i as f64 + 1.0))])
            .collect();
        let weights = Array1::from_iter((0..1000).map(|i| 1.0 + (i % 7) as f64 * 0.1));

        let a = IndicatorMatrix::from_rows(3, &rows, 16).unwrap();
        let first = a.estimates(weights.view());
        let second = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| a.estimates(weights.view()));

        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_reduction_blocks_are_bounded() {
        let rows: Vec<Vec<(usize, f64)>> = (0..10_000).map(|_| vec![(0, 1.0)]).collect();
        let a = IndicatorMatrix::from_rows(1, &rows, 16).unwrap();
        assert!(a.n_rows().div_ceil(a.reduction_block()) <= MAX_PARTIALS);
        assert_eq!(a.estimates(Array1::ones(10_000).view())[0], 10_000.0);

        let small = IndicatorMatrix::from_rows(1, &rows[..100], 16).unwrap();
        assert_eq!(small.reduction_block(), 16);
    }

    #[test]
    fn test_from_rows_rejects_out_of_range_column() {
        let rows = vec![vec![(3, 1.0)]];
        assert!(IndicatorMatrix::from_rows(2, &rows, 4).is_err());
    }
}
