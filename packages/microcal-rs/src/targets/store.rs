// src/targets/store.rs

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use tracing::debug;

use super::constraint::{Constraint, VariableSchema, VariableType};
use crate::config::GroupBy;
use crate::error::{CalibrationError, Result};

pub type StratumId = i64;
pub type TargetId = i64;

/// A node in the target hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Stratum {
    pub id: StratumId,
    pub parent_id: Option<StratumId>,
    pub group_id: String,
    pub constraints: Vec<Constraint>,
}

impl Stratum {
    pub fn new(id: StratumId, parent_id: Option<StratumId>, group_id: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            group_id: group_id.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Whether a target counts members or sums a variable over them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TargetType {
    #[default]
    Count,
    Sum,
}

impl TargetType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(TargetType::Count),
            "sum" | "amount" => Ok(TargetType::Sum),
            other => Err(CalibrationError::Schema(format!("unknown target type '{}'", other))),
        }
    }
}

/// An administrative total attached to a stratum.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub id: TargetId,
    pub variable: String,
    pub period: i32,
    pub stratum_id: StratumId,
    pub reform_id: u32,
    pub value: f64,
    pub source_id: String,
    pub tolerance: f64,
    pub active: bool,
    pub target_type: TargetType,
}

impl Target {
    /// An active baseline count target with 5% tolerance.
    pub fn count(id: TargetId, stratum_id: StratumId, variable: impl Into<String>, value: f64) -> Self {
        Self {
            id,
            variable: variable.into(),
            period: 0,
            stratum_id,
            reform_id: 0,
            value,
            source_id: String::new(),
            tolerance: 0.05,
            active: true,
            target_type: TargetType::Count,
        }
    }

    /// An active baseline sum target with 5% tolerance.
    pub fn sum(id: TargetId, stratum_id: StratumId, variable: impl Into<String>, value: f64) -> Self {
        Self {
            target_type: TargetType::Sum,
            ..Self::count(id, stratum_id, variable, value)
        }
    }
}

/// Depth of a stratum in the forest; roots are national.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeographyLevel(pub usize);

impl GeographyLevel {
    pub const NATIONAL: GeographyLevel = GeographyLevel(0);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "national",
            1 => "state",
            2 => "county",
            _ => "local",
        }
    }
}

impl fmt::Display for GeographyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Loss-normalization group of a target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub level: Option<GeographyLevel>,
    pub variable: Option<String>,
}

/// Which targets a run calibrates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSelection {
    pub period: Option<i32>,
    pub reform_id: u32,
}

impl Default for TargetSelection {
    fn default() -> Self {
        Self {
            period: None,
            reform_id: 0,
        }
    }
}

impl TargetSelection {
    pub fn matches(&self, target: &Target) -> bool {
        target.active
            && target.reform_id == self.reform_id
            && self.period.map_or(true, |p| p == target.period)
    }
}

/// Validated stratum forest plus its targets.
///
/// Strata live in an arena; parent and child links are arena indices.
#[derive(Debug, Clone)]
pub struct TargetStore {
    strata: Vec<Stratum>,
    index: HashMap<StratumId, usize>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    levels: Vec<GeographyLevel>,
    roots: Vec<usize>,
    targets: Vec<Target>,
    by_stratum: Vec<Vec<usize>>,
}

impl TargetStore {
    /// Builds the forest and validates strata, constraints and targets.
    pub fn new(strata: Vec<Stratum>, targets: Vec<Target>, schema: &VariableSchema) -> Result<Self> {
        let mut index = HashMap::with_capacity(strata.len());
        for (i, stratum) in strata.iter().enumerate() {
            if index.insert(stratum.id, i).is_some() {
                return Err(CalibrationError::Schema(format!(
                    "duplicate stratum id {}",
                    stratum.id
                )));
            }
            for constraint in &stratum.constraints {
                constraint.validate(schema).map_err(|e| match e {
                    CalibrationError::Schema(msg) => {
                        CalibrationError::Schema(format!("stratum {}: {}", stratum.id, msg))
                    }
                    other => other,
                })?;
            }
        }

        let mut parents = Vec::with_capacity(strata.len());
        for stratum in &strata {
            let parent = match stratum.parent_id {
                None => None,
                Some(pid) => Some(*index.get(&pid).ok_or_else(|| {
                    CalibrationError::Schema(format!(
                        "stratum {} references missing parent {}",
                        stratum.id, pid
                    ))
                })?),
            };
            parents.push(parent);
        }

        check_acyclic(&strata, &parents)?;
        check_unique_definitions(&strata, &parents)?;

        let mut children = vec![Vec::new(); strata.len()];
        let mut roots = Vec::new();
        for (i, parent) in parents.iter().enumerate() {
            match parent {
                Some(p) => children[*p].push(i),
                None => roots.push(i),
            }
        }

        let levels = compute_levels(&parents);

        let mut by_stratum = vec![Vec::new(); strata.len()];
        let mut seen_targets = HashMap::with_capacity(targets.len());
        for (t, target) in targets.iter().enumerate() {
            if seen_targets.insert(target.id, t).is_some() {
                return Err(CalibrationError::Schema(format!(
                    "duplicate target id {}",
                    target.id
                )));
            }
            let s = *index.get(&target.stratum_id).ok_or_else(|| {
                CalibrationError::Schema(format!(
                    "target {} references missing stratum {}",
                    target.id, target.stratum_id
                ))
            })?;
            validate_target(target, schema)?;
            by_stratum[s].push(t);
        }

        debug!(
            strata = strata.len(),
            targets = targets.len(),
            roots = roots.len(),
            "target store loaded"
        );

        Ok(Self {
            strata,
            index,
            parents,
            children,
            levels,
            roots,
            targets,
            by_stratum,
        })
    }

    pub fn strata(&self) -> &[Stratum] {
        &self.strata
    }

    pub fn stratum(&self, idx: usize) -> &Stratum {
        &self.strata[idx]
    }

    pub fn stratum_index(&self, id: StratumId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.parents[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn level(&self, idx: usize) -> GeographyLevel {
        self.levels[idx]
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, t: usize) -> &Target {
        &self.targets[t]
    }

    /// Indices of the targets attached to a stratum.
    pub fn targets_of(&self, idx: usize) -> &[usize] {
        &self.by_stratum[idx]
    }

    pub fn target_level(&self, t: usize) -> GeographyLevel {
        self.levels[self.index[&self.targets[t].stratum_id]]
    }

    /// Strata grouped by geography level, national first.
    pub fn by_level(&self) -> BTreeMap<GeographyLevel, Vec<usize>> {
        let mut tree: BTreeMap<GeographyLevel, Vec<usize>> = BTreeMap::new();
        for (i, level) in self.levels.iter().enumerate() {
            tree.entry(*level).or_default().push(i);
        }
        tree
    }

    /// Breadth-first order from the roots; every parent precedes its children.
    pub fn top_down(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.strata.len());
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        while let Some(s) = queue.pop_front() {
            order.push(s);
            queue.extend(self.children[s].iter().copied());
        }
        order
    }

    /// Indices of the targets taking part in a run, in table order.
    pub fn selected_targets(&self, selection: &TargetSelection) -> Vec<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| selection.matches(t))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn group_key(&self, t: usize, group_by: GroupBy) -> GroupKey {
        let level = self.target_level(t);
        let variable = self.targets[t].variable.clone();
        match group_by {
            GroupBy::GeographyLevel => GroupKey {
                level: Some(level),
                variable: None,
            },
            GroupBy::Variable => GroupKey {
                level: None,
                variable: Some(variable),
            },
            GroupBy::Both => GroupKey {
                level: Some(level),
                variable: Some(variable),
            },
        }
    }

    pub(crate) fn set_target_value(&mut self, t: usize, value: f64) {
        self.targets[t].value = value;
    }
}

fn validate_target(target: &Target, schema: &VariableSchema) -> Result<()> {
    let fail = |msg: String| Err(CalibrationError::Schema(format!("target {}: {}", target.id, msg)));

    if target.variable.is_empty() {
        return fail("empty variable name".to_string());
    }
    if !target.value.is_finite() {
        return fail(format!("non-finite value {}", target.value));
    }
    if !(0.0..=1.0).contains(&target.tolerance) {
        return fail(format!("tolerance {} outside [0, 1]", target.tolerance));
    }
    match target.target_type {
        TargetType::Count if target.value < 0.0 => {
            fail(format!("count target has negative value {}", target.value))
        }
        TargetType::Sum if schema.get(&target.variable) != Some(VariableType::Numeric) => fail(
            format!("sum target over non-numeric variable '{}'", target.variable),
        ),
        _ => Ok(()),
    }
}

/// Depth-first walk up the parent links. Reaching a node that is still on the
/// current path means the chain loops.
fn check_acyclic(strata: &[Stratum], parents: &[Option<usize>]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; strata.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..strata.len() {
        let mut node = Some(start);
        path.clear();

        while let Some(n) = node {
            match marks[n] {
                Mark::Done => break,
                Mark::InProgress => {
                    let first = path.iter().position(|&p| p == n).unwrap_or(0);
                    let mut chain: Vec<StratumId> =
                        path[first..].iter().map(|&p| strata[p].id).collect();
                    chain.push(strata[n].id);
                    return Err(CalibrationError::Cycle(chain));
                }
                Mark::Unvisited => {
                    marks[n] = Mark::InProgress;
                    path.push(n);
                    node = parents[n];
                }
            }
        }

        for &n in &path {
            marks[n] = Mark::Done;
        }
    }
    Ok(())
}

/// Two strata under the same parent with the same constraint set would
/// double-count their targets.
fn check_unique_definitions(strata: &[Stratum], parents: &[Option<usize>]) -> Result<()> {
    let mut seen: HashMap<(Option<usize>, String), StratumId> = HashMap::new();
    for (i, stratum) in strata.iter().enumerate() {
        let mut parts: Vec<String> = stratum.constraints.iter().map(|c| c.canonical()).collect();
        parts.sort();
        let key = (parents[i], parts.join("&"));
        if let Some(other) = seen.insert(key, stratum.id) {
            return Err(CalibrationError::Schema(format!(
                "strata {} and {} have identical definitions",
                other, stratum.id
            )));
        }
    }
    Ok(())
}

fn compute_levels(parents: &[Option<usize>]) -> Vec<GeographyLevel> {
    let mut depth: Vec<Option<usize>> = vec![None; parents.len()];
    let mut chain = Vec::new();

    for start in 0..parents.len() {
        chain.clear();
        let mut node = start;
        let base = loop {
            if let Some(d) = depth[node] {
                break d;
            }
            chain.push(node);
            match parents[node] {
                Some(p) => node = p,
                None => {
                    chain.pop();
                    depth[node] = Some(0);
                    break 0;
                }
            }
        };
        for (offset, &n) in chain.iter().rev().enumerate() {
            depth[n] = Some(base + offset + 1);
        }
    }

    depth
        .into_iter()
        .map(|d| GeographyLevel(d.unwrap_or(0)))
        .collect()
}
