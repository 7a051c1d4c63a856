//! Scatter mapping — decides which positional index combinations of a
//! scattered node's input values are complete and not yet materialized.
//!
//! A mapping tracks, per scattered port, a sparse 1-based position array of
//! arrived values. [`ScatterMapping::enabled_rows`] emits every complete,
//! not-yet-committed combination as a [`RowMapping`];
//! [`ScatterMapping::commit`] marks those combinations enabled so they are
//! never emitted again. [`ScatterMapping::row_count`] reports all
//! combinations ever discovered, which fixes the gather cardinality.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use dag::{DagNode, ScatterMethod};

/// One runnable combination: the 1-based row position plus one value per
/// scattered port.
#[derive(Debug, Clone)]
pub struct RowMapping {
    pub position: u32,
    pub values: Vec<(String, Value)>,
}

impl RowMapping {
    /// Value delivered for `port` in this row, if the port participates.
    pub fn value(&self, port: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(id, _)| id == port)
            .map(|(_, v)| v)
    }
}

/// Combination discovery for one scattered node.
pub trait ScatterMapping: Send {
    /// Record that `value` arrived for `port` at 1-based `position`. The
    /// sparse array auto-expands; intermediate positions stay absent.
    /// A duplicate enable at a filled position overwrites (last write wins).
    fn enable(&mut self, port: &str, value: Value, position: u32);

    /// Mark the mapping complete: no further values will arrive on any
    /// port. Cross-product mappings defer all row discovery until sealed,
    /// since row ordering depends on the final dimensions.
    fn seal(&mut self) {}

    /// Every complete combination not yet committed, in ascending position
    /// order. Calling this twice without a commit re-emits the same rows.
    fn enabled_rows(&mut self) -> Vec<RowMapping>;

    /// Mark the given rows enabled so they are never re-emitted.
    fn commit(&mut self, rows: &[RowMapping]);

    /// Total combinations ever discovered, enabled or not.
    fn row_count(&self) -> usize;

    /// Per-port dimensions once sealed; `None` for dot-product mappings,
    /// where the single shared dimension is `row_count`.
    fn dims(&self) -> Option<Vec<usize>> {
        None
    }
}

/// Build the mapping matching a node's scatter method. An absent method
/// with scattered ports falls back to dot-product.
pub fn mapping_for(node: &DagNode) -> Box<dyn ScatterMapping> {
    let ports: Vec<String> = node.scattered_inputs().map(|p| p.id.clone()).collect();
    match node.scatter_method {
        None | Some(ScatterMethod::DotProduct) => Box::new(OneToOneMapping::new(ports)),
        Some(ScatterMethod::FlatCrossProduct) | Some(ScatterMethod::NestedCrossProduct) => {
            Box::new(CartesianMapping::new(ports))
        }
    }
}

// ---------------------------------------------------------------------------
// Combination ledger
// ---------------------------------------------------------------------------

/// Records whether the combination at a linear position has already been
/// committed as a runnable row.
#[derive(Debug)]
struct Combination {
    position: u32,
    enabled: bool,
}

// ---------------------------------------------------------------------------
// Dot-product (one-to-one) mapping
// ---------------------------------------------------------------------------

/// One instance per shared index: combination `i` requires a value at
/// position `i` on every scattered port. The scan walks positions in
/// ascending order and stops at the first position where some port has no
/// value yet — gaps are not skipped, they defer higher positions to a
/// future call.
pub struct OneToOneMapping {
    /// Scattered port ids in declaration order.
    ports: Vec<String>,
    /// Sparse value array per port; `None` marks an absent slot.
    values: HashMap<String, Vec<Option<Value>>>,
    combinations: Vec<Combination>,
}

impl OneToOneMapping {
    pub fn new(ports: Vec<String>) -> Self {
        let values = ports.iter().map(|p| (p.clone(), Vec::new())).collect();
        Self {
            ports,
            values,
            combinations: Vec::new(),
        }
    }

    fn slot_filled(&self, port: &str, index: usize) -> bool {
        self.values
            .get(port)
            .map(|v| matches!(v.get(index), Some(Some(_))))
            .unwrap_or(false)
    }
}

impl ScatterMapping for OneToOneMapping {
    fn enable(&mut self, port: &str, value: Value, position: u32) {
        if position == 0 {
            warn!(port, "scatter positions are 1-based; ignoring position 0");
            return;
        }
        let Some(slots) = self.values.get_mut(port) else {
            warn!(port, "enable() on a port that is not scattered; ignoring");
            return;
        };
        let index = (position - 1) as usize;
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        if slots[index].is_some() {
            // Duplicate delivery: keep overwrite semantics, but make the
            // protocol violation observable.
            warn!(port, position, "duplicate scatter value; overwriting");
        }
        slots[index] = Some(value);
    }

    fn enabled_rows(&mut self) -> Vec<RowMapping> {
        let mut result = Vec::new();
        let first_len = self
            .ports
            .first()
            .and_then(|p| self.values.get(p))
            .map(|v| v.len())
            .unwrap_or(0);

        for i in 0..first_len {
            let complete = self.ports.iter().all(|p| self.slot_filled(p, i));
            if !complete {
                break;
            }
            let position = (i + 1) as u32;
            if !self.combinations.iter().any(|c| c.position == position) {
                self.combinations.push(Combination {
                    position,
                    enabled: false,
                });
            }
            let enabled = self
                .combinations
                .iter()
                .find(|c| c.position == position)
                .map(|c| c.enabled)
                .unwrap_or(false);
            if enabled {
                continue;
            }
            let values = self
                .ports
                .iter()
                .map(|p| {
                    let value = self.values[p][i].clone().unwrap_or(Value::Null);
                    (p.clone(), value)
                })
                .collect();
            result.push(RowMapping { position, values });
        }
        result
    }

    fn commit(&mut self, rows: &[RowMapping]) {
        for row in rows {
            if let Some(c) = self
                .combinations
                .iter_mut()
                .find(|c| c.position == row.position)
            {
                c.enabled = true;
            }
        }
    }

    fn row_count(&self) -> usize {
        self.combinations.len()
    }
}

// ---------------------------------------------------------------------------
// Cross-product (cartesian) mapping
// ---------------------------------------------------------------------------

/// One instance per Cartesian element across independently indexed ports.
///
/// Rows are enumerated row-major over port declaration order (the last
/// declared port varies fastest) and given 1-based linear positions. Because
/// linear positions depend on every port's final dimension, discovery waits
/// until the mapping is sealed; the ordering is then stable and
/// deterministic, which fixes the gather order.
pub struct CartesianMapping {
    ports: Vec<String>,
    values: HashMap<String, Vec<Option<Value>>>,
    sealed: bool,
    /// Gap-free per-port lengths, fixed at seal time.
    dims: Vec<usize>,
    combinations: Vec<Combination>,
}

impl CartesianMapping {
    pub fn new(ports: Vec<String>) -> Self {
        let values = ports.iter().map(|p| (p.clone(), Vec::new())).collect();
        Self {
            ports,
            values,
            sealed: false,
            dims: Vec::new(),
            combinations: Vec::new(),
        }
    }

    /// Leading run of filled slots for one port.
    fn prefix_len(&self, port: &str) -> usize {
        self.values
            .get(port)
            .map(|slots| slots.iter().take_while(|s| s.is_some()).count())
            .unwrap_or(0)
    }

    /// Index tuple (0-based) of the row at 0-based linear index `row`.
    fn tuple_of(&self, mut row: usize) -> Vec<usize> {
        let mut tuple = vec![0; self.dims.len()];
        for axis in (0..self.dims.len()).rev() {
            tuple[axis] = row % self.dims[axis];
            row /= self.dims[axis];
        }
        tuple
    }
}

impl ScatterMapping for CartesianMapping {
    fn enable(&mut self, port: &str, value: Value, position: u32) {
        if position == 0 {
            warn!(port, "scatter positions are 1-based; ignoring position 0");
            return;
        }
        let Some(slots) = self.values.get_mut(port) else {
            warn!(port, "enable() on a port that is not scattered; ignoring");
            return;
        };
        let index = (position - 1) as usize;
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        if slots[index].is_some() {
            warn!(port, position, "duplicate scatter value; overwriting");
        }
        slots[index] = Some(value);
    }

    fn seal(&mut self) {
        if self.sealed {
            return;
        }
        self.dims = self.ports.iter().map(|p| self.prefix_len(p)).collect();
        self.sealed = true;

        let total: usize = self.dims.iter().product();
        for row in 0..total {
            self.combinations.push(Combination {
                position: (row + 1) as u32,
                enabled: false,
            });
        }
    }

    fn enabled_rows(&mut self) -> Vec<RowMapping> {
        if !self.sealed {
            return Vec::new();
        }
        let mut result = Vec::new();
        for c in &self.combinations {
            if c.enabled {
                continue;
            }
            let tuple = self.tuple_of((c.position - 1) as usize);
            let values = self
                .ports
                .iter()
                .zip(&tuple)
                .map(|(p, &i)| (p.clone(), self.values[p][i].clone().unwrap_or(Value::Null)))
                .collect();
            result.push(RowMapping {
                position: c.position,
                values,
            });
        }
        result
    }

    fn commit(&mut self, rows: &[RowMapping]) {
        for row in rows {
            if let Some(c) = self
                .combinations
                .iter_mut()
                .find(|c| c.position == row.position)
            {
                c.enabled = true;
            }
        }
    }

    fn row_count(&self) -> usize {
        self.combinations.len()
    }

    fn dims(&self) -> Option<Vec<usize>> {
        self.sealed.then(|| self.dims.clone())
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_to_one(ports: &[&str]) -> OneToOneMapping {
        OneToOneMapping::new(ports.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn dot_product_emits_one_row_per_matching_index() {
        let mut m = one_to_one(&["a", "b"]);
        for i in 1..=3u32 {
            m.enable("a", json!(format!("a{i}")), i);
            m.enable("b", json!(format!("b{i}")), i);
        }

        let rows = m.enabled_rows();
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            let position = (i + 1) as u32;
            assert_eq!(row.position, position);
            assert_eq!(row.value("a"), Some(&json!(format!("a{position}"))));
            assert_eq!(row.value("b"), Some(&json!(format!("b{position}"))));
        }
        assert_eq!(m.row_count(), 3);
    }

    #[test]
    fn committed_rows_are_never_re_emitted() {
        let mut m = one_to_one(&["a"]);
        m.enable("a", json!(1), 1);
        let rows = m.enabled_rows();
        assert_eq!(rows.len(), 1);
        m.commit(&rows);
        assert!(m.enabled_rows().is_empty());

        // New arrivals surface, old ones stay committed.
        m.enable("a", json!(2), 2);
        let rows = m.enabled_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].position, 2);
        assert_eq!(m.row_count(), 2);
    }

    #[test]
    fn uncommitted_rows_are_re_emitted() {
        let mut m = one_to_one(&["a"]);
        m.enable("a", json!(1), 1);
        assert_eq!(m.enabled_rows().len(), 1);
        assert_eq!(m.enabled_rows().len(), 1);
    }

    #[test]
    fn scan_stops_at_first_gap() {
        let mut m = one_to_one(&["a", "b"]);
        m.enable("a", json!("a1"), 1);
        m.enable("a", json!("a2"), 2);
        m.enable("a", json!("a3"), 3);
        m.enable("b", json!("b1"), 1);
        m.enable("b", json!("b3"), 3); // position 2 missing

        let rows = m.enabled_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].position, 1);

        // Filling the gap releases both deferred positions.
        m.enable("b", json!("b2"), 2);
        let rows = m.enabled_rows();
        assert_eq!(rows.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn sparse_high_position_leaves_lower_positions_absent() {
        let mut m = one_to_one(&["a"]);
        m.enable("a", json!("late"), 5);
        assert!(m.enabled_rows().is_empty());
        assert_eq!(m.row_count(), 0);

        for i in 1..=4u32 {
            m.enable("a", json!(i), i);
        }
        assert_eq!(m.enabled_rows().len(), 5);
    }

    #[test]
    fn position_zero_is_ignored() {
        let mut m = one_to_one(&["a"]);
        m.enable("a", json!("bad"), 0);
        assert!(m.enabled_rows().is_empty());
        assert_eq!(m.row_count(), 0);

        let mut c = CartesianMapping::new(vec!["a".into()]);
        c.enable("a", json!("bad"), 0);
        c.seal();
        assert!(c.enabled_rows().is_empty());
        assert_eq!(c.row_count(), 0);
    }

    #[test]
    fn duplicate_enable_overwrites() {
        let mut m = one_to_one(&["a"]);
        m.enable("a", json!("first"), 1);
        m.enable("a", json!("second"), 1);
        let rows = m.enabled_rows();
        assert_eq!(rows[0].value("a"), Some(&json!("second")));
    }

    #[test]
    fn cartesian_rows_are_row_major_over_declaration_order() {
        let mut m = CartesianMapping::new(vec!["a".into(), "b".into()]);
        m.enable("a", json!("a1"), 1);
        m.enable("a", json!("a2"), 2);
        m.enable("b", json!("b1"), 1);
        m.enable("b", json!("b2"), 2);
        m.enable("b", json!("b3"), 3);

        // Nothing before seal: linear positions depend on final dimensions.
        assert!(m.enabled_rows().is_empty());
        m.seal();

        let rows = m.enabled_rows();
        assert_eq!(rows.len(), 6);
        assert_eq!(m.dims(), Some(vec![2, 3]));

        // Last declared port varies fastest.
        let pairs: Vec<(String, String)> = rows
            .iter()
            .map(|r| {
                (
                    r.value("a").unwrap().as_str().unwrap().to_owned(),
                    r.value("b").unwrap().as_str().unwrap().to_owned(),
                )
            })
            .collect();
        assert_eq!(pairs[0], ("a1".into(), "b1".into()));
        assert_eq!(pairs[1], ("a1".into(), "b2".into()));
        assert_eq!(pairs[2], ("a1".into(), "b3".into()));
        assert_eq!(pairs[3], ("a2".into(), "b1".into()));
        assert_eq!(pairs[5], ("a2".into(), "b3".into()));
    }

    #[test]
    fn cartesian_commit_is_per_row() {
        let mut m = CartesianMapping::new(vec!["a".into()]);
        m.enable("a", json!(1), 1);
        m.enable("a", json!(2), 2);
        m.seal();

        let rows = m.enabled_rows();
        assert_eq!(rows.len(), 2);
        m.commit(&rows[..1]);
        let rest = m.enabled_rows();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].position, 2);
        assert_eq!(m.row_count(), 2);
    }
}
