//! Progress summary over a working set.

use serde::Serialize;

use crate::item::Item;
use crate::stages::{ReadinessPolicy, StageGraph, StageKind, StageRun};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub stage: StageKind,
    pub slot: &'static str,
    /// Items holding a real result.
    pub complete: usize,
    /// Items holding an error marker.
    pub errors: usize,
    pub pending: usize,
    /// Pending items whose predecessor is satisfied.
    pub ready: usize,
}

/// One row per result slot, primary before alternate, in stage order.
pub fn stage_status(items: &[Item], graph: &StageGraph, policy: ReadinessPolicy) -> Vec<SlotStatus> {
    let policy = ReadinessPolicy {
        force: false,
        ..policy
    };
    let mut rows = Vec::new();
    for def in graph.stages() {
        let modes: &[bool] = if def.alternate.is_some() {
            &[false, true]
        } else {
            &[false]
        };
        for &alternate in modes {
            let slot = def.slot(alternate);
            let run = StageRun {
                kind: def.kind,
                alternate,
            };
            let mut row = SlotStatus {
                stage: def.kind,
                slot,
                complete: 0,
                errors: 0,
                pending: 0,
                ready: 0,
            };
            for item in items {
                match item.result(slot) {
                    Some(v) if Item::is_error_marker(v) => row.errors += 1,
                    Some(_) => row.complete += 1,
                    None => {
                        row.pending += 1;
                        if graph.is_ready(item, run, policy) {
                            row.ready += 1;
                        }
                    }
                }
            }
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_per_slot() {
        let graph = StageGraph::standard();
        let items = vec![
            Item::new("a", "t").with_result("morphologic", json!({"tokens": []})),
            Item::new("b", "t").with_result("morphologic", json!({"error": "timeout"})),
            Item::new("c", "t"),
        ];
        let rows = stage_status(&items, &graph, ReadinessPolicy::default());

        let morph = rows.iter().find(|r| r.slot == "morphologic").unwrap();
        assert_eq!((morph.complete, morph.errors, morph.pending, morph.ready), (1, 1, 1, 1));

        let syn = rows.iter().find(|r| r.slot == "syntactic").unwrap();
        assert_eq!((syn.pending, syn.ready), (3, 1));

        let lenient = ReadinessPolicy {
            force: false,
            lenient: true,
        };
        let rows = stage_status(&items, &graph, lenient);
        let syn = rows.iter().find(|r| r.slot == "syntactic").unwrap();
        assert_eq!(syn.ready, 2);

        assert_eq!(rows.len(), 8 + 4);
    }
}
