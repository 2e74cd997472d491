//! Clearing stage results so the stage runs again.

use std::collections::HashSet;

use serde::Serialize;

use crate::item::Item;
use crate::stages::{StageGraph, StageKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub stages: Vec<StageKind>,
    pub items_touched: usize,
    pub results_cleared: usize,
    pub handles_cleared: usize,
}

/// Clear `kind` (and with `downstream`, every later stage) on the selected
/// items. Both the primary and the alternate slot go, together with the
/// sessions recorded for them, so a cleared item is ready again.
///
/// `only` restricts the reset to the given item ids.
pub fn reset_stage(
    items: &mut [Item],
    graph: &StageGraph,
    kind: StageKind,
    downstream: bool,
    only: Option<&HashSet<String>>,
) -> ResetReport {
    let stages = if downstream {
        graph.downstream(kind)
    } else {
        vec![kind]
    };

    let mut report = ResetReport {
        stages: stages.clone(),
        ..Default::default()
    };

    for item in items.iter_mut() {
        if only.is_some_and(|ids| !ids.contains(&item.id)) {
            continue;
        }
        let mut touched = false;
        for &stage in &stages {
            let def = graph.definition(stage);
            let mut slots = vec![def.slot(false)];
            if def.alternate.is_some() {
                slots.push(def.slot(true));
            }
            for slot in slots {
                if item.clear_result(slot) {
                    report.results_cleared += 1;
                    touched = true;
                }
                if item.clear_conversation(slot) {
                    report.handles_cleared += 1;
                    touched = true;
                }
            }
        }
        if touched {
            report.items_touched += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ConversationState;
    use crate::stages::{ReadinessPolicy, StageRun};
    use serde_json::json;

    fn analyzed(id: &str) -> Item {
        let mut item = Item::new(id, "t")
            .with_result("morphologic", json!({"tokens": []}))
            .with_result("syntactic", json!({"syntax": {}}))
            .with_result("syntactic_review", json!("ok"))
            .with_result("semantic", json!("meaning"));
        item.set_conversation("syntactic", ConversationState::handle("s1", "m"));
        item.set_conversation("semantic", ConversationState::handle("s2", "m"));
        item
    }

    #[test]
    fn single_stage_reset_makes_item_ready_again() {
        let graph = StageGraph::standard();
        let mut items = vec![analyzed("a")];
        let run = StageRun::primary(StageKind::Syntactic);
        assert!(!graph.is_ready(&items[0], run, ReadinessPolicy::default()));

        let report = reset_stage(&mut items, &graph, StageKind::Syntactic, false, None);
        assert_eq!(report.results_cleared, 2);
        assert_eq!(report.handles_cleared, 1);
        assert!(graph.is_ready(&items[0], run, ReadinessPolicy::default()));
        // Later stages keep their results.
        assert!(items[0].result("semantic").is_some());
        assert!(items[0].handle("semantic").is_some());
    }

    #[test]
    fn downstream_reset_clears_later_stages() {
        let graph = StageGraph::standard();
        let mut items = vec![analyzed("a"), analyzed("b")];
        let only: HashSet<String> = ["b".to_string()].into();

        let report = reset_stage(&mut items, &graph, StageKind::Syntactic, true, Some(&only));
        assert_eq!(report.items_touched, 1);
        assert!(items[0].result("semantic").is_some());
        assert!(items[1].result("semantic").is_none());
        assert!(items[1].handle("semantic").is_none());
        assert!(items[1].result("morphologic").is_some());
    }
}
