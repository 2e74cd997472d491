//! Choosing between continuing a stored session and starting a fresh one.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::item::{ConversationHandle, ConversationState, Item};
use crate::prompts::StagePrompt;
use crate::stages::{StageDefinition, StageRun};

/// How a stage call reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Continue the session held in `handle`, sending only the increment.
    Chained { handle: ConversationHandle },
    /// Start a new conversation with the full context.
    Fresh,
}

impl ExecutionMode {
    pub fn label(&self) -> ModeLabel {
        match self {
            Self::Chained { .. } => ModeLabel::Chained,
            Self::Fresh => ModeLabel::Fresh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeLabel {
    Chained,
    Fresh,
}

/// A decided call: mode plus the exact input to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPlan {
    pub mode: ExecutionMode,
    pub input: String,
    /// Fresh-mode input kept for a fallback, present only when chained.
    pub fallback_input: Option<String>,
}

impl ConversationPlan {
    pub fn is_chained(&self) -> bool {
        matches!(self.mode, ExecutionMode::Chained { .. })
    }

    /// Resource the call is pinned to, if any.
    pub fn pinned_resource(&self) -> Option<&str> {
        match &self.mode {
            ExecutionMode::Chained { handle } => Some(handle.resource.as_str()),
            ExecutionMode::Fresh => None,
        }
    }

    pub fn session(&self) -> Option<&str> {
        match &self.mode {
            ExecutionMode::Chained { handle } => Some(handle.session.as_str()),
            ExecutionMode::Fresh => None,
        }
    }
}

/// Per-run view of the configured resources and the system message.
#[derive(Debug, Clone)]
pub struct ConversationManager {
    resources: BTreeSet<String>,
    system_message: Option<String>,
}

impl ConversationManager {
    pub fn new<I, S>(resources: I, system_message: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
            system_message: system_message.filter(|m| !m.trim().is_empty()),
        }
    }

    pub fn knows(&self, resource: &str) -> bool {
        self.resources.contains(resource)
    }

    /// Fresh input: system message, blank line, prompt.
    pub fn fresh_input(&self, prompt: &str) -> String {
        match &self.system_message {
            Some(sys) => format!("{sys}\n\n{prompt}"),
            None => prompt.to_string(),
        }
    }

    /// Decide the execution mode for `item` under `run`.
    ///
    /// A handle bound to a resource outside the configured set is removed from
    /// the item and never used. Returns `None` when the prompt builder offered
    /// nothing usable for either mode.
    pub fn plan(
        &self,
        item: &mut Item,
        def: &StageDefinition,
        run: StageRun,
        prompt: &StagePrompt,
    ) -> Option<ConversationPlan> {
        let handle = def
            .chain_source(run.alternate)
            .and_then(|src| self.trusted_handle(item, src.as_str()));

        let fallback_input = prompt.full.as_deref().map(|full| self.fresh_input(full));

        if let (Some(handle), Some(chained)) = (handle, prompt.chained.as_deref()) {
            return Some(ConversationPlan {
                mode: ExecutionMode::Chained { handle },
                input: chained.to_string(),
                fallback_input,
            });
        }

        fallback_input.map(|input| ConversationPlan {
            mode: ExecutionMode::Fresh,
            input,
            fallback_input: None,
        })
    }

    fn trusted_handle(&self, item: &mut Item, stage: &str) -> Option<ConversationHandle> {
        let handle = item.handle(stage)?.clone();
        if self.knows(&handle.resource) {
            return Some(handle);
        }
        debug!(
            item = %item.id,
            stage,
            resource = %handle.resource,
            "discarding session bound to unknown resource"
        );
        item.set_conversation(stage, ConversationState::None);
        None
    }

    /// Replace a rejected chained plan with its fresh equivalent.
    ///
    /// The rejected handle is dropped from the item. Returns `None` when the
    /// plan was not chained or no fresh input exists.
    pub fn demote(
        &self,
        item: &mut Item,
        def: &StageDefinition,
        run: StageRun,
        plan: &ConversationPlan,
    ) -> Option<ConversationPlan> {
        if !plan.is_chained() {
            return None;
        }
        if let Some(src) = def.chain_source(run.alternate) {
            item.set_conversation(src.as_str(), ConversationState::None);
        }
        plan.fallback_input.clone().map(|input| ConversationPlan {
            mode: ExecutionMode::Fresh,
            input,
            fallback_input: None,
        })
    }

    /// Store the session returned by a successful call. A missing id stores
    /// `None`, which forces fresh mode downstream.
    pub fn record(
        &self,
        item: &mut Item,
        def: &StageDefinition,
        run: StageRun,
        response_id: Option<&str>,
        resource: &str,
    ) {
        let state = match response_id {
            Some(id) if !id.is_empty() => ConversationState::handle(id, resource),
            _ => ConversationState::None,
        };
        item.set_conversation(def.slot(run.alternate), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{StageGraph, StageKind};
    use serde_json::json;

    fn manager() -> ConversationManager {
        ConversationManager::new(["model-a", "model-b"], Some("SYS".to_string()))
    }

    fn prompt() -> StagePrompt {
        StagePrompt {
            full: Some("FULL".into()),
            chained: Some("NEXT".into()),
        }
    }

    fn syntactic_item(resource: &str) -> Item {
        let mut item = Item::new("v1", "text").with_result("morphologic", json!({"tokens": []}));
        item.set_conversation("morphologic", ConversationState::handle("resp_1", resource));
        item
    }

    #[test]
    fn known_handle_chains() {
        let graph = StageGraph::standard();
        let def = graph.definition(StageKind::Syntactic);
        let mut item = syntactic_item("model-b");

        let plan = manager()
            .plan(&mut item, def, StageRun::primary(StageKind::Syntactic), &prompt())
            .unwrap();
        assert!(plan.is_chained());
        assert_eq!(plan.input, "NEXT");
        assert_eq!(plan.pinned_resource(), Some("model-b"));
        assert_eq!(plan.session(), Some("resp_1"));
        assert_eq!(plan.fallback_input.as_deref(), Some("SYS\n\nFULL"));
    }

    #[test]
    fn unknown_resource_forces_fresh_and_drops_handle() {
        let graph = StageGraph::standard();
        let def = graph.definition(StageKind::Syntactic);
        let mut item = syntactic_item("decommissioned");

        let plan = manager()
            .plan(&mut item, def, StageRun::primary(StageKind::Syntactic), &prompt())
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Fresh);
        assert_eq!(plan.input, "SYS\n\nFULL");
        assert!(plan.session().is_none());
        assert_eq!(item.conversations["morphologic"], ConversationState::None);
    }

    #[test]
    fn stages_without_chain_source_are_fresh() {
        let graph = StageGraph::standard();
        let mut item = syntactic_item("model-a");
        let def = graph.definition(StageKind::Morphologic);
        let plan = manager()
            .plan(&mut item, def, StageRun::primary(StageKind::Morphologic), &prompt())
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Fresh);

        // Translation drafts never chain even with a semantic session present.
        item.set_conversation("semantic", ConversationState::handle("s", "model-a"));
        let def = graph.definition(StageKind::Translation);
        let plan = manager()
            .plan(&mut item, def, StageRun::alternate(StageKind::Translation), &prompt())
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Fresh);
    }

    #[test]
    fn chain_without_incremental_prompt_uses_full() {
        let graph = StageGraph::standard();
        let def = graph.definition(StageKind::Syntactic);
        let mut item = syntactic_item("model-a");
        let only_full = StagePrompt {
            full: Some("FULL".into()),
            chained: None,
        };
        let plan = manager()
            .plan(&mut item, def, StageRun::primary(StageKind::Syntactic), &only_full)
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Fresh);

        let nothing = StagePrompt::default();
        assert!(manager()
            .plan(&mut item, def, StageRun::primary(StageKind::Syntactic), &nothing)
            .is_none());
    }

    #[test]
    fn demote_drops_handle_and_returns_fresh_plan() {
        let graph = StageGraph::standard();
        let def = graph.definition(StageKind::Syntactic);
        let run = StageRun::primary(StageKind::Syntactic);
        let mut item = syntactic_item("model-a");
        let mgr = manager();

        let plan = mgr.plan(&mut item, def, run, &prompt()).unwrap();
        let fresh = mgr.demote(&mut item, def, run, &plan).unwrap();
        assert_eq!(fresh.mode, ExecutionMode::Fresh);
        assert_eq!(fresh.input, "SYS\n\nFULL");
        assert!(item.handle("morphologic").is_none());
        assert!(mgr.demote(&mut item, def, run, &fresh).is_none());
    }

    #[test]
    fn record_writes_handle_or_none() {
        let graph = StageGraph::standard();
        let def = graph.definition(StageKind::Syntactic);
        let run = StageRun::primary(StageKind::Syntactic);
        let mut item = Item::new("v1", "");
        let mgr = manager();

        mgr.record(&mut item, def, run, Some("resp_9"), "model-a");
        assert_eq!(
            item.handle("syntactic").map(|h| h.session.as_str()),
            Some("resp_9")
        );

        mgr.record(&mut item, def, run, None, "model-a");
        assert_eq!(item.conversations["syntactic"], ConversationState::None);
    }

    #[test]
    fn empty_system_message_is_ignored() {
        let mgr = ConversationManager::new(["m"], Some("  ".into()));
        assert_eq!(mgr.fresh_input("P"), "P");
    }
}
