//! Prompt-builder boundary.
//!
//! The orchestrator never looks inside prompts. It asks a [`PromptBuilder`] for
//! the full-context prompt and the incremental (chained) prompt of a stage and
//! picks one per the conversation plan.

use crate::item::Item;
use crate::stages::{OutputKind, StageDefinition, StageKind, StageRun};

/// Prompt variants for one stage call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePrompt {
    /// Self-contained prompt for a new conversation.
    pub full: Option<String>,
    /// Increment sent when continuing the predecessor's session.
    pub chained: Option<String>,
}

/// Source of stage prompts.
pub trait PromptBuilder: Send + Sync {
    /// `None` skips the item for this run.
    fn build(&self, item: &Item, def: &StageDefinition, run: StageRun) -> Option<StagePrompt>;
}

impl<F> PromptBuilder for F
where
    F: Fn(&Item, &StageDefinition, StageRun) -> Option<StagePrompt> + Send + Sync,
{
    fn build(&self, item: &Item, def: &StageDefinition, run: StageRun) -> Option<StagePrompt> {
        self(item, def, run)
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Default builder
// =============================================================================

/// Generic builder: the item text and the results the stage depends on,
/// wrapped in tags, followed by a short task line.
#[derive(Debug, Clone, Default)]
pub struct JsonContextPrompts;

fn task_line(kind: StageKind, alternate: bool) -> &'static str {
    match (kind, alternate) {
        (StageKind::Graphematic, false) => {
            "Normalize the text. Return JSON with a \"graphematic_string\" field."
        }
        (StageKind::Morphologic, false) => {
            "Analyze every word. Return JSON with a \"tokens\" array."
        }
        (StageKind::Syntactic, false) => {
            "Analyze the sentence structure. Return JSON with a \"syntax\" object."
        }
        (StageKind::Semantic, _) => "Explain the meaning of the text in prose.",
        (StageKind::Translation, false) => {
            "Propose translations. Return JSON with a \"translation_space\" object."
        }
        (StageKind::Translation, true) => "Write a draft translation in prose.",
        (StageKind::Entities, _) => {
            "List people, places and objects. Return JSON with an \"entities\" array."
        }
        (StageKind::Websearch, _) => "Summarize background knowledge on the listed entities.",
        (StageKind::AssetCards, _) => {
            "Describe each entity visually. Return JSON with an \"asset_cards\" array."
        }
        (_, true) => "Review the previous analysis and point out mistakes in prose.",
    }
}

impl JsonContextPrompts {
    fn context_stages(def: &StageDefinition) -> Vec<StageKind> {
        let mut stages: Vec<StageKind> = def.predecessor.into_iter().collect();
        if let Some(src) = def.chain_from {
            if !stages.contains(&src) {
                stages.push(src);
            }
        }
        stages
    }

    fn output_hint(def: &StageDefinition, run: StageRun) -> &'static str {
        match def.output_for(run.alternate).kind {
            OutputKind::Structured => "Answer with JSON only.",
            OutputKind::FreeText => "Answer in plain text.",
        }
    }
}

impl PromptBuilder for JsonContextPrompts {
    fn build(&self, item: &Item, def: &StageDefinition, run: StageRun) -> Option<StagePrompt> {
        if item.text.trim().is_empty() {
            return None;
        }

        let task = task_line(run.kind, run.alternate);
        let hint = Self::output_hint(def, run);

        let mut full = format!(
            "<item id=\"{}\">\n{}\n</item>\n",
            escape_xml_chars(&item.id),
            escape_xml_chars(&item.text)
        );
        for stage in Self::context_stages(def) {
            if let Some(result) = item.result(stage.as_str()) {
                let body = match result {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                full.push_str(&format!(
                    "<{stage}>\n{}\n</{stage}>\n",
                    escape_xml_chars(&body)
                ));
            }
        }
        full.push_str(&format!("\n{task} {hint}"));

        let chained = def
            .chain_source(run.alternate)
            .map(|_| format!("Continue with the same text. {task} {hint}"));

        Some(StagePrompt {
            full: Some(full),
            chained,
        })
    }
}
