//! Stage graph and readiness evaluation.
//!
//! The graph is fixed: every stage, its predecessor, the stage whose session
//! it continues, and how its output is parsed live in one dispatch table built
//! by [`StageGraph::standard`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::item::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Graphematic,
    Morphologic,
    Syntactic,
    Semantic,
    Translation,
    Entities,
    Websearch,
    AssetCards,
}

impl StageKind {
    pub const ALL: [StageKind; 8] = [
        StageKind::Graphematic,
        StageKind::Morphologic,
        StageKind::Syntactic,
        StageKind::Semantic,
        StageKind::Translation,
        StageKind::Entities,
        StageKind::Websearch,
        StageKind::AssetCards,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graphematic => "graphematic",
            Self::Morphologic => "morphologic",
            Self::Syntactic => "syntactic",
            Self::Semantic => "semantic",
            Self::Translation => "translation",
            Self::Entities => "entities",
            Self::Websearch => "websearch",
            Self::AssetCards => "asset_cards",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_lowercase().replace('-', "_");
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == norm)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// How a stage's raw output becomes a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Decoded and validated as JSON.
    Structured,
    /// Stored verbatim.
    FreeText,
}

/// Validation applied to structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub kind: OutputKind,
    /// Wrapper key that is stripped when present.
    pub unwrap_key: Option<&'static str>,
    /// Keys the decoded object must carry.
    pub required_keys: &'static [&'static str],
}

impl OutputSpec {
    pub const fn free_text() -> Self {
        Self {
            kind: OutputKind::FreeText,
            unwrap_key: None,
            required_keys: &[],
        }
    }

    pub const fn structured(required_keys: &'static [&'static str]) -> Self {
        Self {
            kind: OutputKind::Structured,
            unwrap_key: None,
            required_keys,
        }
    }

    pub const fn unwrapping(self, key: &'static str) -> Self {
        Self {
            unwrap_key: Some(key),
            ..self
        }
    }
}

/// Secondary execution mode writing to its own slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlternateMode {
    pub slot: &'static str,
    pub output: OutputSpec,
    /// Budget cap key for this mode.
    pub cap_key: &'static str,
    /// Whether this mode may continue the chain stage's session.
    pub chains: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefinition {
    pub kind: StageKind,
    /// Stage whose result must be present first.
    pub predecessor: Option<StageKind>,
    /// Stage whose session this one continues.
    pub chain_from: Option<StageKind>,
    pub output: OutputSpec,
    pub alternate: Option<AlternateMode>,
}

impl StageDefinition {
    pub fn slot(&self, alternate: bool) -> &'static str {
        match (alternate, self.alternate) {
            (true, Some(alt)) => alt.slot,
            _ => self.kind.as_str(),
        }
    }

    pub fn output_for(&self, alternate: bool) -> OutputSpec {
        match (alternate, self.alternate) {
            (true, Some(alt)) => alt.output,
            _ => self.output,
        }
    }

    pub fn cap_key(&self, alternate: bool) -> &'static str {
        match (alternate, self.alternate) {
            (true, Some(alt)) => alt.cap_key,
            _ => self.kind.as_str(),
        }
    }

    /// Stage whose session `run` may continue, if chaining is allowed.
    pub fn chain_source(&self, alternate: bool) -> Option<StageKind> {
        match (alternate, self.alternate) {
            (true, Some(alt)) if !alt.chains => None,
            _ => self.chain_from,
        }
    }
}

/// A stage selection: the primary mode or the alternate one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageRun {
    pub kind: StageKind,
    pub alternate: bool,
}

impl StageRun {
    pub fn primary(kind: StageKind) -> Self {
        Self {
            kind,
            alternate: false,
        }
    }

    pub fn alternate(kind: StageKind) -> Self {
        Self {
            kind,
            alternate: true,
        }
    }
}

/// Readiness knobs applied uniformly to every stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Re-run items whose slot is already filled.
    pub force: bool,
    /// Accept a predecessor result that is an error marker.
    pub lenient: bool,
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageDefinition>,
}

const REVIEW_CAP: &str = "review";

const fn review(slot: &'static str) -> Option<AlternateMode> {
    Some(AlternateMode {
        slot,
        output: OutputSpec::free_text(),
        cap_key: REVIEW_CAP,
        chains: true,
    })
}

impl StageGraph {
    /// The fixed stage table.
    pub fn standard() -> Self {
        use StageKind::*;

        let stages = vec![
            StageDefinition {
                kind: Graphematic,
                predecessor: None,
                chain_from: None,
                output: OutputSpec::structured(&["graphematic_string"])
                    .unwrapping("graphematic_analysis"),
                alternate: review("graphematic_review"),
            },
            StageDefinition {
                kind: Morphologic,
                predecessor: None,
                chain_from: None,
                output: OutputSpec::structured(&["tokens"]),
                alternate: review("morphologic_review"),
            },
            StageDefinition {
                kind: Syntactic,
                predecessor: Some(Morphologic),
                chain_from: Some(Morphologic),
                output: OutputSpec::structured(&["syntax"]),
                alternate: review("syntactic_review"),
            },
            StageDefinition {
                kind: Semantic,
                predecessor: Some(Syntactic),
                chain_from: Some(Syntactic),
                output: OutputSpec::free_text(),
                alternate: None,
            },
            StageDefinition {
                kind: Translation,
                predecessor: Some(Syntactic),
                chain_from: Some(Semantic),
                output: OutputSpec::structured(&["translation_space"]),
                alternate: Some(AlternateMode {
                    slot: "translation_draft",
                    output: OutputSpec::free_text(),
                    cap_key: "translation_draft",
                    chains: false,
                }),
            },
            StageDefinition {
                kind: Entities,
                predecessor: Some(Semantic),
                chain_from: None,
                output: OutputSpec::structured(&["entities"]),
                alternate: None,
            },
            StageDefinition {
                kind: Websearch,
                predecessor: Some(Entities),
                chain_from: None,
                output: OutputSpec::free_text(),
                alternate: None,
            },
            StageDefinition {
                kind: AssetCards,
                predecessor: Some(Entities),
                chain_from: None,
                output: OutputSpec::structured(&["asset_cards"]),
                alternate: None,
            },
        ];
        Self { stages }
    }

    pub fn definition(&self, kind: StageKind) -> &StageDefinition {
        // The table holds every kind; `ALL` and the table share one order.
        &self.stages[kind as usize]
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Every result slot the table writes, primary and alternate.
    pub fn slots(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stages
            .iter()
            .flat_map(|d| std::iter::once(d.kind.as_str()).chain(d.alternate.map(|a| a.slot)))
    }

    /// The stage and every stage declared after it.
    pub fn downstream(&self, kind: StageKind) -> Vec<StageKind> {
        self.stages
            .iter()
            .map(|d| d.kind)
            .skip_while(|k| *k != kind)
            .collect()
    }

    /// Whether `item` may be processed by `run` right now.
    pub fn is_ready(&self, item: &Item, run: StageRun, policy: ReadinessPolicy) -> bool {
        let def = self.definition(run.kind);

        if let Some(pred) = def.predecessor {
            match item.result(pred.as_str()) {
                None => return false,
                Some(v) if Item::is_error_marker(v) && !policy.lenient => return false,
                Some(_) => {}
            }
        }

        policy.force || item.is_pending(def.slot(run.alternate))
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_order_matches_kind_order() {
        let graph = StageGraph::standard();
        for kind in StageKind::ALL {
            assert_eq!(graph.definition(kind).kind, kind);
        }
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("asset-cards".parse::<StageKind>().unwrap(), StageKind::AssetCards);
        assert_eq!(" Syntactic ".parse::<StageKind>().unwrap(), StageKind::Syntactic);
        assert!("phonetic".parse::<StageKind>().is_err());
    }

    #[test]
    fn predecessor_gates_readiness_for_any_id() {
        let graph = StageGraph::standard();
        let run = StageRun::primary(StageKind::Syntactic);
        for id in ["a", "GEN.1.1", "", "zzz-999"] {
            let item = Item::new(id, "text");
            assert!(!graph.is_ready(&item, run, ReadinessPolicy::default()));

            let item = item.with_result("morphologic", json!({"tokens": ["x"]}));
            assert!(graph.is_ready(&item, run, ReadinessPolicy::default()));
        }
    }

    #[test]
    fn completed_slot_needs_force() {
        let graph = StageGraph::standard();
        let run = StageRun::primary(StageKind::Morphologic);
        let item = Item::new("a", "t").with_result("morphologic", json!({"tokens": []}));
        assert!(!graph.is_ready(&item, run, ReadinessPolicy::default()));
        assert!(graph.is_ready(
            &item,
            run,
            ReadinessPolicy {
                force: true,
                lenient: false
            }
        ));
    }

    #[test]
    fn alternate_mode_reads_its_own_slot() {
        let graph = StageGraph::standard();
        let item = Item::new("a", "t")
            .with_result("morphologic", json!({"tokens": []}))
            .with_result("syntactic", json!({"syntax": {}}));
        let policy = ReadinessPolicy::default();
        assert!(!graph.is_ready(&item, StageRun::primary(StageKind::Syntactic), policy));
        assert!(graph.is_ready(&item, StageRun::alternate(StageKind::Syntactic), policy));

        let item = item.with_result("syntactic_review", json!("looks fine"));
        assert!(!graph.is_ready(&item, StageRun::alternate(StageKind::Syntactic), policy));
    }

    #[test]
    fn error_marker_predecessor_requires_lenient() {
        let graph = StageGraph::standard();
        let run = StageRun::primary(StageKind::Syntactic);
        let item = Item::new("a", "t").with_result("morphologic", json!({"parse_error": "bad"}));
        assert!(!graph.is_ready(&item, run, ReadinessPolicy::default()));
        assert!(graph.is_ready(
            &item,
            run,
            ReadinessPolicy {
                force: false,
                lenient: true
            }
        ));
    }

    #[test]
    fn slots_cover_alternate_modes() {
        let slots: Vec<_> = StageGraph::standard().slots().collect();
        assert_eq!(slots.len(), 12);
        assert!(slots.contains(&"syntactic_review"));
        assert!(slots.contains(&"translation_draft"));
    }

    #[test]
    fn downstream_follows_declared_order() {
        let graph = StageGraph::standard();
        assert_eq!(
            graph.downstream(StageKind::Entities),
            vec![StageKind::Entities, StageKind::Websearch, StageKind::AssetCards]
        );
        assert_eq!(graph.downstream(StageKind::Graphematic).len(), 8);
    }

    #[test]
    fn translation_draft_does_not_chain() {
        let graph = StageGraph::standard();
        let def = graph.definition(StageKind::Translation);
        assert_eq!(def.chain_source(false), Some(StageKind::Semantic));
        assert_eq!(def.chain_source(true), None);
        assert_eq!(def.slot(true), "translation_draft");
        assert_eq!(def.cap_key(true), "translation_draft");
        assert_eq!(
            graph.definition(StageKind::Syntactic).cap_key(true),
            "review"
        );
    }
}
