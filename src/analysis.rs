/*
 * Conversation Graph Engine - Secondary Analysis Interface
 * Copyright (c) 2026 Conversation Graph Engine Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Secondary analysis kinds (bias, frame, simulacra, claims, ...) are not
//! on the live ingestion path: they read the node store after the fact
//! through one uniform interface, `Analyzer::analyze`. `SimpleClaimFinder`
//! is the one concrete pass this crate ships, grounded on the donor's
//! self-contained keyword-pass plugin shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::EventStore;
use crate::types::{Node, RelationType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Notice,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub node_id: Uuid,
    pub kind: String,
    pub severity: Severity,
    pub payload: serde_json::Value,
}

/// Uniform entry point every secondary analysis kind implements. None of
/// these run during ingestion; each is invoked on demand against whatever
/// the live path has already persisted.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;
    async fn analyze(&self, store: &EventStore, conversation_id: Uuid) -> Result<Vec<Finding>, StoreError>;
}

/// Flags nodes whose summary still reads as an open question, and nodes
/// that a sibling's `edge_relations` mark as `rebuts` without an
/// intervening `clarifies`/`supports` edge resolving the disagreement.
pub struct SimpleClaimFinder;

impl SimpleClaimFinder {
    pub fn new() -> Self {
        Self
    }

    fn unresolved_question(node: &Node) -> bool {
        node.summary.trim_end().ends_with('?')
    }

    fn contested(node: &Node, all: &[Node]) -> bool {
        let rebutted_by: Vec<&Node> = all
            .iter()
            .filter(|other| other.node_id != node.node_id)
            .filter(|other| {
                other
                    .edge_relations
                    .iter()
                    .any(|rel| rel.relation_type == RelationType::Rebuts && rel.related_node_name == node.node_name)
            })
            .collect();
        if rebutted_by.is_empty() {
            return false;
        }
        let resolved = node.edge_relations.iter().any(|rel| {
            matches!(rel.relation_type, RelationType::Clarifies | RelationType::Supports)
                && rebutted_by.iter().any(|r| r.node_name == rel.related_node_name)
        });
        !resolved
    }
}

impl Default for SimpleClaimFinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Analyzer for SimpleClaimFinder {
    fn name(&self) -> &str {
        "simple_claim_finder"
    }

    async fn analyze(&self, store: &EventStore, conversation_id: Uuid) -> Result<Vec<Finding>, StoreError> {
        let nodes = store.nodes_for_conversation(conversation_id).await?;
        let mut findings = Vec::new();

        for node in &nodes {
            if Self::unresolved_question(node) {
                findings.push(Finding {
                    node_id: node.node_id,
                    kind: "unresolved_question".to_string(),
                    severity: Severity::Info,
                    payload: serde_json::json!({ "node_name": node.node_name, "summary": node.summary }),
                });
            }
            if Self::contested(node, &nodes) {
                findings.push(Finding {
                    node_id: node.node_id,
                    kind: "unresolved_contradiction".to_string(),
                    severity: Severity::Warning,
                    payload: serde_json::json!({ "node_name": node.node_name }),
                });
            }
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EdgeRelation;
    use chrono::Utc;

    fn node(name: &str, summary: &str, relations: Vec<EdgeRelation>) -> Node {
        Node {
            node_id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            node_name: name.to_string(),
            summary: summary.to_string(),
            chunk_id: "chunk-0".to_string(),
            speaker_id: None,
            source_excerpt: String::new(),
            predecessor_id: None,
            successor_id: None,
            edge_relations: relations,
            is_bookmark: false,
            is_contextual_progress: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn flags_unresolved_question_summary() {
        let n = node("topic-a", "is the budget actually approved?", vec![]);
        assert!(SimpleClaimFinder::unresolved_question(&n));
    }

    #[test]
    fn ignores_declarative_summary() {
        let n = node("topic-a", "the budget was approved.", vec![]);
        assert!(!SimpleClaimFinder::unresolved_question(&n));
    }

    #[test]
    fn contested_without_resolution_is_flagged() {
        let a = node("topic-a", "the launch date is final.", vec![]);
        let b = node(
            "topic-b",
            "the launch date slipped.",
            vec![EdgeRelation {
                related_node_name: "topic-a".to_string(),
                relation_type: RelationType::Rebuts,
                relation_text: "contradicts".to_string(),
            }],
        );
        assert!(SimpleClaimFinder::contested(&a, &[a.clone(), b]));
    }

    #[test]
    fn contested_with_clarification_is_not_flagged() {
        let b = node(
            "topic-b",
            "the launch date slipped.",
            vec![EdgeRelation {
                related_node_name: "topic-a".to_string(),
                relation_type: RelationType::Rebuts,
                relation_text: "contradicts".to_string(),
            }],
        );
        let a = node(
            "topic-a",
            "the launch date is final.",
            vec![EdgeRelation {
                related_node_name: "topic-b".to_string(),
                relation_type: RelationType::Clarifies,
                relation_text: "resolved after rebut".to_string(),
            }],
        );
        assert!(!SimpleClaimFinder::contested(&a, &[a.clone(), b]));
    }
}
