//! Workflow definitions.
//!
//! A [`WorkflowDefinition`] is a flat list of [`BlockDefinition`]s executed in
//! ascending `order`. Inputs may only reference strictly earlier blocks, so
//! the declared order is already a valid execution order and no graph
//! traversal is required.

mod block;

use std::collections::{HashMap, HashSet};

pub use block::{BlockDefinition, BlockInput, BlockType, ModelConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::{self, REQUEST_TEXT};
use crate::{WorkflowError, WorkflowResult};

/// Post-completion embedding settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Template rendered over the final outputs plus `REQUEST_TEXT`.
    #[serde(default)]
    pub template: String,
    /// Embedding model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl EmbeddingConfig {
    /// Enabled configuration with the given template.
    pub fn enabled(template: impl Into<String>) -> Self {
        Self {
            enabled: true,
            template: template.into(),
            model: None,
        }
    }
}

/// An ordered pipeline of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    pub blocks: Vec<BlockDefinition>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl WorkflowDefinition {
    /// Creates an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            blocks: Vec::new(),
            embedding: EmbeddingConfig::default(),
        }
    }

    /// Appends a block, assigning it the next order value.
    pub fn with_block(mut self, mut block: BlockDefinition) -> Self {
        block.order = self
            .blocks
            .iter()
            .map(|b| b.order + 1)
            .max()
            .unwrap_or_default();
        self.blocks.push(block);
        self
    }

    /// Sets the embedding configuration.
    pub fn with_embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.embedding = embedding;
        self
    }

    /// Blocks in execution order.
    pub fn ordered_blocks(&self) -> Vec<&BlockDefinition> {
        let mut blocks: Vec<_> = self.blocks.iter().collect();
        blocks.sort_by_key(|b| b.order);
        blocks
    }

    /// Number of blocks, which is also the number of job steps.
    pub fn total_steps(&self) -> usize {
        self.blocks.len()
    }

    /// Finds a block by id.
    pub fn block(&self, id: Uuid) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Checks the structural invariants of the workflow.
    ///
    /// A valid workflow has at least one block, unique block ids and names,
    /// order values forming a contiguous range, parseable output schemas, and
    /// every `BLOCK_OUTPUT` input or template placeholder naming a block
    /// refers to a strictly earlier block.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.blocks.is_empty() {
            return Err(invalid("workflow has no blocks"));
        }

        let mut ids = HashSet::new();
        let mut orders_by_name: HashMap<&str, u32> = HashMap::new();
        for block in &self.blocks {
            let name = block.name.trim();
            if name.is_empty() {
                return Err(invalid("block name must not be empty"));
            }
            if name == REQUEST_TEXT || name.contains(['.', '{', '}']) {
                return Err(invalid(format!("block name '{name}' is reserved or malformed")));
            }
            if !ids.insert(block.id) {
                return Err(invalid(format!("duplicate block id {}", block.id)));
            }
            if orders_by_name.insert(name, block.order).is_some() {
                return Err(invalid(format!("duplicate block name '{name}'")));
            }
        }

        let mut orders: Vec<u32> = self.blocks.iter().map(|b| b.order).collect();
        orders.sort_unstable();
        if orders.windows(2).any(|pair| pair[0].checked_add(1) != Some(pair[1])) {
            return Err(invalid("block order values must be unique and contiguous"));
        }

        let orders_by_id: HashMap<Uuid, u32> =
            self.blocks.iter().map(|b| (b.id, b.order)).collect();

        for block in &self.blocks {
            for source in block.dependencies() {
                match orders_by_id.get(&source) {
                    None => {
                        return Err(invalid(format!(
                            "block '{}' reads from unknown block {source}",
                            block.name
                        )));
                    }
                    Some(&order) if order >= block.order => {
                        return Err(invalid(format!(
                            "block '{}' reads from a block that does not run before it",
                            block.name
                        )));
                    }
                    Some(_) => {}
                }
            }

            let templates = std::iter::once(block.prompt_template.as_str())
                .chain(block.system_prompt.as_deref());
            for placeholder in templates.flat_map(template::placeholders) {
                if let Some(&order) = orders_by_name.get(placeholder.root)
                    && order >= block.order
                {
                    return Err(invalid(format!(
                        "block '{}' references '{}' which does not run before it",
                        block.name, placeholder.root
                    )));
                }
            }

            if !block.output_schema.is_null() {
                jsonschema::validator_for(&block.output_schema).map_err(|e| {
                    invalid(format!("block '{}' has an invalid output schema: {e}", block.name))
                })?;
            }
        }

        Ok(())
    }

    /// Removes a CUSTOM block and re-densifies the order values.
    ///
    /// Refuses CORE blocks and blocks that later blocks read from.
    pub fn remove_block(&mut self, id: Uuid) -> WorkflowResult<BlockDefinition> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| invalid(format!("no block with id {id}")))?;

        let block = &self.blocks[index];
        if block.is_core() {
            return Err(WorkflowError::ImmutableBlock {
                block: block.name.clone(),
            });
        }

        if let Some(dependent) = self
            .blocks
            .iter()
            .find(|other| other.dependencies().any(|source| source == id))
        {
            return Err(invalid(format!(
                "block '{}' is read by '{}'",
                block.name, dependent.name
            )));
        }

        let base = self.blocks.iter().map(|b| b.order).min().unwrap_or_default();
        let removed = self.blocks.remove(index);

        let mut positions: Vec<usize> = (0..self.blocks.len()).collect();
        positions.sort_by_key(|&i| self.blocks[i].order);
        for (offset, i) in positions.into_iter().enumerate() {
            self.blocks[i].order = base + offset as u32;
        }

        Ok(removed)
    }
}

fn invalid(message: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidDefinition(message.into())
}
