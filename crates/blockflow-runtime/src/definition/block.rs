//! Block definitions.

use blockflow_core::inference::ModelParameters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};
use uuid::Uuid;

/// Whether a block is part of the built-in workflow skeleton.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    /// Built-in block; cannot be removed.
    Core,
    /// Author-defined block.
    #[default]
    Custom,
}

/// Where a block draws an input from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockInput {
    /// The task's request text.
    RequestText,
    /// The structured output of a strictly earlier block.
    BlockOutput { source_block_id: Uuid },
}

/// Model selection for a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name understood by the completion provider.
    pub name: String,
    #[serde(default)]
    pub parameters: ModelParameters,
}

impl ModelConfig {
    /// Creates a model config with default parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: ModelParameters::default(),
        }
    }

    /// Sets the sampling parameters.
    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new("llama3.2")
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Unique within the workflow; used as the binding name.
    pub name: String,
    /// Execution position.
    pub order: u32,
    pub prompt_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// JSON Schema for the structured output. `null` accepts anything.
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub block_type: BlockType,
    #[serde(default)]
    pub inputs: Vec<BlockInput>,
}

impl BlockDefinition {
    /// Creates a custom block with a fresh id, order 0 and no schema.
    pub fn new(name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            order: 0,
            prompt_template: prompt_template.into(),
            system_prompt: None,
            output_schema: Value::Null,
            model: ModelConfig::default(),
            block_type: BlockType::Custom,
            inputs: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_input(mut self, input: BlockInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Declares a dependency on another block's output.
    pub fn depends_on(self, source: &BlockDefinition) -> Self {
        self.with_input(BlockInput::BlockOutput {
            source_block_id: source.id,
        })
    }

    /// Marks the block as CORE.
    pub fn core(mut self) -> Self {
        self.block_type = BlockType::Core;
        self
    }

    pub fn is_core(&self) -> bool {
        self.block_type == BlockType::Core
    }

    /// Ids of the blocks this block reads from.
    pub fn dependencies(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            BlockInput::BlockOutput { source_block_id } => Some(*source_block_id),
            BlockInput::RequestText => None,
        })
    }
}
