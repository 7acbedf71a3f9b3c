//! Conditioning: attributes, their encoded tensors, and input fusion.
//!
//! Callers describe what a sample should sound like as a bag of named
//! [`AttributeValue`]s. A [`ConditionProvider`] (injected by the embedding
//! application, not defined here) turns those into named tensors, and the
//! [`ConditionFuser`] folds each named tensor into the backbone input along
//! the route the model config assigns it: summed onto every step, prepended
//! once as a prefix, or exposed to the layers' cross-attention.

use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Encoded conditions, one tensor of shape `[batch, len, dim]` per name.
pub type ConditionTensors = HashMap<String, Tensor>;

/// The conditioning description of one sample.
pub type ConditionAttributes = HashMap<String, AttributeValue>;

/// One attribute of one sample.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Text(String),
    Tensor(Tensor),
    /// Deliberately absent; encodes to the provider's learned or fixed null
    /// representation. This is what the guidance machinery feeds the
    /// unconditional branch.
    Null,
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

/// The null counterpart of `attributes`: same keys, every value dropped.
pub fn null_attributes(attributes: &ConditionAttributes) -> ConditionAttributes {
    attributes
        .keys()
        .map(|k| (k.clone(), AttributeValue::Null))
        .collect()
}

/// Output of [`ConditionProvider::prepare`]: per-name batched raw tensors
/// (token ids, reference features) ready for the encoding pass.
pub struct PreparedConditions(pub HashMap<String, Tensor>);

/// Turns attribute bags into condition tensors.
///
/// `prepare` batches the raw per-sample values on the CPU; `encode` runs
/// whatever encoders the implementation owns and must return one tensor of
/// shape `[batch, len, dim]` per attribute name, with null attributes mapped
/// to the implementation's null representation.
pub trait ConditionProvider: Send + Sync {
    fn prepare(&self, attributes: &[ConditionAttributes]) -> Result<PreparedConditions>;

    fn encode(&self, prepared: PreparedConditions) -> Result<ConditionTensors>;

    fn condition(&self, attributes: &[ConditionAttributes]) -> Result<ConditionTensors> {
        self.encode(self.prepare(attributes)?)
    }
}

/// Which fusion route each named condition takes into the backbone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuserConfig {
    /// Broadcast-added onto every input step.
    #[serde(default)]
    pub sum: Vec<String>,
    /// Concatenated before the first input of a session.
    #[serde(default)]
    pub prepend: Vec<String>,
    /// Concatenated into the source the layers cross-attend to.
    #[serde(default)]
    pub cross_attention: Vec<String>,
}

impl FuserConfig {
    pub fn is_empty(&self) -> bool {
        self.sum.is_empty() && self.prepend.is_empty() && self.cross_attention.is_empty()
    }

    /// Every routed condition name, in route order.
    pub fn condition_names(&self) -> impl Iterator<Item = &str> {
        self.sum
            .iter()
            .chain(&self.prepend)
            .chain(&self.cross_attention)
            .map(String::as_str)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for name in self.condition_names() {
            ensure!(seen.insert(name), "condition {name} routed more than once");
        }
        Ok(())
    }
}

/// Applies the configured fusion routes to one backbone input.
pub struct ConditionFuser {
    config: FuserConfig,
}

impl ConditionFuser {
    pub fn new(config: FuserConfig) -> Self {
        Self { config }
    }

    /// Fold `conditions` into `input` (`[batch, steps, dim]`).
    ///
    /// Returns the fused input and, when any condition routes to
    /// cross-attention, the concatenated cross source. Prepend routes only
    /// fire when `first` is set — the prefix must enter the KV cache exactly
    /// once per session.
    pub fn fuse(
        &self,
        input: &Tensor,
        conditions: Option<&ConditionTensors>,
        first: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let conditions = match conditions {
            Some(conditions) => conditions,
            None => {
                ensure!(
                    self.config.is_empty(),
                    "the model routes conditions ({}) but none were provided",
                    self.config.condition_names().collect::<Vec<_>>().join(", ")
                );
                return Ok((input.clone(), None));
            }
        };
        for name in conditions.keys() {
            ensure!(
                self.config.condition_names().any(|n| n == name),
                "condition {name} is not routed anywhere"
            );
        }
        let get = |name: &String| {
            conditions
                .get(name)
                .with_context(|| format!("condition {name} was not encoded"))
        };

        let mut hidden = input.clone();
        for name in &self.config.sum {
            hidden = hidden.broadcast_add(get(name)?)?;
        }
        if first && !self.config.prepend.is_empty() {
            let mut parts = Vec::with_capacity(self.config.prepend.len() + 1);
            for name in &self.config.prepend {
                parts.push(get(name)?.clone());
            }
            parts.push(hidden);
            hidden = Tensor::cat(&parts, 1)?;
        }

        let cross = if self.config.cross_attention.is_empty() {
            None
        } else {
            let mut parts = Vec::with_capacity(self.config.cross_attention.len());
            for name in &self.config.cross_attention {
                parts.push(get(name)?.clone());
            }
            Some(Tensor::cat(&parts, 1)?)
        };

        Ok((hidden, cross))
    }
}

/// Condition tensors arranged for classifier-free guidance.
pub enum CfgConditions {
    /// No conditioning at all.
    None,
    /// Conditioning without guidance (coefficient 1).
    Plain(ConditionTensors),
    /// One batch-doubled pass: conditional rows first, null rows after.
    OnePass(ConditionTensors),
    /// Two separate passes over two streaming states.
    TwoPass {
        conditional: ConditionTensors,
        null: ConditionTensors,
    },
}

impl CfgConditions {
    /// Verify every tensor's batch dimension against the sample count.
    pub fn check_batch(&self, batch: usize) -> Result<()> {
        fn check(tensors: &ConditionTensors, expected: usize) -> Result<()> {
            for (name, tensor) in tensors {
                let got = tensor.dim(0)?;
                ensure!(
                    got == expected,
                    "condition {name} has batch size {got}, expected {expected}"
                );
            }
            Ok(())
        }
        match self {
            CfgConditions::None => Ok(()),
            CfgConditions::Plain(c) => check(c, batch),
            CfgConditions::OnePass(c) => check(c, 2 * batch),
            CfgConditions::TwoPass { conditional, null } => {
                check(conditional, batch)?;
                check(null, batch)
            }
        }
    }
}

/// Encode `attributes` in the arrangement guidance will consume them in.
///
/// With a coefficient of 1 guidance is a no-op and a single conditional
/// encoding suffices. Otherwise the null attributes are encoded alongside the
/// real ones — in one batch-doubled call by default, or as two separate
/// tensor sets for the two-pass scheme.
pub fn build_cfg_conditions(
    provider: &dyn ConditionProvider,
    attributes: &[ConditionAttributes],
    cfg_coef: f64,
    two_step: bool,
) -> Result<CfgConditions> {
    if attributes.is_empty() {
        return Ok(CfgConditions::None);
    }
    if cfg_coef == 1.0 {
        return Ok(CfgConditions::Plain(provider.condition(attributes)?));
    }
    if two_step {
        let nulls: Vec<ConditionAttributes> = attributes.iter().map(null_attributes).collect();
        Ok(CfgConditions::TwoPass {
            conditional: provider.condition(attributes)?,
            null: provider.condition(&nulls)?,
        })
    } else {
        let mut doubled = attributes.to_vec();
        doubled.extend(attributes.iter().map(null_attributes));
        Ok(CfgConditions::OnePass(provider.condition(&doubled)?))
    }
}
