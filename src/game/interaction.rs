//! Interaction records and logging strategies
//!
//! An [`Interaction`] is what one game call leaves behind for logging and
//! analysis. Which fields it keeps is decided by a [`LoggingStrategy`]; the
//! game holds one strategy for training and one for evaluation.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::{error::Error, population::TripleIndex};

/// Named tensors produced by a loss (accuracy, entropy, ...)
pub type AuxInfo = BTreeMap<String, Tensor>;

/// Per-call side information threaded through sender, receiver and loss
///
/// Rebuilt for every call; never persisted.
#[derive(Debug, Default)]
pub struct AuxInput {
    /// Indices of the sampled (sender, receiver, loss) triple
    pub indices: Option<TripleIndex>,

    /// Sender used as the auxiliary-loss target, if any
    pub aux_sender_idx: Option<usize>,

    tensors: BTreeMap<String, Tensor>,
}

impl AuxInput {
    /// Aux record for a sampled triple
    pub fn for_triple(indices: TripleIndex) -> Self {
        Self { indices: Some(indices), ..Default::default() }
    }

    /// Attach a named tensor
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(key.into(), tensor);
    }

    /// Look up a named tensor
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Flatten into a tensor map for logging
    ///
    /// Indices become 1-element `Int` tensors under `sender_idx`, `recv_idx`,
    /// `loss_idx` and `aux_sender_idx`.
    pub fn to_tensor_map(&self) -> BTreeMap<String, Tensor> {
        let mut map: BTreeMap<String, Tensor> =
            self.tensors.iter().map(|(k, v)| (k.clone(), v.shallow_clone())).collect();

        if let Some(indices) = self.indices {
            let (sender, receiver, loss) = indices.to_tensors();
            map.insert("sender_idx".into(), sender);
            map.insert("recv_idx".into(), receiver);
            map.insert("loss_idx".into(), loss);
        }
        if let Some(idx) = self.aux_sender_idx {
            map.insert("aux_sender_idx".into(), Tensor::from_slice(&[idx as i32]));
        }
        map
    }
}

/// Logged outcome of one or more game calls
#[derive(Debug, Default)]
pub struct Interaction {
    pub sender_input: Option<Tensor>,
    pub receiver_input: Option<Tensor>,
    pub labels: Option<Tensor>,
    pub receiver_output: Option<Tensor>,
    pub message: Option<Tensor>,
    pub message_length: Option<Tensor>,
    pub aux_input: BTreeMap<String, Tensor>,
    pub aux: AuxInfo,
}

impl Interaction {
    /// Concatenate interactions along the batch dimension
    ///
    /// A field is kept only if every interaction stored it; mixing stored
    /// and dropped values of the same field is a configuration error. Map
    /// entries are concatenated per key over the interactions that have it.
    pub fn from_iterable<I>(interactions: I) -> Result<Self>
    where
        I: IntoIterator<Item = Interaction>,
    {
        let items: Vec<Interaction> = interactions.into_iter().collect();

        macro_rules! cat_field {
            ($field:ident) => {
                cat_optional(stringify!($field), items.iter().map(|i| i.$field.as_ref()).collect())?
            };
        }

        Ok(Self {
            sender_input: cat_field!(sender_input),
            receiver_input: cat_field!(receiver_input),
            labels: cat_field!(labels),
            receiver_output: cat_field!(receiver_output),
            message: cat_field!(message),
            message_length: cat_field!(message_length),
            aux_input: cat_maps(items.iter().map(|i| &i.aux_input))?,
            aux: cat_maps(items.iter().map(|i| &i.aux))?,
        })
    }

    /// Number of logged examples, if the message was stored
    pub fn size(&self) -> Option<i64> {
        self.message.as_ref().and_then(|m| m.size().first().copied())
    }

    /// Mean of every aux entry, as `f64`
    pub fn aux_means(&self) -> BTreeMap<String, f64> {
        self.aux
            .iter()
            .filter_map(|(key, value)| {
                f64::try_from(&value.to_kind(Kind::Float).mean(Kind::Float))
                    .ok()
                    .map(|mean| (key.clone(), mean))
            })
            .collect()
    }

    /// Copy of this interaction with every tensor on `device`
    pub fn to_device(&self, device: Device) -> Self {
        let move_opt = |t: &Option<Tensor>| t.as_ref().map(|t| t.to_device(device));
        let move_map = |m: &BTreeMap<String, Tensor>| {
            m.iter().map(|(k, v)| (k.clone(), v.to_device(device))).collect()
        };
        Self {
            sender_input: move_opt(&self.sender_input),
            receiver_input: move_opt(&self.receiver_input),
            labels: move_opt(&self.labels),
            receiver_output: move_opt(&self.receiver_output),
            message: move_opt(&self.message),
            message_length: move_opt(&self.message_length),
            aux_input: move_map(&self.aux_input),
            aux: move_map(&self.aux),
        }
    }
}

fn as_batch(tensor: &Tensor) -> Tensor {
    if tensor.dim() == 0 {
        tensor.view([1])
    } else {
        tensor.shallow_clone()
    }
}

fn cat_optional(field: &str, parts: Vec<Option<&Tensor>>) -> Result<Option<Tensor>> {
    let stored: Vec<Tensor> = parts.iter().flatten().map(|t| as_batch(t)).collect();
    if stored.is_empty() {
        return Ok(None);
    }
    if stored.len() != parts.len() {
        return Err(Error::configuration(format!(
            "interaction field '{field}' is stored in only {} of {} records",
            stored.len(),
            parts.len()
        ))
        .into());
    }
    Ok(Some(Tensor::f_cat(&stored, 0).map_err(Error::from)?))
}

fn cat_maps<'a, I>(maps: I) -> Result<BTreeMap<String, Tensor>>
where
    I: Iterator<Item = &'a BTreeMap<String, Tensor>>,
{
    let mut grouped: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
    for map in maps {
        for (key, value) in map {
            grouped.entry(key.clone()).or_default().push(as_batch(value));
        }
    }
    grouped
        .into_iter()
        .map(|(key, parts)| {
            let joined = Tensor::f_cat(&parts, 0).map_err(Error::from)?;
            Ok((key, joined))
        })
        .collect()
}

/// Tensors a game call offers for logging
pub struct InteractionFields<'a> {
    pub sender_input: &'a Tensor,
    pub receiver_input: &'a Tensor,
    pub labels: &'a Tensor,
    pub aux_input: &'a AuxInput,
    pub receiver_output: &'a Tensor,
    pub message: &'a Tensor,
    pub message_length: &'a Tensor,
    pub aux: AuxInfo,
}

/// Which interaction fields to keep
///
/// Auxiliary loss metrics are always kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingStrategy {
    pub store_sender_input: bool,
    pub store_receiver_input: bool,
    pub store_labels: bool,
    pub store_aux_input: bool,
    pub store_message: bool,
    pub store_receiver_output: bool,
    pub store_message_length: bool,
}

impl Default for LoggingStrategy {
    fn default() -> Self {
        Self {
            store_sender_input: true,
            store_receiver_input: true,
            store_labels: true,
            store_aux_input: true,
            store_message: true,
            store_receiver_output: true,
            store_message_length: true,
        }
    }
}

impl LoggingStrategy {
    /// Keep only messages, labels and aux indices (cheap for long runs)
    pub fn minimal() -> Self {
        Self {
            store_sender_input: false,
            store_receiver_input: false,
            store_labels: true,
            store_aux_input: true,
            store_message: true,
            store_receiver_output: false,
            store_message_length: false,
        }
    }

    /// Build an interaction keeping the enabled fields, detached
    pub fn filtered_interaction(&self, fields: InteractionFields<'_>) -> Interaction {
        let keep = |flag: bool, t: &Tensor| flag.then(|| t.detach());
        Interaction {
            sender_input: keep(self.store_sender_input, fields.sender_input),
            receiver_input: keep(self.store_receiver_input, fields.receiver_input),
            labels: keep(self.store_labels, fields.labels),
            receiver_output: keep(self.store_receiver_output, fields.receiver_output),
            message: keep(self.store_message, fields.message),
            message_length: keep(self.store_message_length, fields.message_length),
            aux_input: if self.store_aux_input {
                fields.aux_input.to_tensor_map()
            } else {
                BTreeMap::new()
            },
            aux: fields.aux.into_iter().map(|(k, v)| (k, v.detach())).collect(),
        }
    }
}
