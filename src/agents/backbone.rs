//! Frozen vision feature extractors
//!
//! A [`BackboneRegistry`] maps an identifier to a constructor that builds the
//! feature-extraction subgraph only (no classification head), together with
//! the width of the features it produces. Built-in identifiers cover the
//! ResNet family shipped with `tch::vision`; anything else can be registered
//! at runtime.
//!
//! Every [`Backbone`] owns its own frozen `VarStore` and always runs in
//! evaluation behaviour without gradient tracking, regardless of the mode of
//! the agent that wraps it.

use std::{collections::BTreeMap, fmt, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tch::{nn, nn::ModuleT, vision::resnet, Device, Tensor};

use super::forward_checked;
use crate::error::Error;

/// Built-in backbone identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl BackboneKind {
    /// All built-in backbones
    pub const ALL: [BackboneKind; 5] = [
        BackboneKind::ResNet18,
        BackboneKind::ResNet34,
        BackboneKind::ResNet50,
        BackboneKind::ResNet101,
        BackboneKind::ResNet152,
    ];

    /// Registry identifier
    pub fn name(self) -> &'static str {
        match self {
            Self::ResNet18 => "resnet18",
            Self::ResNet34 => "resnet34",
            Self::ResNet50 => "resnet50",
            Self::ResNet101 => "resnet101",
            Self::ResNet152 => "resnet152",
        }
    }

    /// Width of the pooled features
    pub fn output_dim(self) -> i64 {
        match self {
            Self::ResNet18 | Self::ResNet34 => 512,
            Self::ResNet50 | Self::ResNet101 | Self::ResNet152 => 2048,
        }
    }

    fn build_net(self, p: &nn::Path) -> Box<dyn ModuleT> {
        match self {
            Self::ResNet18 => Box::new(resnet::resnet18_no_final_layer(p)),
            Self::ResNet34 => Box::new(resnet::resnet34_no_final_layer(p)),
            Self::ResNet50 => Box::new(resnet::resnet50_no_final_layer(p)),
            Self::ResNet101 => Box::new(resnet::resnet101_no_final_layer(p)),
            Self::ResNet152 => Box::new(resnet::resnet152_no_final_layer(p)),
        }
    }
}

impl FromStr for BackboneKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or(Error::UnsupportedBackbone { name: s.to_string() })
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A frozen feature extractor and the width of its output
pub struct Backbone {
    name: String,
    vs: nn::VarStore,
    net: Box<dyn ModuleT>,
    output_dim: i64,
}

impl Backbone {
    /// Wrap a prebuilt feature extractor
    ///
    /// The variable store is frozen here; it must never be handed to an
    /// optimizer.
    pub fn new(
        name: impl Into<String>,
        mut vs: nn::VarStore,
        net: Box<dyn ModuleT>,
        output_dim: i64,
    ) -> Result<Self> {
        let name = name.into();
        if output_dim <= 0 {
            return Err(Error::configuration(format!(
                "backbone '{name}' must report a positive output width, got {output_dim}"
            ))
            .into());
        }
        vs.freeze();
        Ok(Self { name, vs, net, output_dim })
    }

    /// Extract features in evaluation behaviour, outside the autograd graph
    pub fn features(&self, xs: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| forward_checked(self.net.as_ref(), xs, false))
    }

    /// Identifier this backbone was built from
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of the features produced by [`Backbone::features`]
    pub fn output_dim(&self) -> i64 {
        self.output_dim
    }

    /// Device holding the extractor weights
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Move the extractor weights to `device`
    pub fn to_device(&mut self, device: Device) {
        if self.vs.device() != device {
            self.vs.set_device(device);
        }
    }
}

impl fmt::Debug for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backbone")
            .field("name", &self.name)
            .field("output_dim", &self.output_dim)
            .field("device", &self.vs.device())
            .finish()
    }
}

type BackboneCtor = Box<dyn Fn(&nn::Path) -> Box<dyn ModuleT> + Send + Sync>;

struct RegistryEntry {
    output_dim: i64,
    ctor: BackboneCtor,
}

/// Maps backbone identifiers to constructors
#[derive(Default)]
pub struct BackboneRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl BackboneRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every [`BackboneKind`]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in BackboneKind::ALL {
            registry.register(kind.name(), kind.output_dim(), move |p| kind.build_net(p));
        }
        registry
    }

    /// Register (or replace) a constructor under `name`
    pub fn register<F>(&mut self, name: &str, output_dim: i64, ctor: F) -> &mut Self
    where
        F: Fn(&nn::Path) -> Box<dyn ModuleT> + Send + Sync + 'static,
    {
        self.entries
            .insert(name.trim().to_ascii_lowercase(), RegistryEntry { output_dim, ctor: Box::new(ctor) });
        self
    }

    /// Whether `name` resolves to a constructor
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.trim().to_ascii_lowercase())
    }

    /// Registered identifiers, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Build the backbone registered under `name`
    ///
    /// When `weights` is given, the pretrained parameters are loaded from
    /// that file before the store is frozen.
    pub fn build(&self, name: &str, weights: Option<&Path>, device: Device) -> Result<Backbone> {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(Error::configuration("backbone identifier is empty").into());
        }
        let entry = self
            .entries
            .get(&key)
            .ok_or_else(|| Error::UnsupportedBackbone { name: name.to_string() })?;

        let mut vs = nn::VarStore::new(device);
        let net = (entry.ctor)(&vs.root());
        if let Some(path) = weights {
            vs.load(path)
                .with_context(|| format!("loading '{key}' weights from {}", path.display()))?;
        }
        tracing::info!(
            "Built backbone {} ({} features, pretrained: {})",
            key,
            entry.output_dim,
            weights.is_some()
        );
        Backbone::new(key, vs, net, entry.output_dim)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tch::Kind;

    /// Registry with a tiny linear "backbone" mapping 4 inputs to 8 features
    pub(crate) fn tiny_registry() -> BackboneRegistry {
        let mut registry = BackboneRegistry::new();
        registry.register("tiny", 8, |p| Box::new(nn::linear(p / "fc", 4, 8, Default::default())));
        registry
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("resnet50".parse::<BackboneKind>().unwrap(), BackboneKind::ResNet50);
        assert_eq!(" ResNet18 ".parse::<BackboneKind>().unwrap(), BackboneKind::ResNet18);

        let err = "vit".parse::<BackboneKind>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedBackbone { .. }));
    }

    #[test]
    fn test_defaults_registered() {
        let registry = BackboneRegistry::with_defaults();
        for kind in BackboneKind::ALL {
            assert!(registry.contains(kind.name()));
        }
        assert_eq!(registry.names().count(), BackboneKind::ALL.len());
    }

    #[test]
    fn test_unknown_backbone() {
        let registry = BackboneRegistry::with_defaults();
        let err = registry.build("inception", None, Device::Cpu).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnsupportedBackbone { name }) if name == "inception"
        ));
    }

    #[test]
    fn test_empty_identifier() {
        let registry = BackboneRegistry::with_defaults();
        let err = registry.build("  ", None, Device::Cpu).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration { .. })));
    }

    #[test]
    fn test_resnet_width() {
        let registry = BackboneRegistry::with_defaults();
        let backbone = registry.build("resnet18", None, Device::Cpu).unwrap();
        assert_eq!(backbone.output_dim(), 512);
        assert_eq!(backbone.name(), "resnet18");
    }

    #[test]
    fn test_features_are_frozen_and_deterministic() {
        let backbone = tiny_registry().build("tiny", None, Device::Cpu).unwrap();
        let xs = Tensor::randn([3, 4], (Kind::Float, Device::Cpu));

        let a = backbone.features(&xs).unwrap();
        let b = backbone.features(&xs).unwrap();

        assert_eq!(a.size(), vec![3, 8]);
        assert!(!a.requires_grad());
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_wrong_input_width_is_an_error() {
        let backbone = tiny_registry().build("tiny", None, Device::Cpu).unwrap();
        let xs = Tensor::randn([3, 5], (Kind::Float, Device::Cpu));

        let err = backbone.features(&xs).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Computation(_))));
    }

    #[test]
    fn test_rejects_non_positive_width() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net: Box<dyn ModuleT> = Box::new(nn::linear(vs.root() / "fc", 4, 8, Default::default()));
        let err = Backbone::new("broken", vs, net, 0).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration { .. })));
    }
}
