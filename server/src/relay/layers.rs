//! Negotiated layer graphs.
//!
//! A stream's [`LayerGraph`] lists the spatial/temporal combinations the
//! sender encodes, what each costs, and the dependency templates descriptors
//! may refer to. It is built once per codec negotiation and never mutated;
//! renegotiation replaces it with a new version.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use vc_common::protocol::MAX_FRAME_DEPENDENCIES;
use vc_common::{CodecId, LayerId, MediaKind};

use super::error::RelayError;

/// Highest template id a descriptor can carry.
pub const MAX_TEMPLATE_ID: u8 = 63;

/// One negotiated layer and the bitrate needed to receive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer identity.
    #[serde(flatten)]
    pub layer: LayerId,
    /// Target bitrate of everything up to and including this layer.
    pub bitrate_bps: u64,
}

impl LayerSpec {
    /// Create a layer spec.
    #[must_use]
    pub const fn new(spatial: u8, temporal: u8, bitrate_bps: u64) -> Self {
        Self {
            layer: LayerId::new(spatial, temporal),
            bitrate_bps,
        }
    }
}

/// Frame structure referenced by template-based descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTemplate {
    /// Template id (0..=63).
    pub id: u8,
    /// Layer of frames following this template.
    #[serde(flatten)]
    pub layer: LayerId,
    /// Backwards frame-number diffs of the referenced frames.
    #[serde(default)]
    pub frame_diffs: Vec<u16>,
}

/// Codec parameters handed over by signaling for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecNegotiation {
    /// Codec the sender will use.
    pub codec: CodecId,
    /// Layers and their bitrates. Empty for audio.
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
    /// Dependency templates. Empty for audio.
    #[serde(default)]
    pub templates: Vec<DependencyTemplate>,
}

/// Immutable, versioned layer graph of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerGraph {
    kind: MediaKind,
    codec: CodecId,
    version: u64,
    /// Sorted by ascending bitrate.
    layers: Vec<LayerSpec>,
    templates: Vec<Option<DependencyTemplate>>,
}

impl LayerGraph {
    /// Validate a negotiation and build the graph.
    pub fn new(
        kind: MediaKind,
        negotiation: CodecNegotiation,
        version: u64,
    ) -> Result<Self, RelayError> {
        let invalid = |msg: String| Err(RelayError::InvalidNegotiation(msg));
        let CodecNegotiation {
            codec,
            mut layers,
            templates,
        } = negotiation;

        if !codec.supports(kind) {
            return invalid(format!("codec {codec:?} cannot carry {kind}"));
        }

        if !kind.is_layered() {
            if !layers.is_empty() || !templates.is_empty() {
                return invalid("audio streams have no layers or templates".into());
            }
            return Ok(Self {
                kind,
                codec,
                version,
                layers,
                templates: Vec::new(),
            });
        }

        if layers.is_empty() {
            return invalid("at least one layer is required".into());
        }
        let mut seen = HashSet::with_capacity(layers.len());
        for spec in &layers {
            if !spec.layer.is_valid() {
                return invalid(format!("layer {} out of range", spec.layer));
            }
            if spec.bitrate_bps == 0 {
                return invalid(format!("layer {} has zero bitrate", spec.layer));
            }
            if !seen.insert(spec.layer) {
                return invalid(format!("duplicate layer {}", spec.layer));
            }
        }
        // A layer contained in another must be strictly cheaper.
        for lower in &layers {
            for upper in &layers {
                if lower.layer != upper.layer
                    && lower.layer.fits_within(upper.layer)
                    && lower.bitrate_bps >= upper.bitrate_bps
                {
                    return invalid(format!(
                        "layer {} must cost less than {}",
                        lower.layer, upper.layer
                    ));
                }
            }
        }
        layers.sort_by_key(|spec| (spec.bitrate_bps, spec.layer));
        let ceiling = ceiling_of(&layers);

        let mut slots = vec![None; usize::from(MAX_TEMPLATE_ID) + 1];
        for template in templates {
            if template.id > MAX_TEMPLATE_ID {
                return invalid(format!("template id {} out of range", template.id));
            }
            if !ceiling.is_some_and(|ceiling| template.layer.fits_within(ceiling)) {
                return invalid(format!(
                    "template {} references layer {} outside the negotiated range",
                    template.id, template.layer
                ));
            }
            if template.frame_diffs.len() > MAX_FRAME_DEPENDENCIES
                || template.frame_diffs.contains(&0)
            {
                return invalid(format!("template {} has invalid frame diffs", template.id));
            }
            let slot = &mut slots[usize::from(template.id)];
            if slot.is_some() {
                return invalid(format!("duplicate template id {}", template.id));
            }
            *slot = Some(template);
        }

        Ok(Self {
            kind,
            codec,
            version,
            layers,
            templates: slots,
        })
    }

    /// Stream kind the graph was negotiated for.
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Negotiated codec.
    #[must_use]
    pub const fn codec(&self) -> CodecId {
        self.codec
    }

    /// Negotiation version; increases with every renegotiation in a room.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Layers in ascending bitrate order.
    #[must_use]
    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Whether the stream has selectable layers.
    #[must_use]
    pub fn is_layered(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Whether `layer` was negotiated.
    #[must_use]
    pub fn contains(&self, layer: LayerId) -> bool {
        self.spec(layer).is_some()
    }

    /// Highest spatial and highest temporal id over all negotiated layers.
    ///
    /// An encoder producing S0T0, S1T0 and S2T1 also emits S0T1, S1T1 and
    /// S2T0 frames, so every layer within the ceiling is a valid packet layer.
    #[must_use]
    pub fn ceiling(&self) -> Option<LayerId> {
        ceiling_of(&self.layers)
    }

    /// Whether a packet of `layer` can belong to this stream.
    #[must_use]
    pub fn covers(&self, layer: LayerId) -> bool {
        self.ceiling().is_some_and(|ceiling| layer.fits_within(ceiling))
    }

    /// The negotiated spec of `layer`.
    #[must_use]
    pub fn spec(&self, layer: LayerId) -> Option<&LayerSpec> {
        self.layers.iter().find(|spec| spec.layer == layer)
    }

    /// Cheapest layer.
    #[must_use]
    pub fn lowest(&self) -> Option<&LayerSpec> {
        self.layers.first()
    }

    /// Most expensive layer.
    #[must_use]
    pub fn highest(&self) -> Option<&LayerSpec> {
        self.layers.last()
    }

    /// Template with the given id.
    #[must_use]
    pub fn template(&self, id: u8) -> Option<&DependencyTemplate> {
        self.templates.get(usize::from(id)).and_then(Option::as_ref)
    }
}

fn ceiling_of(layers: &[LayerSpec]) -> Option<LayerId> {
    layers.iter().map(|spec| spec.layer).reduce(|a, b| {
        LayerId::new(a.spatial.max(b.spatial), a.temporal.max(b.temporal))
    })
}
