//! Layer selection.
//!
//! Maps a link's bandwidth estimate onto the stream's layer graph and applies
//! the switch timing rules: temporal-only changes take effect at once, while
//! spatial changes are staged until the dependency tracker reports a switch
//! point.

use vc_common::LayerId;

use super::bwe::Bitrate;
use super::layers::{LayerGraph, LayerSpec};
use super::link::LinkState;
use crate::config::HysteresisConfig;

/// What [`LayerSelector::update`] did to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectionOutcome {
    /// Current or pending layer changed.
    pub changed: bool,
    /// A spatial up-switch was staged; the sender should produce a keyframe.
    pub request_keyframe: bool,
}

/// Threshold-table layer selector.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerSelector {
    hysteresis: HysteresisConfig,
}

impl LayerSelector {
    /// Create a selector with the given margins.
    #[must_use]
    pub const fn new(hysteresis: HysteresisConfig) -> Self {
        Self { hysteresis }
    }

    /// Highest layer the estimate affords, given the layer the link is
    /// heading for.
    ///
    /// Moving up requires the layer's bitrate plus the up margin; staying
    /// tolerates a shortfall of the down margin. With nothing affordable the
    /// cheapest layer is chosen. Returns `None` for graphs without layers.
    #[must_use]
    pub fn desired(
        &self,
        graph: &LayerGraph,
        estimate: Bitrate,
        reference: Option<LayerId>,
    ) -> Option<LayerId> {
        let available = estimate.as_bps() as f64;
        let layers = graph.layers();
        let reference = reference.and_then(|layer| graph.spec(layer));
        let cost = |spec: &LayerSpec| spec.bitrate_bps as f64;

        let up = layers
            .iter()
            .rev()
            .find(|spec| cost(spec) * (1.0 + self.hysteresis.up_margin) <= available);
        if let Some(up) = up {
            if reference.is_none_or(|current| up.bitrate_bps > current.bitrate_bps) {
                return Some(up.layer);
            }
        }

        if let Some(current) = reference {
            if cost(current) * (1.0 - self.hysteresis.down_margin) <= available {
                return Some(current.layer);
            }
        }

        layers
            .iter()
            .rev()
            .find(|spec| cost(spec) <= available)
            .or_else(|| layers.first())
            .map(|spec| spec.layer)
    }

    /// Re-evaluate a link against its estimate.
    pub fn update(&self, link: &mut LinkState, graph: &LayerGraph) -> SelectionOutcome {
        let reference = link.pending.or(link.current);
        let Some(desired) = self.desired(graph, link.estimate(), reference) else {
            return SelectionOutcome::default();
        };

        let mut outcome = SelectionOutcome::default();
        match link.current {
            None => {
                outcome.changed = link.pending != Some(desired);
                link.pending = Some(desired);
            }
            Some(current) if current == desired => {
                outcome.changed = link.pending.take().is_some();
            }
            Some(current) if current.spatial == desired.spatial => {
                link.current = Some(desired);
                link.pending = None;
                outcome.changed = true;
            }
            Some(current) => {
                if link.pending != Some(desired) {
                    link.pending = Some(desired);
                    outcome.changed = true;
                    outcome.request_keyframe = desired.spatial > current.spatial;
                }
            }
        }
        outcome
    }
}
