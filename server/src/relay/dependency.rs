//! Per-stream frame dependency tracking.
//!
//! Reconstructs which frames every incoming frame references, from custom
//! descriptor dependencies or the negotiated templates, and decides whether
//! a packet is a safe point to switch a receiver's spatial layer.

use thiserror::Error;
use vc_common::protocol::DependencyDescriptor;
use vc_common::LayerId;

use super::layers::LayerGraph;

/// Number of recent frames remembered per stream.
pub const FRAME_HISTORY: usize = 256;

/// Layer identity and references of the frame a packet belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    /// Unwrapped frame number.
    pub frame: u64,
    /// Layer of the frame.
    pub layer: LayerId,
    /// First packet of the frame.
    pub start_of_frame: bool,
    /// Unwrapped frame numbers this frame references.
    pub dependencies: Vec<u64>,
    /// A reference points before the start of the stream.
    unresolved: bool,
}

/// Descriptor contradicts the negotiated layer graph or earlier packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackError {
    /// Layer lies above the negotiated spatial or temporal range.
    #[error("layer {0} outside the negotiated range")]
    UnknownLayer(LayerId),
    /// Template id was not negotiated.
    #[error("template {0} not negotiated")]
    UnknownTemplate(u8),
    /// Template describes a different layer than the header.
    #[error("template layer {template} does not match header layer {header}")]
    LayerMismatch {
        /// Layer of the template.
        template: LayerId,
        /// Layer in the header.
        header: LayerId,
    },
    /// Packets of one frame disagree about its layer.
    #[error("frame {frame} changed layer")]
    FrameLayerChanged {
        /// Unwrapped frame number.
        frame: u64,
    },
}

#[derive(Debug, Clone)]
struct FrameRecord {
    frame: u64,
    layer: LayerId,
}

/// Recent frame history of one stream.
#[derive(Debug)]
pub struct DependencyTracker {
    history: Vec<Option<FrameRecord>>,
    highest: Option<u64>,
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![None; FRAME_HISTORY],
            highest: None,
        }
    }

    /// Forget all frames (used on renegotiation).
    pub fn reset(&mut self) {
        self.history.fill(None);
        self.highest = None;
    }

    /// Record a packet's frame and resolve its references.
    ///
    /// Packets must be observed in arrival order of the stream.
    pub fn observe(
        &mut self,
        layer: LayerId,
        descriptor: &DependencyDescriptor,
        graph: &LayerGraph,
    ) -> Result<PacketInfo, TrackError> {
        if !graph.covers(layer) {
            return Err(TrackError::UnknownLayer(layer));
        }

        let diffs: &[u16] = match &descriptor.custom_dependencies {
            Some(diffs) => diffs,
            None => {
                let template = graph
                    .template(descriptor.template_id)
                    .ok_or(TrackError::UnknownTemplate(descriptor.template_id))?;
                if template.layer != layer {
                    return Err(TrackError::LayerMismatch {
                        template: template.layer,
                        header: layer,
                    });
                }
                &template.frame_diffs
            }
        };

        let frame = self.unwrap_frame(descriptor.frame_number);
        let mut unresolved = false;
        let dependencies = diffs
            .iter()
            .filter_map(|diff| {
                let dependency = frame.checked_sub(u64::from(*diff));
                unresolved |= dependency.is_none();
                dependency
            })
            .collect();

        let slot = &mut self.history[(frame % FRAME_HISTORY as u64) as usize];
        match slot {
            Some(record) if record.frame == frame => {
                if record.layer != layer {
                    return Err(TrackError::FrameLayerChanged { frame });
                }
            }
            _ => *slot = Some(FrameRecord { frame, layer }),
        }

        Ok(PacketInfo {
            frame,
            layer,
            start_of_frame: descriptor.start_of_frame,
            dependencies,
            unresolved,
        })
    }

    /// Whether a receiver currently decoding `current` (or nothing) can move
    /// to `target` starting with this packet.
    ///
    /// From nothing, only a frame without references qualifies. Otherwise the
    /// packet must start a frame on the target spatial layer, and every frame
    /// it references must be known and already deliverable on both sides of
    /// the switch.
    #[must_use]
    pub fn is_switch_point(
        &self,
        info: &PacketInfo,
        current: Option<LayerId>,
        target: LayerId,
    ) -> bool {
        if !info.start_of_frame || info.unresolved {
            return false;
        }

        let Some(current) = current else {
            return info.dependencies.is_empty() && info.layer.fits_within(target);
        };

        if info.layer.spatial != target.spatial {
            return false;
        }
        let max_spatial = current.spatial.min(target.spatial);
        info.dependencies.iter().all(|dependency| {
            self.layer_of(*dependency).is_some_and(|layer| {
                layer.spatial <= max_spatial && layer.temporal <= current.temporal
            })
        })
    }

    /// Layer of a remembered frame.
    #[must_use]
    pub fn layer_of(&self, frame: u64) -> Option<LayerId> {
        self.history[(frame % FRAME_HISTORY as u64) as usize]
            .as_ref()
            .filter(|record| record.frame == frame)
            .map(|record| record.layer)
    }

    /// Extend a 16-bit frame number to a monotonic 64-bit one.
    fn unwrap_frame(&mut self, number: u16) -> u64 {
        let frame = match self.highest {
            // Start one wrap in so early references never underflow.
            None => (1 << 16) + u64::from(number),
            Some(highest) => {
                let delta = i64::from(number.wrapping_sub(highest as u16) as i16);
                (highest as i64 + delta).max(0) as u64
            }
        };
        self.highest = Some(self.highest.map_or(frame, |h| h.max(frame)));
        frame
    }
}

#[cfg(test)]
mod tests {
    use vc_common::{CodecId, MediaKind};

    use super::*;
    use crate::relay::layers::{CodecNegotiation, DependencyTemplate, LayerSpec};

    fn graph() -> LayerGraph {
        LayerGraph::new(
            MediaKind::Video,
            CodecNegotiation {
                codec: CodecId::Av1,
                layers: vec![
                    LayerSpec::new(0, 0, 150_000),
                    LayerSpec::new(1, 0, 500_000),
                    LayerSpec::new(2, 1, 2_000_000),
                ],
                templates: vec![
                    DependencyTemplate {
                        id: 0,
                        layer: LayerId::new(0, 0),
                        frame_diffs: vec![],
                    },
                    DependencyTemplate {
                        id: 1,
                        layer: LayerId::new(0, 0),
                        frame_diffs: vec![3],
                    },
                ],
            },
            1,
        )
        .unwrap()
    }

    fn custom(frame_number: u16, start: bool, diffs: &[u16]) -> DependencyDescriptor {
        DependencyDescriptor {
            start_of_frame: start,
            end_of_frame: true,
            template_id: 0,
            frame_number,
            decode_targets: 0,
            custom_dependencies: Some(diffs.to_vec()),
        }
    }

    fn templated(frame_number: u16, template_id: u8) -> DependencyDescriptor {
        DependencyDescriptor {
            start_of_frame: true,
            end_of_frame: true,
            template_id,
            frame_number,
            decode_targets: 0,
            custom_dependencies: None,
        }
    }

    const S0: LayerId = LayerId::new(0, 0);
    const S1: LayerId = LayerId::new(1, 0);
    const S2: LayerId = LayerId::new(2, 1);

    /// Keyframe temporal unit (frames 10..=12) followed by one delta unit
    /// (frames 13..=15), each upper layer predicting from the one below.
    fn feed_two_units(tracker: &mut DependencyTracker, graph: &LayerGraph) {
        tracker.observe(S0, &custom(10, true, &[]), graph).unwrap();
        tracker.observe(S1, &custom(11, true, &[1]), graph).unwrap();
        tracker.observe(S2, &custom(12, true, &[1]), graph).unwrap();
        tracker.observe(S0, &custom(13, true, &[3]), graph).unwrap();
        tracker.observe(S1, &custom(14, true, &[1, 3]), graph).unwrap();
        tracker.observe(S2, &custom(15, true, &[1, 3]), graph).unwrap();
    }

    #[test]
    fn test_keyframe_starts_fresh_receiver() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        let info = tracker.observe(S0, &custom(1, true, &[]), &graph).unwrap();
        assert!(tracker.is_switch_point(&info, None, S1));

        let info = tracker.observe(S1, &custom(2, true, &[1]), &graph).unwrap();
        assert!(!tracker.is_switch_point(&info, None, S1));
    }

    #[test]
    fn test_down_switch_waits_for_base_frame_start() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        feed_two_units(&mut tracker, &graph);

        // Continuation packet of an S0 frame is mid-frame.
        let info = tracker.observe(S0, &custom(16, false, &[3]), &graph).unwrap();
        assert!(!tracker.is_switch_point(&info, Some(S2), S0));

        let info = tracker.observe(S0, &custom(16, true, &[3]), &graph).unwrap();
        assert!(tracker.is_switch_point(&info, Some(S2), S0));

        // Upper layer frames are never a switch point towards S0.
        let info = tracker.observe(S1, &custom(17, true, &[1, 3]), &graph).unwrap();
        assert!(!tracker.is_switch_point(&info, Some(S2), S0));
    }

    #[test]
    fn test_up_switch_needs_frame_without_same_layer_history() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        feed_two_units(&mut tracker, &graph);

        // S1 frame predicting from an earlier S1 frame the receiver never got.
        let info = tracker.observe(S1, &custom(17, true, &[1, 3]), &graph).unwrap();
        assert!(!tracker.is_switch_point(&info, Some(S0), S1));

        // S1 frame predicting only from the S0 frame of its own unit.
        tracker.observe(S0, &custom(19, true, &[3]), &graph).unwrap();
        let info = tracker.observe(S1, &custom(20, true, &[1]), &graph).unwrap();
        assert!(tracker.is_switch_point(&info, Some(S0), S1));
    }

    #[test]
    fn test_unknown_dependency_is_not_a_switch_point() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        let info = tracker.observe(S0, &custom(50, true, &[5]), &graph).unwrap();
        assert!(!tracker.is_switch_point(&info, Some(S1), S0));
    }

    #[test]
    fn test_template_dependencies() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        tracker.observe(S0, &templated(7, 0), &graph).unwrap();
        let info = tracker.observe(S0, &templated(10, 1), &graph).unwrap();
        assert_eq!(info.dependencies, vec![info.frame - 3]);
        assert!(tracker.is_switch_point(&info, Some(S1), S0));

        assert_eq!(
            tracker.observe(S1, &templated(11, 0), &graph),
            Err(TrackError::LayerMismatch {
                template: S0,
                header: S1
            })
        );
        assert_eq!(
            tracker.observe(S0, &templated(11, 9), &graph),
            Err(TrackError::UnknownTemplate(9))
        );
        assert_eq!(
            tracker.observe(LayerId::new(3, 0), &custom(12, true, &[]), &graph),
            Err(TrackError::UnknownLayer(LayerId::new(3, 0)))
        );
        assert_eq!(
            tracker.observe(LayerId::new(2, 2), &custom(12, true, &[]), &graph),
            Err(TrackError::UnknownLayer(LayerId::new(2, 2)))
        );
    }

    #[test]
    fn test_unlisted_layers_within_range_are_tracked() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        tracker.observe(S0, &custom(0, true, &[]), &graph).unwrap();
        let s0t1 = LayerId::new(0, 1);
        let s1t1 = LayerId::new(1, 1);
        tracker.observe(s0t1, &custom(1, true, &[1]), &graph).unwrap();
        let info = tracker.observe(s1t1, &custom(2, true, &[1]), &graph).unwrap();
        assert_eq!(info.layer, s1t1);
        assert_eq!(tracker.layer_of(info.frame - 1), Some(s0t1));
    }

    #[test]
    fn test_frame_numbers_unwrap_across_wrap() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        let before = tracker
            .observe(S0, &custom(u16::MAX, true, &[]), &graph)
            .unwrap();
        let after = tracker.observe(S0, &custom(0, true, &[1]), &graph).unwrap();
        assert_eq!(after.frame, before.frame + 1);
        assert!(tracker.is_switch_point(&after, Some(S1), S0));
    }

    #[test]
    fn test_evicted_frames_become_unknown() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        let first = tracker.observe(S0, &custom(0, true, &[]), &graph).unwrap();
        for n in 1..=FRAME_HISTORY as u16 {
            tracker.observe(S0, &custom(n, true, &[1]), &graph).unwrap();
        }
        assert_eq!(tracker.layer_of(first.frame), None);
    }

    #[test]
    fn test_packets_of_one_frame_must_agree_on_layer() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        tracker.observe(S0, &custom(3, true, &[]), &graph).unwrap();
        assert!(matches!(
            tracker.observe(S1, &custom(3, false, &[]), &graph),
            Err(TrackError::FrameLayerChanged { .. })
        ));
    }

    #[test]
    fn test_reset_forgets_history() {
        let graph = graph();
        let mut tracker = DependencyTracker::new();
        let info = tracker.observe(S0, &custom(3, true, &[]), &graph).unwrap();
        tracker.reset();
        assert_eq!(tracker.layer_of(info.frame), None);
    }
}
