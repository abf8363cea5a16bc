//! Microphone processing graph.
//!
//! `source -> gain -> compressor -> effect -> destination`, processed in
//! place on mono `f32` blocks. The effect slot always holds exactly one node:
//! a bypass for [`EffectKind::None`] or a convolution reverb.

pub mod compressor;
pub mod g711;
pub mod gain;
pub mod reverb;

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use compressor::{DynamicsCompressor, MIC_COMPRESSOR};
use gain::GainStage;
use reverb::ConvolutionReverb;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    #[default]
    None,
    Reverb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioGraphConfig {
    pub sample_rate: u32,
    pub initial_gain: f32,
    /// The microphone starts silent until the singer unmutes.
    pub start_muted: bool,
    pub effect: EffectKind,
}

impl Default for AudioGraphConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            initial_gain: 1.0,
            start_muted: true,
            effect: EffectKind::None,
        }
    }
}

/// A vertex of the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Source,
    Gain,
    Compressor,
    Effect(EffectKind),
    Destination,
}

enum EffectNode {
    Bypass,
    Reverb(Box<ConvolutionReverb>),
}

/// An effect node built ahead of time so it can be swapped into a running
/// graph without doing the expensive setup under the graph's lock.
pub struct PreparedEffect {
    node: EffectNode,
    sample_rate: u32,
}

impl PreparedEffect {
    pub fn new(kind: EffectKind, sample_rate: u32) -> Self {
        Self::with_rng(kind, sample_rate, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(kind: EffectKind, sample_rate: u32, rng: &mut R) -> Self {
        Self {
            node: EffectNode::build(kind, sample_rate, rng),
            sample_rate,
        }
    }

    pub fn kind(&self) -> EffectKind {
        self.node.kind()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl std::fmt::Debug for PreparedEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedEffect")
            .field("kind", &self.kind())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl EffectNode {
    fn build<R: Rng + ?Sized>(kind: EffectKind, sample_rate: u32, rng: &mut R) -> Self {
        match kind {
            EffectKind::None => EffectNode::Bypass,
            EffectKind::Reverb => {
                EffectNode::Reverb(Box::new(ConvolutionReverb::with_rng(sample_rate, rng)))
            }
        }
    }

    fn kind(&self) -> EffectKind {
        match self {
            EffectNode::Bypass => EffectKind::None,
            EffectNode::Reverb(_) => EffectKind::Reverb,
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        match self {
            EffectNode::Bypass => {}
            EffectNode::Reverb(reverb) => reverb.process(samples),
        }
    }
}

pub struct AudioGraph {
    sample_rate: u32,
    gain: GainStage,
    compressor: DynamicsCompressor,
    effect: EffectNode,
    connections: Vec<(NodeId, NodeId)>,
}

impl AudioGraph {
    pub fn new(config: &AudioGraphConfig) -> Self {
        Self::with_rng(config, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: &AudioGraphConfig, rng: &mut R) -> Self {
        let effect = EffectNode::build(config.effect, config.sample_rate, rng);
        let kind = effect.kind();
        let mut graph = Self {
            sample_rate: config.sample_rate,
            gain: GainStage::new(config.initial_gain, config.start_muted),
            compressor: DynamicsCompressor::new(MIC_COMPRESSOR, config.sample_rate),
            effect,
            connections: vec![
                (NodeId::Source, NodeId::Gain),
                (NodeId::Gain, NodeId::Compressor),
            ],
        };
        graph.connect_effect(kind);
        graph
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Clamp to `0..=2` and apply from the next processed block.
    pub fn set_gain(&mut self, value: f32) -> f32 {
        self.gain.set_gain(value)
    }

    pub fn gain(&self) -> f32 {
        self.gain.gain()
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.gain.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.gain.is_muted()
    }

    pub fn effective_gain(&self) -> f32 {
        self.gain.effective_gain()
    }

    pub fn effect(&self) -> EffectKind {
        self.effect.kind()
    }

    pub fn reduction_db(&self) -> f32 {
        self.compressor.reduction_db()
    }

    pub fn set_effect(&mut self, kind: EffectKind) {
        self.set_effect_with_rng(kind, &mut rand::rng());
    }

    /// Swap the effect node. The replacement is fully built before the
    /// current node is disconnected.
    pub fn set_effect_with_rng<R: Rng + ?Sized>(&mut self, kind: EffectKind, rng: &mut R) {
        let next = PreparedEffect::with_rng(kind, self.sample_rate, rng);
        self.install_effect(next);
    }

    /// Swap in a node built with [`PreparedEffect`]. A node prepared for a
    /// different sample rate is rebuilt for this graph first.
    pub fn install_effect(&mut self, prepared: PreparedEffect) {
        let prepared = if prepared.sample_rate == self.sample_rate {
            prepared
        } else {
            PreparedEffect::new(prepared.kind(), self.sample_rate)
        };
        let kind = prepared.kind();
        let previous = self.effect.kind();
        self.disconnect_effect();
        self.effect = prepared.node;
        self.connect_effect(kind);
        debug!("Audio effect switched from {previous:?} to {kind:?}");
    }

    fn disconnect_effect(&mut self) {
        self.connections.retain(|(from, to)| {
            !matches!(from, NodeId::Effect(_)) && !matches!(to, NodeId::Effect(_))
        });
    }

    fn connect_effect(&mut self, kind: EffectKind) {
        self.connections.push((NodeId::Compressor, NodeId::Effect(kind)));
        self.connections.push((NodeId::Effect(kind), NodeId::Destination));
    }

    pub fn connections(&self) -> &[(NodeId, NodeId)] {
        &self.connections
    }

    /// Number of distinct effect nodes present in the routing table.
    pub fn effect_node_count(&self) -> usize {
        let mut seen: Vec<EffectKind> = Vec::new();
        for (from, to) in &self.connections {
            for node in [from, to] {
                if let NodeId::Effect(kind) = node
                    && !seen.contains(kind)
                {
                    seen.push(*kind);
                }
            }
        }
        seen.len()
    }

    /// Run one block through the chain in place and hard clip the result.
    pub fn process(&mut self, samples: &mut [f32]) {
        self.gain.process(samples);
        self.compressor.process(samples);
        self.effect.process(samples);
        for s in samples.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

impl std::fmt::Debug for AudioGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioGraph")
            .field("sample_rate", &self.sample_rate)
            .field("gain", &self.gain)
            .field("effect", &self.effect.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn graph(effect: EffectKind) -> AudioGraph {
        let config = AudioGraphConfig {
            sample_rate: 8_000,
            start_muted: false,
            effect,
            ..Default::default()
        };
        AudioGraph::with_rng(&config, &mut StdRng::seed_from_u64(9))
    }

    fn effect_edges(g: &AudioGraph) -> usize {
        g.connections()
            .iter()
            .filter(|(a, b)| matches!(a, NodeId::Effect(_)) || matches!(b, NodeId::Effect(_)))
            .count()
    }

    #[test]
    fn test_default_config_starts_muted() {
        let config = AudioGraphConfig::default();
        assert!(config.start_muted);
        assert_eq!(config.sample_rate, 48_000);
        let g = AudioGraph::new(&config);
        assert!(g.is_muted());
        assert_eq!(g.effective_gain(), 0.0);
    }

    #[test]
    fn test_chain_order() {
        let g = graph(EffectKind::None);
        assert_eq!(
            g.connections(),
            &[
                (NodeId::Source, NodeId::Gain),
                (NodeId::Gain, NodeId::Compressor),
                (NodeId::Compressor, NodeId::Effect(EffectKind::None)),
                (NodeId::Effect(EffectKind::None), NodeId::Destination),
            ]
        );
    }

    #[test]
    fn test_effect_toggle_keeps_exactly_one_effect_node() {
        let mut g = graph(EffectKind::None);
        let mut rng = StdRng::seed_from_u64(10);
        for kind in [EffectKind::Reverb, EffectKind::None, EffectKind::Reverb] {
            g.set_effect_with_rng(kind, &mut rng);
            assert_eq!(g.effect(), kind);
            assert_eq!(g.effect_node_count(), 1);
            assert_eq!(effect_edges(&g), 2);
            assert!(g.connections().contains(&(NodeId::Compressor, NodeId::Effect(kind))));
        }
    }

    #[test]
    fn test_prepared_effect_installs_into_graph() {
        let mut g = graph(EffectKind::None);
        let prepared =
            PreparedEffect::with_rng(EffectKind::Reverb, 8_000, &mut StdRng::seed_from_u64(11));
        assert_eq!(prepared.kind(), EffectKind::Reverb);
        g.install_effect(prepared);
        assert_eq!(g.effect(), EffectKind::Reverb);
        assert_eq!(g.effect_node_count(), 1);

        // Built for another rate, rebuilt for the graph
        g.install_effect(PreparedEffect::with_rng(
            EffectKind::None,
            48_000,
            &mut StdRng::seed_from_u64(12),
        ));
        assert_eq!(g.effect(), EffectKind::None);
        assert_eq!(effect_edges(&g), 2);
    }

    #[test]
    fn test_effect_kind_keys_a_node_set() {
        let nodes: std::collections::HashSet<NodeId> = [
            NodeId::Effect(EffectKind::None),
            NodeId::Effect(EffectKind::Reverb),
            NodeId::Effect(EffectKind::Reverb),
        ]
        .into_iter()
        .collect();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_gain_and_mute_any_order() {
        let mut g = graph(EffectKind::None);
        g.set_muted(true);
        g.set_gain(5.0);
        assert_eq!(g.effective_gain(), 0.0);
        g.set_muted(false);
        assert_eq!(g.effective_gain(), 2.0);

        let mut g = graph(EffectKind::None);
        g.set_gain(5.0);
        g.set_muted(true);
        g.set_muted(false);
        assert_eq!(g.effective_gain(), 2.0);
    }

    #[test]
    fn test_muted_graph_outputs_silence() {
        let mut g = graph(EffectKind::None);
        g.set_muted(true);
        // First block ramps down from the unmuted gain, the next is silent
        g.process(&mut [0.5_f32; 256]);
        let mut block = [0.5_f32; 256];
        g.process(&mut block);
        assert!(block.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn test_output_is_clipped() {
        let mut g = graph(EffectKind::None);
        g.set_gain(2.0);
        let mut block = [1.0_f32; 512];
        g.process(&mut block);
        assert!(block.iter().all(|s| (-1.0..=1.0).contains(s)));
    }
}
