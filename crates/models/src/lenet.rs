//! Multibranch LeNet.
//!
//! Shapes:
//! - Input images: `[B, C, 28, 28]`
//! - Features after two conv stages: `[B, 48 * 4 * 4]`
//! - Class log-probabilities: `[B, num_classes]`
//! - Domain log-probabilities: `[B, 2]`

use burn::module::{Module, Param};
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::tensor::activation::{log_softmax, relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::grl::reverse_gradient;
use crate::{Domain, DomainAdaptiveModel, DomainOutput};

/// Branch names in declaration order: (stage, kind) pairs for both conv stages.
pub const BRANCH_NAMES: &[&str] = &["conv1_d", "conv1_t", "conv2_d", "conv2_t"];

const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 48;
const FEATURE_SIDE: usize = 4;
const HIDDEN: usize = 100;
const BRANCHES_PER_STAGE: usize = 2;

#[derive(Debug, Clone)]
pub struct MultibranchLeNetConfig {
    pub in_channels: usize,
    pub num_classes: usize,
}

impl Default for MultibranchLeNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            num_classes: 10,
        }
    }
}

#[derive(Debug, Module)]
pub struct MultibranchLeNet<B: Backend> {
    conv1_d: Conv2d<B>,
    conv1_t: Conv2d<B>,
    conv2_d: Conv2d<B>,
    conv2_t: Conv2d<B>,
    /// Gate logits per conv stage, shape `[domains, branches]`.
    gates1: Param<Tensor<B, 2>>,
    gates2: Param<Tensor<B, 2>>,
    pool: MaxPool2d,
    class_fc1: nn::Linear<B>,
    class_fc2: nn::Linear<B>,
    class_out: nn::Linear<B>,
    domain_fc1: nn::Linear<B>,
    domain_out: nn::Linear<B>,
    num_classes: usize,
}

impl<B: Backend> MultibranchLeNet<B> {
    pub fn new(cfg: MultibranchLeNetConfig, device: &B::Device) -> Self {
        let conv = |c_in: usize, c_out: usize| Conv2dConfig::new([c_in, c_out], [5, 5]).init(device);
        // Zero logits start every domain with an even mix of both branches.
        let gates = || {
            Param::from_tensor(Tensor::zeros([Domain::COUNT, BRANCHES_PER_STAGE], device))
        };
        let features = CONV2_CHANNELS * FEATURE_SIDE * FEATURE_SIDE;
        let num_classes = cfg.num_classes.max(1);
        Self {
            conv1_d: conv(cfg.in_channels, CONV1_CHANNELS),
            conv1_t: conv(cfg.in_channels, CONV1_CHANNELS),
            conv2_d: conv(CONV1_CHANNELS, CONV2_CHANNELS),
            conv2_t: conv(CONV1_CHANNELS, CONV2_CHANNELS),
            gates1: gates(),
            gates2: gates(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            class_fc1: nn::LinearConfig::new(features, HIDDEN).init(device),
            class_fc2: nn::LinearConfig::new(HIDDEN, HIDDEN).init(device),
            class_out: nn::LinearConfig::new(HIDDEN, num_classes).init(device),
            domain_fc1: nn::LinearConfig::new(features, HIDDEN).init(device),
            domain_out: nn::LinearConfig::new(HIDDEN, Domain::COUNT).init(device),
            num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Softmax-normalized branch weights for `domain` at both stages, `[d, t]` order.
    pub fn gate_weights(&self, domain: Domain) -> [[f32; 2]; 2] {
        let read = |gates: &Param<Tensor<B, 2>>| {
            let values = Self::domain_gate(gates, domain)
                .into_data()
                .to_vec::<f32>()
                .unwrap_or_default();
            [
                values.first().copied().unwrap_or(0.5),
                values.get(1).copied().unwrap_or(0.5),
            ]
        };
        [read(&self.gates1), read(&self.gates2)]
    }

    /// Shared feature extractor, flattened to `[B, features]`.
    pub fn features(&self, images: Tensor<B, 4>, domain: Domain) -> Tensor<B, 2> {
        let x = Self::mix(
            self.conv1_d.forward(images.clone()),
            self.conv1_t.forward(images),
            &self.gates1,
            domain,
        );
        let x = self.pool.forward(relu(x));
        let x = Self::mix(
            self.conv2_d.forward(x.clone()),
            self.conv2_t.forward(x),
            &self.gates2,
            domain,
        );
        let x = self.pool.forward(relu(x));
        x.flatten(1, 3)
    }

    fn class_head(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.class_fc1.forward(features));
        let x = relu(self.class_fc2.forward(x));
        log_softmax(self.class_out.forward(x), 1)
    }

    fn domain_head(&self, features: Tensor<B, 2>, lambda: f32) -> Tensor<B, 2> {
        let x = relu(self.domain_fc1.forward(reverse_gradient(features, lambda)));
        log_softmax(self.domain_out.forward(x), 1)
    }

    fn domain_gate(gates: &Param<Tensor<B, 2>>, domain: Domain) -> Tensor<B, 2> {
        let row = domain.index();
        softmax(gates.val().slice([row..row + 1, 0..BRANCHES_PER_STAGE]), 1)
    }

    fn mix(
        branch_d: Tensor<B, 4>,
        branch_t: Tensor<B, 4>,
        gates: &Param<Tensor<B, 2>>,
        domain: Domain,
    ) -> Tensor<B, 4> {
        let weights = Self::domain_gate(gates, domain);
        let w_d = weights.clone().slice([0..1, 0..1]).reshape([1, 1, 1, 1]);
        let w_t = weights.slice([0..1, 1..2]).reshape([1, 1, 1, 1]);
        branch_d * w_d + branch_t * w_t
    }
}

impl<B: Backend> DomainAdaptiveModel<B> for MultibranchLeNet<B> {
    fn forward_domains(
        &self,
        images: Tensor<B, 4>,
        domain: Domain,
        lambda: f32,
    ) -> DomainOutput<B> {
        let features = self.features(images, domain);
        DomainOutput {
            class_log_probs: self.class_head(features.clone()),
            domain_log_probs: self.domain_head(features, lambda),
        }
    }

    fn classify(&self, images: Tensor<B, 4>, domain: Domain) -> Tensor<B, 2> {
        self.class_head(self.features(images, domain))
    }

    fn branch_names(&self) -> &'static [&'static str] {
        BRANCH_NAMES
    }
}
