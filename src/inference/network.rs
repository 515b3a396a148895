//! Layer graph runtime for the native model format.
//!
//! A model file is a JSON document describing a Keras-style layer stack
//! (convolutions, pooling, dense heads, activations and nested `sequential`
//! blocks) with its weights inline. Tensors are NHWC `f32`.
//!
//! Besides plain inference the runtime records a [`GradientTape`]: the input
//! and output of every leaf layer in execution order. Walking the tape
//! backwards yields the gradient of a scalar score with respect to any
//! layer's activations, which is what Grad-CAM needs.

use std::collections::HashSet;
use std::path::Path;

use ndarray::{s, Array1, Array2, Array4, ArrayD, ArrayView2, ArrayView4, Axis, Ix2, Ix4, IxDyn, Zip};
use serde::Deserialize;
use thiserror::Error;

use super::InferenceError;

pub type Tensor = ArrayD<f32>;

// ═══════════════════════════════════════════════════════════
// Model file format
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub input: InputSpec,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InputSpec {
    pub height: usize,
    pub width: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
}

fn default_channels() -> usize {
    3
}

fn default_stride() -> usize {
    1
}

fn default_epsilon() -> f32 {
    1e-3
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        name: String,
        filters: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: Padding,
        /// Kernel in HWIO order, flattened.
        weights: Vec<f32>,
        #[serde(default)]
        bias: Vec<f32>,
    },
    Dense {
        name: String,
        units: usize,
        /// `[inputs, units]`, row-major.
        weights: Vec<f32>,
        #[serde(default)]
        bias: Vec<f32>,
    },
    BatchNorm {
        name: String,
        gamma: Vec<f32>,
        beta: Vec<f32>,
        moving_mean: Vec<f32>,
        moving_variance: Vec<f32>,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    MaxPool2d {
        name: String,
        pool_size: usize,
        #[serde(default)]
        stride: Option<usize>,
    },
    GlobalAveragePool {
        name: String,
    },
    Flatten {
        name: String,
    },
    Relu {
        name: String,
    },
    Sigmoid {
        name: String,
    },
    Softmax {
        name: String,
    },
    Dropout {
        name: String,
        #[serde(default)]
        rate: f32,
    },
    Sequential {
        name: String,
        layers: Vec<LayerSpec>,
    },
}

/// Structural problem in a model file.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SpecError(String);

// ═══════════════════════════════════════════════════════════
// Built layers
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub layer: Layer,
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    Dense(Dense),
    BatchNorm(BatchNorm),
    MaxPool2d { pool: usize, stride: usize },
    GlobalAveragePool,
    Flatten,
    Relu,
    Sigmoid,
    Softmax,
    Dropout,
    Sequential(Vec<Node>),
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `[kh, kw, in_channels, filters]`
    kernel: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: Padding,
}

#[derive(Debug, Clone)]
pub struct Dense {
    /// `[inputs, units]`
    weights: Array2<f32>,
    bias: Array1<f32>,
}

/// Inference-mode batch norm folded into `x * scale + shift`.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Spatial { h: usize, w: usize, c: usize },
    Flat(usize),
}

impl Shape {
    fn channels(self) -> usize {
        match self {
            Shape::Spatial { c, .. } => c,
            Shape::Flat(n) => n,
        }
    }
}

struct ConvGeometry {
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

impl Conv2d {
    fn geometry(&self, h: usize, w: usize) -> Option<ConvGeometry> {
        let (kh, kw, _, _) = self.kernel.dim();
        let s = self.stride;
        match self.padding {
            Padding::Valid => {
                if h < kh || w < kw {
                    return None;
                }
                Some(ConvGeometry {
                    out_h: (h - kh) / s + 1,
                    out_w: (w - kw) / s + 1,
                    pad_top: 0,
                    pad_left: 0,
                })
            }
            Padding::Same => {
                let out_h = h.div_ceil(s);
                let out_w = w.div_ceil(s);
                let pad_h = ((out_h - 1) * s + kh).saturating_sub(h);
                let pad_w = ((out_w - 1) * s + kw).saturating_sub(w);
                Some(ConvGeometry {
                    out_h,
                    out_w,
                    pad_top: pad_h / 2,
                    pad_left: pad_w / 2,
                })
            }
        }
    }

    /// Input coordinate for an output position and kernel offset, if inside the image.
    fn source(out: usize, k: usize, stride: usize, pad: usize, limit: usize) -> Option<usize> {
        let pos = (out * stride + k) as isize - pad as isize;
        (pos >= 0 && (pos as usize) < limit).then_some(pos as usize)
    }

    fn forward(&self, x: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError> {
        let (n, h, w, cin) = x.dim();
        let (kh, kw, kin, cout) = self.kernel.dim();
        if cin != kin {
            return Err(InferenceError::Forward(format!(
                "conv expects {kin} channels, got {cin}"
            )));
        }
        let g = self
            .geometry(h, w)
            .ok_or_else(|| InferenceError::Forward(format!("input {h}x{w} smaller than kernel")))?;

        let mut out = Array4::<f32>::zeros((n, g.out_h, g.out_w, cout));
        for b in 0..n {
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut cell = out.slice_mut(s![b, oy, ox, ..]);
                    cell.assign(&self.bias);
                    for ky in 0..kh {
                        let Some(iy) = Self::source(oy, ky, self.stride, g.pad_top, h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = Self::source(ox, kx, self.stride, g.pad_left, w) else {
                                continue;
                            };
                            for c in 0..cin {
                                let v = x[[b, iy, ix, c]];
                                if v != 0.0 {
                                    cell.scaled_add(v, &self.kernel.slice(s![ky, kx, c, ..]));
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&self, x: ArrayView4<f32>, grad: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError> {
        let (n, h, w, cin) = x.dim();
        let (kh, kw, _, _) = self.kernel.dim();
        let g = self
            .geometry(h, w)
            .ok_or_else(|| InferenceError::Forward(format!("input {h}x{w} smaller than kernel")))?;

        let mut dx = Array4::<f32>::zeros((n, h, w, cin));
        for b in 0..n {
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let upstream = grad.slice(s![b, oy, ox, ..]);
                    for ky in 0..kh {
                        let Some(iy) = Self::source(oy, ky, self.stride, g.pad_top, h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = Self::source(ox, kx, self.stride, g.pad_left, w) else {
                                continue;
                            };
                            for c in 0..cin {
                                dx[[b, iy, ix, c]] +=
                                    upstream.dot(&self.kernel.slice(s![ky, kx, c, ..]));
                            }
                        }
                    }
                }
            }
        }
        Ok(dx)
    }
}

fn view4(t: &Tensor) -> Result<ArrayView4<'_, f32>, InferenceError> {
    Ok(t.view().into_dimensionality::<Ix4>()?)
}

fn view2(t: &Tensor) -> Result<ArrayView2<'_, f32>, InferenceError> {
    Ok(t.view().into_dimensionality::<Ix2>()?)
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

impl Layer {
    /// Implementation name, used when searching the graph by layer type.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => "Conv2D",
            Layer::Dense(_) => "Dense",
            Layer::BatchNorm(_) => "BatchNormalization",
            Layer::MaxPool2d { .. } => "MaxPooling2D",
            Layer::GlobalAveragePool => "GlobalAveragePooling2D",
            Layer::Flatten => "Flatten",
            Layer::Relu => "ReLU",
            Layer::Sigmoid => "Sigmoid",
            Layer::Softmax => "Softmax",
            Layer::Dropout => "Dropout",
            Layer::Sequential(_) => "Sequential",
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor, InferenceError> {
        let y = match self {
            Layer::Conv2d(conv) => conv.forward(view4(x)?)?.into_dyn(),
            Layer::Dense(dense) => (view2(x)?.dot(&dense.weights) + &dense.bias).into_dyn(),
            Layer::BatchNorm(bn) => x * &bn.scale + &bn.shift,
            Layer::MaxPool2d { pool, stride } => {
                let x4 = view4(x)?;
                let (n, h, w, c) = x4.dim();
                if h < *pool || w < *pool {
                    return Err(InferenceError::Forward(format!(
                        "input {h}x{w} smaller than pool {pool}"
                    )));
                }
                let (oh, ow) = ((h - pool) / stride + 1, (w - pool) / stride + 1);
                Array4::from_shape_fn((n, oh, ow, c), |(b, oy, ox, ch)| {
                    let window = x4.slice(s![
                        b,
                        oy * stride..oy * stride + pool,
                        ox * stride..ox * stride + pool,
                        ch
                    ]);
                    window.fold(f32::NEG_INFINITY, |m, &v| m.max(v))
                })
                .into_dyn()
            }
            Layer::GlobalAveragePool => {
                let x4 = view4(x)?;
                let (_, h, w, _) = x4.dim();
                let area = (h * w) as f32;
                x4.sum_axis(Axis(1))
                    .sum_axis(Axis(1))
                    .mapv(|v| v / area)
                    .into_dyn()
            }
            Layer::Flatten => {
                let n = x.shape().first().copied().unwrap_or(1);
                let rest = x.len() / n.max(1);
                x.as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(IxDyn(&[n, rest]))?
            }
            Layer::Relu => x.mapv(|v| v.max(0.0)),
            Layer::Sigmoid => x.mapv(sigmoid),
            Layer::Softmax => {
                let axis = Axis(x.ndim().saturating_sub(1));
                let mut y = x.clone();
                for mut lane in y.lanes_mut(axis) {
                    let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    lane.mapv_inplace(|v| (v - max).exp());
                    let sum = lane.sum();
                    lane.mapv_inplace(|v| v / sum);
                }
                y
            }
            Layer::Dropout => x.clone(),
            Layer::Sequential(_) => {
                return Err(InferenceError::Forward(
                    "composite layers are evaluated through their children".into(),
                ))
            }
        };
        Ok(y)
    }

    /// Gradient w.r.t. this layer's input, given the gradient w.r.t. its output.
    fn backward(&self, x: &Tensor, y: &Tensor, grad: &Tensor) -> Result<Tensor, InferenceError> {
        let dx = match self {
            Layer::Conv2d(conv) => conv.backward(view4(x)?, view4(grad)?)?.into_dyn(),
            Layer::Dense(dense) => view2(grad)?.dot(&dense.weights.t()).into_dyn(),
            Layer::BatchNorm(bn) => grad * &bn.scale,
            Layer::MaxPool2d { pool, stride } => {
                let x4 = view4(x)?;
                let g4 = view4(grad)?;
                let mut dx = Array4::<f32>::zeros(x4.raw_dim());
                for ((b, oy, ox, ch), &g) in g4.indexed_iter() {
                    let (mut best, mut at) = (f32::NEG_INFINITY, (oy * stride, ox * stride));
                    for dy in 0..*pool {
                        for dxx in 0..*pool {
                            let (iy, ix) = (oy * stride + dy, ox * stride + dxx);
                            let v = x4[[b, iy, ix, ch]];
                            if v > best {
                                best = v;
                                at = (iy, ix);
                            }
                        }
                    }
                    dx[[b, at.0, at.1, ch]] += g;
                }
                dx.into_dyn()
            }
            Layer::GlobalAveragePool => {
                let x4 = view4(x)?;
                let g2 = view2(grad)?;
                let (n, h, w, c) = x4.dim();
                let area = (h * w) as f32;
                Array4::from_shape_fn((n, h, w, c), |(b, _, _, ch)| g2[[b, ch]] / area).into_dyn()
            }
            Layer::Flatten => grad
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(IxDyn(x.shape()))?,
            Layer::Relu => {
                let mut dx = grad.clone();
                dx.zip_mut_with(x, |g, &v| {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                });
                dx
            }
            Layer::Sigmoid => {
                let mut dx = grad.clone();
                dx.zip_mut_with(y, |g, &s| *g *= s * (1.0 - s));
                dx
            }
            Layer::Softmax => {
                let axis = Axis(y.ndim().saturating_sub(1));
                let mut dx = grad.clone();
                for (mut d, yl) in dx.lanes_mut(axis).into_iter().zip(y.lanes(axis)) {
                    let dot: f32 = d.iter().zip(yl.iter()).map(|(g, s)| g * s).sum();
                    Zip::from(&mut d).and(&yl).for_each(|g, &s| *g = s * (*g - dot));
                }
                dx
            }
            Layer::Dropout => grad.clone(),
            Layer::Sequential(_) => {
                return Err(InferenceError::Forward(
                    "composite layers have no direct gradient".into(),
                ))
            }
        };
        Ok(dx)
    }
}

// ═══════════════════════════════════════════════════════════
// Building from spec (shape propagation + weight validation)
// ═══════════════════════════════════════════════════════════

fn expect_len(name: &str, what: &str, got: usize, want: usize) -> Result<(), SpecError> {
    if got != want {
        return Err(SpecError(format!(
            "layer '{name}': {what} has {got} values, expected {want}"
        )));
    }
    Ok(())
}

fn bias_or_zeros(name: &str, bias: &[f32], n: usize) -> Result<Array1<f32>, SpecError> {
    if bias.is_empty() {
        return Ok(Array1::zeros(n));
    }
    expect_len(name, "bias", bias.len(), n)?;
    Ok(Array1::from(bias.to_vec()))
}

fn spatial(name: &str, shape: Shape) -> Result<(usize, usize, usize), SpecError> {
    match shape {
        Shape::Spatial { h, w, c } => Ok((h, w, c)),
        Shape::Flat(_) => Err(SpecError(format!(
            "layer '{name}' needs a spatial (H, W, C) input"
        ))),
    }
}

fn build_node(
    spec: &LayerSpec,
    input: Shape,
    names: &mut HashSet<String>,
) -> Result<(Node, Shape), SpecError> {
    let name = match spec {
        LayerSpec::Conv2d { name, .. }
        | LayerSpec::Dense { name, .. }
        | LayerSpec::BatchNorm { name, .. }
        | LayerSpec::MaxPool2d { name, .. }
        | LayerSpec::GlobalAveragePool { name }
        | LayerSpec::Flatten { name }
        | LayerSpec::Relu { name }
        | LayerSpec::Sigmoid { name }
        | LayerSpec::Softmax { name }
        | LayerSpec::Dropout { name, .. }
        | LayerSpec::Sequential { name, .. } => name.clone(),
    };
    if !names.insert(name.clone()) {
        return Err(SpecError(format!("duplicate layer name '{name}'")));
    }

    let (layer, output) = match spec {
        LayerSpec::Conv2d { filters, kernel_size, stride, padding, weights, bias, .. } => {
            let (h, w, c) = spatial(&name, input)?;
            if *stride == 0 || *kernel_size == 0 || *filters == 0 {
                return Err(SpecError(format!("layer '{name}': zero-sized conv parameter")));
            }
            let k = *kernel_size;
            expect_len(&name, "weights", weights.len(), k * k * c * filters)?;
            let conv = Conv2d {
                kernel: Array4::from_shape_vec((k, k, c, *filters), weights.clone())
                    .map_err(|e| SpecError(format!("layer '{name}': {e}")))?,
                bias: bias_or_zeros(&name, bias, *filters)?,
                stride: *stride,
                padding: *padding,
            };
            let g = conv
                .geometry(h, w)
                .ok_or_else(|| SpecError(format!("layer '{name}': input {h}x{w} smaller than kernel")))?;
            (
                Layer::Conv2d(conv),
                Shape::Spatial { h: g.out_h, w: g.out_w, c: *filters },
            )
        }
        LayerSpec::Dense { units, weights, bias, .. } => {
            let inputs = match input {
                Shape::Flat(n) => n,
                Shape::Spatial { .. } => {
                    return Err(SpecError(format!(
                        "layer '{name}': dense needs a flat input (add flatten or global_average_pool)"
                    )))
                }
            };
            expect_len(&name, "weights", weights.len(), inputs * units)?;
            let dense = Dense {
                weights: Array2::from_shape_vec((inputs, *units), weights.clone())
                    .map_err(|e| SpecError(format!("layer '{name}': {e}")))?,
                bias: bias_or_zeros(&name, bias, *units)?,
            };
            (Layer::Dense(dense), Shape::Flat(*units))
        }
        LayerSpec::BatchNorm { gamma, beta, moving_mean, moving_variance, epsilon, .. } => {
            let c = input.channels();
            for (what, v) in [
                ("gamma", gamma),
                ("beta", beta),
                ("moving_mean", moving_mean),
                ("moving_variance", moving_variance),
            ] {
                expect_len(&name, what, v.len(), c)?;
            }
            let scale: Array1<f32> = gamma
                .iter()
                .zip(moving_variance)
                .map(|(g, var)| g / (var + epsilon).sqrt())
                .collect();
            let shift: Array1<f32> = beta
                .iter()
                .zip(moving_mean)
                .zip(scale.iter())
                .map(|((b, m), s)| b - m * s)
                .collect();
            (Layer::BatchNorm(BatchNorm { scale, shift }), input)
        }
        LayerSpec::MaxPool2d { pool_size, stride, .. } => {
            let (h, w, c) = spatial(&name, input)?;
            let stride = stride.unwrap_or(*pool_size);
            if *pool_size == 0 || stride == 0 || h < *pool_size || w < *pool_size {
                return Err(SpecError(format!("layer '{name}': invalid pooling for {h}x{w}")));
            }
            (
                Layer::MaxPool2d { pool: *pool_size, stride },
                Shape::Spatial {
                    h: (h - pool_size) / stride + 1,
                    w: (w - pool_size) / stride + 1,
                    c,
                },
            )
        }
        LayerSpec::GlobalAveragePool { .. } => {
            let (_, _, c) = spatial(&name, input)?;
            (Layer::GlobalAveragePool, Shape::Flat(c))
        }
        LayerSpec::Flatten { .. } => {
            let flat = match input {
                Shape::Spatial { h, w, c } => h * w * c,
                Shape::Flat(n) => n,
            };
            (Layer::Flatten, Shape::Flat(flat))
        }
        LayerSpec::Relu { .. } => (Layer::Relu, input),
        LayerSpec::Sigmoid { .. } => (Layer::Sigmoid, input),
        LayerSpec::Softmax { .. } => (Layer::Softmax, input),
        LayerSpec::Dropout { .. } => (Layer::Dropout, input),
        LayerSpec::Sequential { layers, .. } => {
            if layers.is_empty() {
                return Err(SpecError(format!("layer '{name}': empty sequential block")));
            }
            let mut shape = input;
            let mut children = Vec::with_capacity(layers.len());
            for child in layers {
                let (node, out) = build_node(child, shape, names)?;
                children.push(node);
                shape = out;
            }
            (Layer::Sequential(children), shape)
        }
    };

    Ok((Node { name, layer }, output))
}

// ═══════════════════════════════════════════════════════════
// Network
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    input: InputSpec,
    nodes: Vec<Node>,
    outputs: usize,
}

impl Network {
    /// Read and validate a JSON model file.
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let load_failure = |reason: String| InferenceError::ModelLoadFailure {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read(path).map_err(|e| load_failure(e.to_string()))?;
        let spec: NetworkSpec =
            serde_json::from_slice(&raw).map_err(|e| load_failure(format!("invalid model file: {e}")))?;
        Self::from_spec(spec).map_err(|e| load_failure(e.to_string()))
    }

    pub fn from_spec(spec: NetworkSpec) -> Result<Self, SpecError> {
        let InputSpec { height, width, channels } = spec.input;
        if height == 0 || width == 0 || channels == 0 {
            return Err(SpecError("input dimensions must be non-zero".into()));
        }
        if spec.layers.is_empty() {
            return Err(SpecError("model has no layers".into()));
        }

        let mut names = HashSet::new();
        let mut shape = Shape::Spatial { h: height, w: width, c: channels };
        let mut nodes = Vec::with_capacity(spec.layers.len());
        for layer in &spec.layers {
            let (node, out) = build_node(layer, shape, &mut names)?;
            nodes.push(node);
            shape = out;
        }
        let outputs = match shape {
            Shape::Flat(n) => n,
            Shape::Spatial { .. } => {
                return Err(SpecError("model output must be flat (N, classes)".into()))
            }
        };

        Ok(Self { name: spec.name, input: spec.input, nodes, outputs })
    }

    pub fn input(&self) -> InputSpec {
        self.input
    }

    /// Number of output entries per sample.
    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor, InferenceError> {
        self.check_input(x)?;
        run_nodes(&self.nodes, x.clone(), None)
    }

    /// Forward pass that records every leaf layer on a tape.
    pub fn forward_recorded(&self, x: &Tensor) -> Result<(Tensor, GradientTape<'_>), InferenceError> {
        self.check_input(x)?;
        let mut entries = Vec::new();
        let out = run_nodes(&self.nodes, x.clone(), Some(&mut entries))?;
        Ok((out, GradientTape { entries }))
    }

    fn check_input(&self, x: &Tensor) -> Result<(), InferenceError> {
        let want = [self.input.height, self.input.width, self.input.channels];
        match x.shape() {
            [_, h, w, c] if [*h, *w, *c] == want => Ok(()),
            other => Err(InferenceError::Forward(format!(
                "input shape {other:?} does not match (N, {}, {}, {})",
                want[0], want[1], want[2]
            ))),
        }
    }

    /// All nodes depth-first, composites before their children.
    pub fn layers_depth_first(&self) -> Vec<&Node> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for node in nodes {
                out.push(node);
                if let Layer::Sequential(children) = &node.layer {
                    walk(children, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    /// Last leaf layer whose implementation name contains "conv".
    pub fn find_last_conv_layer(&self) -> Option<&str> {
        self.layers_depth_first()
            .into_iter()
            .filter(|n| !matches!(n.layer, Layer::Sequential(_)))
            .filter(|n| n.layer.kind_name().to_ascii_lowercase().contains("conv"))
            .last()
            .map(|n| n.name.as_str())
    }

    pub fn contains_layer(&self, name: &str) -> bool {
        self.layers_depth_first().iter().any(|n| n.name == name)
    }

    /// Leaf whose output stands for `name` (composites map to their last leaf).
    pub fn probe_leaf(&self, name: &str) -> Option<&str> {
        fn last_leaf(node: &Node) -> &Node {
            match &node.layer {
                Layer::Sequential(children) => children.last().map(last_leaf).unwrap_or(node),
                _ => node,
            }
        }
        self.layers_depth_first()
            .into_iter()
            .find(|n| n.name == name)
            .map(|n| last_leaf(n).name.as_str())
    }
}

fn run_nodes<'a>(
    nodes: &'a [Node],
    mut x: Tensor,
    mut tape: Option<&mut Vec<TapeEntry<'a>>>,
) -> Result<Tensor, InferenceError> {
    for node in nodes {
        x = match &node.layer {
            Layer::Sequential(children) => {
                run_nodes(children, x, tape.as_mut().map(|t| &mut **t))?
            }
            leaf => {
                let y = leaf
                    .forward(&x)
                    .map_err(|e| InferenceError::Forward(format!("layer '{}': {e}", node.name)))?;
                if let Some(entries) = tape.as_mut() {
                    entries.push(TapeEntry { node, input: x, output: y.clone() });
                }
                y
            }
        };
    }
    Ok(x)
}

// ═══════════════════════════════════════════════════════════
// Gradient tape
// ═══════════════════════════════════════════════════════════

struct TapeEntry<'a> {
    node: &'a Node,
    input: Tensor,
    output: Tensor,
}

/// Recorded forward pass, replayed backwards for gradients.
pub struct GradientTape<'a> {
    entries: Vec<TapeEntry<'a>>,
}

impl GradientTape<'_> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Activations of `layer` and the gradient of the score w.r.t. them.
    ///
    /// `seed` is dScore/dOutput for the network's final output. Returns
    /// `None` when `layer` never ran on this tape.
    pub fn gradient_wrt(
        &self,
        layer: &str,
        seed: Tensor,
    ) -> Result<Option<(Tensor, Tensor)>, InferenceError> {
        let Some(last) = self.entries.last() else {
            return Ok(None);
        };
        if seed.shape() != last.output.shape() {
            return Err(InferenceError::Forward(format!(
                "gradient seed shape {:?} does not match output {:?}",
                seed.shape(),
                last.output.shape()
            )));
        }

        let mut grad = seed;
        for entry in self.entries.iter().rev() {
            if entry.node.name == layer {
                return Ok(Some((entry.output.clone(), grad)));
            }
            grad = entry
                .node
                .layer
                .backward(&entry.input, &entry.output, &grad)
                .map_err(|e| InferenceError::Forward(format!("backward '{}': {e}", entry.node.name)))?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn network(value: serde_json::Value) -> Network {
        let spec: NetworkSpec = serde_json::from_value(value).unwrap();
        Network::from_spec(spec).unwrap()
    }

    fn ones_input(h: usize, w: usize, c: usize) -> Tensor {
        Array4::<f32>::ones((1, h, w, c)).into_dyn()
    }

    #[test]
    fn same_padding_keeps_spatial_size() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 5, "width": 7, "channels": 1},
            "layers": [
                {"type": "conv2d", "name": "c", "filters": 2, "kernel_size": 3, "padding": "same",
                 "weights": vec![1.0; 18]},
                {"type": "flatten", "name": "f"}
            ]
        }));
        assert_eq!(net.outputs(), 5 * 7 * 2);
        let out = net.forward(&ones_input(5, 7, 1)).unwrap();
        assert_eq!(out.shape(), &[1, 70]);
        // Centre pixel sees all nine ones, corner only four.
        let out = out.into_shape_with_order(IxDyn(&[1, 5, 7, 2])).unwrap();
        assert_eq!(out[[0, 2, 3, 0]], 9.0);
        assert_eq!(out[[0, 0, 0, 1]], 4.0);
    }

    #[test]
    fn wrong_weight_count_is_rejected() {
        let spec: NetworkSpec = serde_json::from_value(json!({
            "name": "t",
            "input": {"height": 4, "width": 4},
            "layers": [
                {"type": "conv2d", "name": "c", "filters": 2, "kernel_size": 3, "weights": [1.0, 2.0]}
            ]
        }))
        .unwrap();
        let err = Network::from_spec(spec).unwrap_err();
        assert!(err.to_string().contains("weights"));
    }

    #[test]
    fn dense_on_spatial_input_is_rejected() {
        let spec: NetworkSpec = serde_json::from_value(json!({
            "name": "t",
            "input": {"height": 2, "width": 2},
            "layers": [{"type": "dense", "name": "d", "units": 1, "weights": [1.0]}]
        }))
        .unwrap();
        assert!(Network::from_spec(spec).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let spec: NetworkSpec = serde_json::from_value(json!({
            "name": "t",
            "input": {"height": 2, "width": 2},
            "layers": [
                {"type": "relu", "name": "x"},
                {"type": "global_average_pool", "name": "x"}
            ]
        }))
        .unwrap();
        assert!(Network::from_spec(spec).is_err());
    }

    #[test]
    fn last_conv_search_descends_into_nested_blocks() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 6, "width": 6, "channels": 1},
            "layers": [
                {"type": "conv2d", "name": "stem_conv", "filters": 1, "kernel_size": 1, "weights": [1.0]},
                {"type": "sequential", "name": "backbone", "layers": [
                    {"type": "sequential", "name": "block", "layers": [
                        {"type": "conv2d", "name": "block_conv", "filters": 1, "kernel_size": 1, "weights": [1.0]},
                        {"type": "relu", "name": "block_relu"}
                    ]}
                ]},
                {"type": "global_average_pool", "name": "gap"},
                {"type": "dense", "name": "head", "units": 1, "weights": [1.0]}
            ]
        }));
        assert_eq!(net.find_last_conv_layer(), Some("block_conv"));
        assert!(net.contains_layer("backbone"));
        assert_eq!(net.probe_leaf("backbone"), Some("block_relu"));
        assert_eq!(net.probe_leaf("missing"), None);
    }

    #[test]
    fn network_without_conv_has_no_probe_layer() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 2, "width": 2},
            "layers": [
                {"type": "global_average_pool", "name": "gap"},
                {"type": "dense", "name": "head", "units": 1, "weights": [1.0, 1.0, 1.0]}
            ]
        }));
        assert_eq!(net.find_last_conv_layer(), None);
    }

    #[test]
    fn gap_dense_sigmoid_gradient_matches_closed_form() {
        // score = sigmoid(w . mean(A) + b)  =>  dS/dA[y,x,k] = s(1-s) w_k / (H*W)
        let net = network(json!({
            "name": "t",
            "input": {"height": 2, "width": 2, "channels": 2},
            "layers": [
                {"type": "relu", "name": "act"},
                {"type": "global_average_pool", "name": "gap"},
                {"type": "dense", "name": "head", "units": 1, "weights": [0.5, -2.0], "bias": [0.1]},
                {"type": "sigmoid", "name": "out"}
            ]
        }));
        let x = Array4::from_shape_fn((1, 2, 2, 2), |(_, y, x, c)| (y + x + c) as f32 * 0.25).into_dyn();
        let (out, tape) = net.forward_recorded(&x).unwrap();
        assert_eq!(tape.len(), 4);
        let s = out[[0, 0]];

        let seed = Array2::<f32>::ones((1, 1)).into_dyn();
        let (act, grad) = tape.gradient_wrt("act", seed).unwrap().unwrap();
        assert_eq!(act.shape(), &[1, 2, 2, 2]);
        let expected = [s * (1.0 - s) * 0.5 / 4.0, s * (1.0 - s) * -2.0 / 4.0];
        for ((_, _, _, k), g) in grad.into_dimensionality::<Ix4>().unwrap().indexed_iter() {
            assert!((g - expected[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn conv_backward_routes_gradient_to_overlapping_inputs() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 3, "width": 3, "channels": 1},
            "layers": [
                {"type": "relu", "name": "in"},
                {"type": "conv2d", "name": "c", "filters": 1, "kernel_size": 3, "padding": "same",
                 "weights": vec![1.0; 9]},
                {"type": "flatten", "name": "f"}
            ]
        }));
        let (_, tape) = net.forward_recorded(&ones_input(3, 3, 1)).unwrap();
        let seed = Array2::<f32>::ones((1, 9)).into_dyn();
        let (_, grad) = tape.gradient_wrt("in", seed).unwrap().unwrap();
        let grad = grad.into_dimensionality::<Ix4>().unwrap();
        assert_eq!(grad[[0, 1, 1, 0]], 9.0);
        assert_eq!(grad[[0, 0, 0, 0]], 4.0);
        assert_eq!(grad[[0, 0, 1, 0]], 6.0);
    }

    #[test]
    fn max_pool_backward_hits_only_the_maximum() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 2, "width": 2, "channels": 1},
            "layers": [
                {"type": "dropout", "name": "in", "rate": 0.5},
                {"type": "max_pool2d", "name": "pool", "pool_size": 2},
                {"type": "flatten", "name": "f"}
            ]
        }));
        let x = Array4::from_shape_vec((1, 2, 2, 1), vec![0.1, 0.9, 0.3, 0.2]).unwrap().into_dyn();
        let (out, tape) = net.forward_recorded(&x).unwrap();
        assert_eq!(out[[0, 0]], 0.9);
        let (_, grad) = tape
            .gradient_wrt("in", Array2::<f32>::ones((1, 1)).into_dyn())
            .unwrap()
            .unwrap();
        assert_eq!(grad.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn softmax_outputs_sum_to_one_and_gradients_cancel() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 1, "width": 1, "channels": 3},
            "layers": [
                {"type": "flatten", "name": "f"},
                {"type": "softmax", "name": "probs"}
            ]
        }));
        let x = Array4::from_shape_vec((1, 1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap().into_dyn();
        let (out, tape) = net.forward_recorded(&x).unwrap();
        assert!((out.sum() - 1.0).abs() < 1e-6);

        let mut seed = Array2::<f32>::zeros((1, 3));
        seed[[0, 2]] = 1.0;
        let (_, grad) = tape.gradient_wrt("f", seed.into_dyn()).unwrap().unwrap();
        assert!(grad.sum().abs() < 1e-6);
        assert!(grad[[0, 2]] > 0.0);
    }

    #[test]
    fn batch_norm_is_folded_affine() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 1, "width": 1, "channels": 1},
            "layers": [
                {"type": "batch_norm", "name": "bn", "gamma": [2.0], "beta": [1.0],
                 "moving_mean": [0.5], "moving_variance": [1.0], "epsilon": 0.0},
                {"type": "flatten", "name": "f"}
            ]
        }));
        let out = net.forward(&ones_input(1, 1, 1)).unwrap();
        assert!((out[[0, 0]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_layer_is_disconnected() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 1, "width": 1, "channels": 1},
            "layers": [{"type": "flatten", "name": "f"}]
        }));
        let (_, tape) = net.forward_recorded(&ones_input(1, 1, 1)).unwrap();
        let seed = Array2::<f32>::ones((1, 1)).into_dyn();
        assert!(tape.gradient_wrt("nope", seed).unwrap().is_none());
    }

    #[test]
    fn mismatched_input_shape_is_a_forward_error() {
        let net = network(json!({
            "name": "t",
            "input": {"height": 4, "width": 4},
            "layers": [{"type": "global_average_pool", "name": "gap"}]
        }));
        assert!(matches!(
            net.forward(&ones_input(3, 4, 3)),
            Err(InferenceError::Forward(_))
        ));
    }
}
