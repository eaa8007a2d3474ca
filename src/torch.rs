//! Code for loading and running the trained gesture network with libtorch

use crate::classifier::Model;
use crate::config::{Backend, ModelSettings};
use crate::decoder::{DecodedImage, INPUT_SHAPE};
use crate::CHANNELS;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tch::nn::{self, Module};
use tch::{no_grad, Device, Kind, Tensor};
use tracing::info;

/// Feature map side after four conv + pool stages on a 150px input
const FINAL_MAP: i64 = 7;

/// Width of the hidden dense layer
const HIDDEN: i64 = 512;

/// Load the configured model from disk
pub fn load_model(settings: &ModelSettings, num_classes: usize) -> Result<Box<dyn Model>> {
    let model: Box<dyn Model> = match settings.backend {
        Backend::TorchScript => Box::new(TorchScriptModel::new(
            &settings.path,
            settings.channels_first,
        )?),
        Backend::Native => Box::new(NativeModel::load(&settings.path, num_classes)?),
    };
    info!(
        "loaded {:?} model from {}",
        settings.backend,
        settings.path.display()
    );
    Ok(model)
}

/// Build an input batch tensor from decoded frames
pub fn batch_tensor(images: &[DecodedImage]) -> Tensor {
    let mut data = Vec::with_capacity(images.len() * DecodedImage::LEN);
    for image in images {
        data.extend_from_slice(image.as_slice());
    }
    Tensor::from_slice(data.as_slice()).view([
        images.len() as i64,
        INPUT_SHAPE[1] as i64,
        INPUT_SHAPE[2] as i64,
        INPUT_SHAPE[3] as i64,
    ])
}

/// Flatten a `[1, classes]` output into a score vector
fn scores(output: &Tensor) -> Result<Vec<f32>> {
    let flat = output.to_kind(Kind::Float).view([-1]);
    Ok(Vec::<f32>::try_from(&flat)?)
}

/// A serialized TorchScript module
#[derive(Debug)]
pub struct TorchScriptModel {
    /// The loaded module. libtorch modules are not reentrant, so forward
    /// passes are serialized
    model: Mutex<tch::CModule>,

    /// Permute NHWC input to NCHW before the forward pass
    channels_first: bool,
}

impl TorchScriptModel {
    pub fn new(filename: impl AsRef<Path>, channels_first: bool) -> Result<Self> {
        let filename = filename.as_ref();
        let mut model = tch::CModule::load(filename)
            .with_context(|| format!("failed to load TorchScript module {}", filename.display()))?;
        model.set_eval();
        Ok(TorchScriptModel {
            model: Mutex::new(model),
            channels_first,
        })
    }
}

impl Model for TorchScriptModel {
    fn predict(&self, image: &DecodedImage) -> Result<Vec<f32>> {
        let mut input = batch_tensor(std::slice::from_ref(image));
        if self.channels_first {
            input = input.permute([0, 3, 1, 2]);
        }

        // A panic mid-forward leaves no partial state in the module
        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let output = no_grad(|| model.forward_ts(&[input]))?;
        scores(&output)
    }
}

/// The gesture CNN: four conv/pool stages followed by two dense layers.
/// Takes NHWC input and returns unnormalized class logits
pub fn rps_net(vs: &nn::Path, num_classes: usize) -> nn::Sequential {
    let conv = |name: &str, c_in: i64, c_out: i64| {
        nn::conv2d(vs / name, c_in, c_out, 3, Default::default())
    };
    nn::seq()
        .add_fn(|xs| xs.permute([0, 3, 1, 2]))
        .add(conv("conv1", CHANNELS as i64, 32))
        .add_fn(|xs| xs.relu().max_pool2d_default(2))
        .add(conv("conv2", 32, 64))
        .add_fn(|xs| xs.relu().max_pool2d_default(2))
        .add(conv("conv3", 64, 128))
        .add_fn(|xs| xs.relu().max_pool2d_default(2))
        .add(conv("conv4", 128, 128))
        .add_fn(|xs| xs.relu().max_pool2d_default(2))
        .add_fn(|xs| xs.flat_view())
        .add(nn::linear(
            vs / "fc1",
            128 * FINAL_MAP * FINAL_MAP,
            HIDDEN,
            Default::default(),
        ))
        .add_fn(|xs| xs.relu())
        .add(nn::linear(
            vs / "fc2",
            HIDDEN,
            num_classes as i64,
            Default::default(),
        ))
}

/// [`rps_net`] with weights written by the trainer
pub struct NativeModel {
    // Owns the parameters referenced by `net`
    _vs: nn::VarStore,
    net: Mutex<nn::Sequential>,
}

impl std::fmt::Debug for NativeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeModel {{ net: {:?} }}", self.net)
    }
}

impl NativeModel {
    /// A network with freshly initialized weights
    pub fn random(num_classes: usize) -> Self {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = rps_net(&vs.root(), num_classes);
        NativeModel {
            _vs: vs,
            net: Mutex::new(net),
        }
    }

    pub fn load(filename: impl AsRef<Path>, num_classes: usize) -> Result<Self> {
        let filename = filename.as_ref();
        let mut vs = nn::VarStore::new(Device::Cpu);
        let net = rps_net(&vs.root(), num_classes);
        vs.load(filename)
            .with_context(|| format!("failed to load weights {}", filename.display()))?;
        Ok(NativeModel {
            _vs: vs,
            net: Mutex::new(net),
        })
    }
}

impl Model for NativeModel {
    fn predict(&self, image: &DecodedImage) -> Result<Vec<f32>> {
        let input = batch_tensor(std::slice::from_ref(image));
        let net = self.net.lock().unwrap_or_else(PoisonError::into_inner);
        let output = no_grad(|| net.forward(&input).softmax(-1, Some(Kind::Float)));
        scores(&output)
    }
}
