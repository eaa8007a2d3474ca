//! Trains [`rps_net`] from a directory of labeled images.
//!
//! The dataset directory holds one sub-directory per label (`rock/`,
//! `paper/`, `scissors/`). Images go through the same decoder as served
//! frames, rescaled to 0..1. Within each class, files are sorted by name and
//! the leading `validation_split` fraction is held out for validation.

use crate::classifier::LabelTable;
use crate::config::TrainSettings;
use crate::decoder::{DecodedImage, ImageDecoder, PixelScale};
use crate::gesture::Gesture;
use crate::torch::{batch_tensor, rps_net};
use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tch::nn::{self, Module, OptimizerConfig};
use tch::{no_grad, Device, Kind, Tensor};
use tracing::{debug, info, warn};

/// An image file and its class index
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

#[derive(Debug, Default)]
pub struct Dataset {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
}

/// Metrics for one pass over the training set
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// Split sorted class files into (training, validation)
pub fn split_class(mut files: Vec<PathBuf>, validation_split: f64) -> (Vec<PathBuf>, Vec<PathBuf>) {
    files.sort();
    let held_out = (files.len() as f64 * validation_split) as usize;
    let train = files.split_off(held_out);
    (train, files)
}

/// Collect the labeled images under `dir`
pub fn scan_dataset(dir: &Path, labels: &LabelTable, validation_split: f64) -> Result<Dataset> {
    let mut per_class: Vec<Vec<PathBuf>> = vec![Vec::new(); labels.len()];

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read dataset {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(index) = name
            .parse::<Gesture>()
            .ok()
            .and_then(|g| labels.position(g))
        else {
            warn!("ignoring unlabeled directory {}", path.display());
            continue;
        };

        for file in fs::read_dir(&path)? {
            let file = file?.path();
            if file.is_file() {
                per_class[index].push(file);
            }
        }
    }

    let mut dataset = Dataset::default();
    for (index, files) in per_class.into_iter().enumerate() {
        if files.is_empty() {
            bail!(
                "no images for class '{}' in {}",
                labels.get(index).map(|g| g.as_str()).unwrap_or("?"),
                dir.display()
            );
        }
        let (train, validation) = split_class(files, validation_split);
        let sample = |path| Sample { path, label: index };
        dataset.train.extend(train.into_iter().map(sample));
        dataset.validation.extend(validation.into_iter().map(sample));
    }

    info!(
        "found {} training and {} validation images in {} classes",
        dataset.train.len(),
        dataset.validation.len(),
        labels.len()
    );
    Ok(dataset)
}

pub struct Trainer {
    settings: TrainSettings,
    decoder: ImageDecoder,
    labels: LabelTable,
    device: Device,
}

impl Trainer {
    pub fn new(settings: TrainSettings, decoder: ImageDecoder, labels: LabelTable) -> Self {
        Self {
            settings,
            decoder: decoder.with_scale(PixelScale::Unit),
            labels,
            device: Device::cuda_if_available(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Train, save the weights and return the per-epoch history
    pub fn run(&self) -> Result<Vec<EpochMetrics>> {
        let mut dataset = scan_dataset(
            &self.settings.dataset_dir,
            &self.labels,
            self.settings.validation_split,
        )?;

        let vs = nn::VarStore::new(self.device);
        let net = rps_net(&vs.root(), self.labels.len());
        let mut opt = nn::Adam::default().build(&vs, self.settings.learning_rate)?;

        let mut history = Vec::with_capacity(self.settings.epochs);
        for epoch in 1..=self.settings.epochs {
            dataset.train.shuffle(&mut rand::thread_rng());

            let mut totals = Totals::default();
            for batch in dataset.train.chunks(self.settings.batch_size) {
                let Some((xs, ys)) = self.load_batch(batch)? else {
                    continue;
                };
                let logits = net.forward(&xs);
                let loss = logits.cross_entropy_for_logits(&ys);
                opt.backward_step(&loss);
                totals.add(&logits, &ys, &loss);
            }
            if totals.seen == 0 {
                bail!("no training image could be decoded");
            }

            let validation = self.evaluate(&net, &dataset.validation)?;
            let metrics = EpochMetrics {
                epoch,
                loss: totals.loss(),
                accuracy: totals.accuracy(),
                val_loss: validation.as_ref().map(Totals::loss),
                val_accuracy: validation.as_ref().map(Totals::accuracy),
            };
            info!(
                "epoch {}/{}: loss {:.4} accuracy {:.4} val_loss {:?} val_accuracy {:?}",
                epoch,
                self.settings.epochs,
                metrics.loss,
                metrics.accuracy,
                metrics.val_loss,
                metrics.val_accuracy
            );
            history.push(metrics);
        }

        vs.save(&self.settings.output).with_context(|| {
            format!("failed to save weights to {}", self.settings.output.display())
        })?;
        info!("saved weights to {}", self.settings.output.display());

        if let Some(path) = &self.settings.history {
            fs::write(path, serde_json::to_string_pretty(&history)?)
                .with_context(|| format!("failed to write history to {}", path.display()))?;
        }

        Ok(history)
    }

    fn evaluate(&self, net: &nn::Sequential, samples: &[Sample]) -> Result<Option<Totals>> {
        let mut totals = Totals::default();
        for batch in samples.chunks(self.settings.batch_size) {
            let Some((xs, ys)) = self.load_batch(batch)? else {
                continue;
            };
            no_grad(|| {
                let logits = net.forward(&xs);
                let loss = logits.cross_entropy_for_logits(&ys);
                totals.add(&logits, &ys, &loss);
            });
        }
        Ok((totals.seen > 0).then_some(totals))
    }

    /// Decode a batch of samples into input and target tensors. Unreadable
    /// images are skipped
    fn load_batch(&self, batch: &[Sample]) -> Result<Option<(Tensor, Tensor)>> {
        let mut images: Vec<DecodedImage> = Vec::with_capacity(batch.len());
        let mut targets: Vec<i64> = Vec::with_capacity(batch.len());
        for sample in batch {
            let decoded = fs::read(&sample.path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Ok(self.decoder.decode_bytes(&bytes)?));
            match decoded {
                Ok(image) => {
                    images.push(image);
                    targets.push(sample.label as i64);
                }
                Err(e) => warn!("skipping {}: {e}", sample.path.display()),
            }
        }
        if images.is_empty() {
            return Ok(None);
        }
        debug!("loaded batch of {}", images.len());

        let xs = batch_tensor(&images).to_device(self.device);
        let ys = Tensor::from_slice(targets.as_slice()).to_device(self.device);
        Ok(Some((xs, ys)))
    }
}

/// Running sums over the batches of an epoch
#[derive(Debug, Default)]
struct Totals {
    loss_sum: f64,
    correct: i64,
    seen: i64,
}

impl Totals {
    fn add(&mut self, logits: &Tensor, targets: &Tensor, loss: &Tensor) {
        let n = targets.size()[0];
        self.loss_sum += loss.double_value(&[]) * n as f64;
        self.correct += logits
            .argmax(-1, false)
            .eq_tensor(targets)
            .sum(Kind::Int64)
            .int64_value(&[]);
        self.seen += n;
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.seen as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.seen as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Model;
    use crate::torch::NativeModel;
    use crate::util::test::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_split_holds_out_leading_files() {
        let (train, val) = split_class(paths(&["e", "a", "d", "b", "c"]), 0.2);
        assert_eq!(val, paths(&["a"]));
        assert_eq!(train, paths(&["b", "c", "d", "e"]));

        let (train, val) = split_class(paths(&["a", "b", "c"]), 0.2);
        assert!(val.is_empty());
        assert_eq!(train.len(), 3);

        let (train, val) = split_class(paths(&["a", "b"]), 0.0);
        assert!(val.is_empty());
        assert_eq!(train.len(), 2);
    }

    /// Write `per_class` solid frames for each gesture, plus noise
    fn write_dataset(name: &str, per_class: usize) -> PathBuf {
        let root = scratch_dir(name);
        let colors = [[200, 40, 40], [40, 200, 40], [40, 40, 200]];
        for (gesture, rgb) in Gesture::ALL.iter().zip(colors) {
            let dir = root.join(gesture.as_str().to_uppercase());
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let png = png_bytes(&solid_rgb(40 + i as u32, 30, rgb));
                fs::write(dir.join(format!("{i:03}.png")), png).unwrap();
            }
            fs::write(dir.join("notes.txt"), "not an image").unwrap();
        }
        fs::create_dir_all(root.join("lizard")).unwrap();
        root
    }

    #[test]
    fn test_scan_dataset() {
        let root = write_dataset("scan", 5);
        let dataset = scan_dataset(&root, &LabelTable::default(), 0.2).unwrap();

        // 5 images + notes.txt per class, the first file of each held out
        assert_eq!(dataset.validation.len(), 3);
        assert_eq!(dataset.train.len(), 15);
        for (index, gesture) in Gesture::ALL.iter().enumerate() {
            let dir = gesture.as_str().to_uppercase();
            assert!(dataset
                .train
                .iter()
                .filter(|s| s.label == index)
                .all(|s| s.path.parent().unwrap().ends_with(&dir)));
        }
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_scan_requires_every_class() {
        let root = write_dataset("missing-class", 2);
        fs::remove_dir_all(root.join("PAPER")).unwrap();
        let err = scan_dataset(&root, &LabelTable::default(), 0.2).unwrap_err();
        assert!(err.to_string().contains("paper"));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_train_and_reload() {
        let root = write_dataset("train", 3);
        let settings = TrainSettings {
            dataset_dir: root.clone(),
            output: root.join("weights.ot"),
            epochs: 1,
            batch_size: 4,
            learning_rate: 1e-3,
            validation_split: 0.34,
            history: Some(root.join("history.json")),
        };
        let trainer = Trainer::new(settings, ImageDecoder::default(), LabelTable::default())
            .with_device(Device::Cpu);

        let history = trainer.run().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].loss.is_finite());
        assert!(history[0].val_accuracy.is_some());

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(root.join("history.json")).unwrap()).unwrap();
        assert_eq!(written[0]["epoch"], 1);

        let model = NativeModel::load(root.join("weights.ot"), 3).unwrap();
        let frame = ImageDecoder::default()
            .with_scale(PixelScale::Unit)
            .decode(&b64_png(&solid_rgb(10, 10, [200, 40, 40])))
            .unwrap();
        assert_eq!(model.predict(&frame).unwrap().len(), 3);

        fs::remove_dir_all(root).unwrap();
    }
}
