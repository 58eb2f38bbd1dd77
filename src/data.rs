use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufReader, Read as _};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const IMAGE_SIZE: usize = 32;
pub const CHANNELS: usize = 3;
const PIXELS: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
const RECORD_BYTES: usize = 1 + PIXELS;
const PAD: usize = 4;

/// A single example: label byte plus CHW pixel bytes.
#[derive(Debug, Clone)]
pub struct Example {
    pub label: i64,
    pub pixels: Vec<u8>,
}

/// A batch of images in [0, 1] and integer class targets.
#[derive(Clone, Debug)]
pub struct CifarBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// Read one CIFAR-10 binary file (fixed 3073-byte records) to exhaustion.
pub fn load_records(path: &Path) -> Result<Vec<Example>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut examples = Vec::new();
    let mut record = [0u8; RECORD_BYTES];

    loop {
        match reader.read_exact(&mut record) {
            Ok(()) => examples.push(Example {
                label: record[0] as i64,
                pixels: record[1..].to_vec(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "failed to read record stream at {}: {err}",
                    path.display()
                ));
            }
        }
    }

    Ok(examples)
}

/// Load the training or test split from a CIFAR-10 binary directory.
pub fn load_split(data_dir: &Path, train: bool) -> Result<Vec<Example>> {
    let files: Vec<String> = if train {
        (1..=5).map(|i| format!("data_batch_{i}.bin")).collect()
    } else {
        vec!["test_batch.bin".to_string()]
    };

    let mut examples = Vec::new();
    for file in files {
        examples.extend(load_records(&data_dir.join(file))?);
    }
    if examples.is_empty() {
        return Err(anyhow::anyhow!(
            "no examples found under {}",
            data_dir.display()
        ));
    }
    Ok(examples)
}

#[derive(Clone)]
pub struct CifarDataset {
    examples: Vec<Arc<Example>>,
}

impl CifarDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self {
            examples: examples.into_iter().map(Arc::new).collect(),
        }
    }
}

impl Dataset<Arc<Example>> for CifarDataset {
    fn get(&self, index: usize) -> Option<Arc<Example>> {
        self.examples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

#[derive(Clone)]
pub struct CifarBatcher {
    augment: bool,
    rng: Arc<Mutex<StdRng>>,
}

impl CifarBatcher {
    pub fn new(augment: bool, seed: u64) -> Self {
        Self {
            augment,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, Arc<Example>, CifarBatch<B>> for CifarBatcher {
    fn batch(&self, items: Vec<Arc<Example>>, device: &B::Device) -> CifarBatch<B> {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * PIXELS);
        let mut labels = Vec::with_capacity(batch_size);
        let mut rng = self.rng.lock().expect("rng lock poisoned");

        for item in &items {
            let image = if self.augment {
                augment(&item.pixels, &mut *rng)
            } else {
                item.pixels.clone()
            };
            pixels.extend(image.iter().map(|&p| p as f32 / 255.0));
            labels.push(item.label);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, CHANNELS, IMAGE_SIZE, IMAGE_SIZE]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        CifarBatch { images, targets }
    }
}

/// Standard CIFAR augmentation: 4-pixel reflection pad + random crop, then
/// random horizontal flip.
fn augment(pixels: &[u8], rng: &mut impl Rng) -> Vec<u8> {
    let shift_x = rng.gen_range(0..=2 * PAD);
    let shift_y = rng.gen_range(0..=2 * PAD);
    let flip = rng.gen_bool(0.5);

    let mut out = vec![0u8; PIXELS];
    for c in 0..CHANNELS {
        let plane = &pixels[c * IMAGE_SIZE * IMAGE_SIZE..(c + 1) * IMAGE_SIZE * IMAGE_SIZE];
        for y in 0..IMAGE_SIZE {
            for x in 0..IMAGE_SIZE {
                // Source coordinate in the reflection-padded image.
                let src_y = reflect(y + shift_y);
                let src_x = reflect(x + shift_x);
                let src_x = if flip { IMAGE_SIZE - 1 - src_x } else { src_x };
                out[c * IMAGE_SIZE * IMAGE_SIZE + y * IMAGE_SIZE + x] =
                    plane[src_y * IMAGE_SIZE + src_x];
            }
        }
    }
    out
}

/// Map a padded coordinate back into the image by reflecting at the borders.
fn reflect(padded: usize) -> usize {
    let coord = padded as isize - PAD as isize;
    let max = IMAGE_SIZE as isize - 1;
    let reflected = if coord < 0 {
        -coord
    } else if coord > max {
        2 * max - coord
    } else {
        coord
    };
    reflected as usize
}

/// Build the training and validation loaders with worker prefetch.
pub fn loaders<B: Backend>(
    data_dir: &Path,
    batch_size: usize,
    threads: usize,
    seed: u64,
    device: &B::Device,
) -> Result<(
    Arc<dyn DataLoader<B, CifarBatch<B>>>,
    Arc<dyn DataLoader<B, CifarBatch<B>>>,
)> {
    let train_examples = load_split(data_dir, true)?;
    let test_examples = load_split(data_dir, false)?;
    tracing::info!(
        train = train_examples.len(),
        test = test_examples.len(),
        "loaded CIFAR-10 splits"
    );

    let train_loader =
        DataLoaderBuilder::<B, Arc<Example>, CifarBatch<B>>::new(CifarBatcher::new(true, seed))
            .batch_size(batch_size)
            .shuffle(seed)
            .num_workers(threads)
            .set_device(device.clone())
            .build(CifarDataset::new(train_examples));

    let test_loader =
        DataLoaderBuilder::<B, Arc<Example>, CifarBatch<B>>::new(CifarBatcher::new(false, seed))
            .batch_size(batch_size)
            .num_workers(threads)
            .set_device(device.clone())
            .build(CifarDataset::new(test_examples));

    Ok((train_loader, test_loader))
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn record(label: u8, fill: u8) -> Vec<u8> {
        let mut record = vec![label];
        record.extend(std::iter::repeat(fill).take(PIXELS));
        record
    }

    #[test]
    fn load_records_decodes_fixed_size_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_batch_1.bin");
        let mut bytes = record(3, 128);
        bytes.extend(record(9, 255));
        std::fs::write(&path, bytes).unwrap();

        let examples = load_records(&path).unwrap();

        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].label, 3);
        assert_eq!(examples[1].label, 9);
        assert_eq!(examples[0].pixels.len(), PIXELS);
    }

    #[test]
    fn batcher_scales_pixels_into_unit_range() {
        let device = Default::default();
        let batcher = CifarBatcher::new(false, 7);
        let items = vec![Arc::new(Example {
            label: 5,
            pixels: vec![255; PIXELS],
        })];

        let batch: CifarBatch<TestBackend> = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [1, 3, 32, 32]);
        let max: f32 = batch.images.max().into_scalar().elem();
        assert!((max - 1.0).abs() < 1e-6);
        assert_eq!(
            batch
                .targets
                .to_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .unwrap(),
            vec![5]
        );
    }

    #[test]
    fn augmentation_keeps_the_plane_layout() {
        let mut rng = StdRng::seed_from_u64(1);
        let pixels: Vec<u8> = (0..PIXELS).map(|i| (i % 251) as u8).collect();
        let out = augment(&pixels, &mut rng);
        assert_eq!(out.len(), PIXELS);
    }

    #[test]
    fn reflect_maps_padded_coordinates_into_bounds() {
        for padded in 0..(IMAGE_SIZE + 2 * PAD) {
            let mapped = reflect(padded);
            assert!(mapped < IMAGE_SIZE, "coordinate {padded} mapped to {mapped}");
        }
    }
}
