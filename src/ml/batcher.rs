//! バッチ作成とデータ拡張

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

use crate::ml::dataset::ImageItem;
use crate::ml::ml_model::{load_rgb_image, normalize_rgb};

/// 学習データに適用するランダム拡張
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AugmentConfig {
    /// 確率0.5で左右反転
    pub horizontal_flip: bool,
    /// 縦横独立に [1 - zoom_range, 1 + zoom_range] 倍のズーム
    pub zoom_range: f32,
}

impl AugmentConfig {
    pub fn is_noop(&self) -> bool {
        !self.horizontal_flip && self.zoom_range <= 0.0
    }

    /// 1枚の画像に拡張を適用
    pub fn apply<R: Rng>(&self, img: RgbImage, rng: &mut R) -> RgbImage {
        let mut img = img;
        if self.horizontal_flip && rng.gen_bool(0.5) {
            image::imageops::flip_horizontal_in_place(&mut img);
        }
        if self.zoom_range > 0.0 {
            let low = 1.0 - self.zoom_range;
            let high = 1.0 + self.zoom_range;
            let zx = rng.gen_range(low..=high);
            let zy = rng.gen_range(low..=high);
            img = zoom(&img, zx, zy);
        }
        img
    }
}

/// 中心を基準にズーム（1未満で拡大、1超で縮小）。範囲外は最も近い端の画素で埋める
pub fn zoom(img: &RgbImage, zx: f32, zy: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    RgbImage::from_fn(width, height, |x, y| {
        let sx = (cx + (x as f32 - cx) * zx).round().clamp(0.0, max_x) as u32;
        let sy = (cy + (y as f32 - cy) * zy).round().clamp(0.0, max_y) as u32;
        *img.get_pixel(sx, sy)
    })
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, size, size, 3]
    pub images: Tensor<B, 4>,
    /// one-hot ラベル [batch_size, num_classes]
    pub labels: Tensor<B, 2>,
    /// クラスID [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    num_classes: usize,
    augment: Option<AugmentConfig>,
    rng: Arc<Mutex<StdRng>>,
}

impl<B: Backend> ImageBatcher<B> {
    /// 拡張なし（検証・評価用）
    pub fn new(device: B::Device, image_size: usize, num_classes: usize) -> Self {
        Self {
            device,
            image_size,
            num_classes,
            augment: None,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0))),
        }
    }

    /// 拡張あり（学習用）
    pub fn with_augmentation(mut self, augment: AugmentConfig, seed: u64) -> Self {
        if !augment.is_noop() {
            self.augment = Some(augment);
            self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        }
        self
    }
}

/// one-hot ベクトルを平坦化して作成
pub fn one_hot(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        data[row * num_classes + label] = 1.0;
    }
    data
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * size * size * 3);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            // 読み込みに失敗した画像は学習全体を止める
            let img = match load_rgb_image(&item.path, size) {
                Ok(img) => img,
                Err(e) => panic!("画像読み込み失敗 {}: {:#}", item.path.display(), e),
            };
            let img = match &self.augment {
                Some(augment) => {
                    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                    augment.apply(img, &mut *rng)
                }
                None => img,
            };
            all_pixels.extend(normalize_rgb(&img));
            labels.push(item.label);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, size, size, 3]);
        let one_hot_labels = Tensor::<B, 1>::from_floats(one_hot(&labels, self.num_classes).as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);
        let targets_vec: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch {
            images,
            labels: one_hot_labels,
            targets,
        }
    }
}
