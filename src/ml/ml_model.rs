//! 機械学習モデルの共通定義
//!
//! 犬猫分類用のCNNモデルと画像の読み込み・正規化を提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{
        activation::{log_softmax, softmax},
        backend::Backend,
        Int, Tensor,
    },
    train::ClassificationOutput,
};
use image::{imageops::FilterType, RgbImage};
use std::path::Path;

/// 画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// 各ブロックの出力チャネル数
const CHANNELS: [usize; 3] = [32, 64, 128];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// 全結合層の隠れユニット数
    #[config(default = 128)]
    pub hidden_size: usize,
}

impl ModelConfig {
    /// 3ブロック通過後の特徴マップサイズ
    ///
    /// 各ブロック: Conv 3x3 (no padding) で -2、MaxPool 2x2 で 1/2（切り捨て）
    pub fn feature_map_size(&self) -> usize {
        (0..CHANNELS.len()).fold(self.image_size, |size, _| size.saturating_sub(2) / 2)
    }

    /// Flatten後の特徴次元
    pub fn flatten_size(&self) -> usize {
        let size = self.feature_map_size();
        CHANNELS[CHANNELS.len() - 1] * size * size
    }

    /// 構成が成立するか確認
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            anyhow::bail!("クラス数は2以上必要です: {}", self.num_classes);
        }
        if self.feature_map_size() == 0 {
            anyhow::bail!("入力サイズが小さすぎます: {} (最小22x22が必要)", self.image_size);
        }
        if self.hidden_size == 0 {
            anyhow::bail!("隠れユニット数が0です");
        }
        Ok(())
    }

    /// モデルを初期化
    ///
    /// # Panics
    /// 構成が不正な場合（[`ModelConfig::validate`] がエラーになる場合）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        if let Err(e) = self.validate() {
            panic!("モデル構成が不正です: {e}");
        }

        let d = self.flatten_size();
        log::debug!(
            "[Model] 入力 {}x{}x3 -> 特徴マップ {}x{}x{} -> Flatten {} -> FC {} -> {}",
            self.image_size,
            self.image_size,
            self.feature_map_size(),
            self.feature_map_size(),
            CHANNELS[2],
            d,
            self.hidden_size,
            self.num_classes
        );

        Classifier {
            conv1: Conv2dConfig::new([3, CHANNELS[0]], [3, 3]).init(device),
            conv2: Conv2dConfig::new([CHANNELS[0], CHANNELS[1]], [3, 3]).init(device),
            conv3: Conv2dConfig::new([CHANNELS[1], CHANNELS[2]], [3, 3]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 犬猫分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 3ブロック (32, 64, 128 ch)
/// - Flatten
/// - FC: d -> hidden + ReLU
/// - FC: hidden -> num_classes
/// - Softmax (確率出力時)
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,

    fc1: Linear<B>,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> Classifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, size, size, 3]（値域 [0,1]）
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        // NHWC -> NCHW
        let x = images.permute([0, 3, 1, 2]);

        let x = self.pool.forward(self.activation.forward(self.conv1.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv3.forward(x)));

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の和は1）
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 予測クラスID [batch_size]
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 1, Int> {
        let [batch_size, _, _, _] = images.dims();
        self.forward(images).argmax(1).reshape([batch_size])
    }

    /// 出力層の幅
    pub fn num_classes(&self) -> usize {
        let [_, num_classes] = self.fc2.weight.dims();
        num_classes
    }

    /// 順伝播と損失計算
    ///
    /// 損失は one-hot ラベルに対するカテゴリカル交差エントロピーです。
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, size, size, 3]
    /// - `labels`: one-hot ラベル [batch_size, num_classes]
    /// - `targets`: クラスID [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        labels: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = categorical_cross_entropy(output.clone(), labels);

        ClassificationOutput::new(loss, output, targets)
    }
}

/// one-hot ラベルに対する交差エントロピー（バッチ平均）
pub fn categorical_cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (log_probs * labels).sum_dim(1).mean().neg()
}

/// RGB画像をHWC順に平坦化して [0,1] に正規化
pub fn normalize_rgb(img: &RgbImage) -> Vec<f32> {
    img.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
}

/// 画像を読み込んで指定サイズにリサイズ
pub fn load_rgb_image(path: &Path, size: usize) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?
        .to_rgb8();

    if img.width() as usize == size && img.height() as usize == size {
        return Ok(img);
    }
    Ok(image::imageops::resize(&img, size as u32, size as u32, FilterType::Nearest))
}

/// 画像を読み込んで正規化（サイズ指定版）
///
/// # 戻り値
/// - [0,1] に正規化されたRGB画像データ (H, W, C) の順で平坦化
pub fn load_and_normalize_image_with_size(path: &Path, size: usize) -> Result<Vec<f32>> {
    Ok(normalize_rgb(&load_rgb_image(path, size)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_map_size_for_default_input() {
        let config = ModelConfig::new(2);
        // 224 -> 222 -> 111 -> 109 -> 54 -> 52 -> 26
        assert_eq!(config.feature_map_size(), 26);
        assert_eq!(config.flatten_size(), 128 * 26 * 26);
    }

    #[test]
    fn test_validate_rejects_tiny_input() {
        assert!(ModelConfig::new(2).with_image_size(16).validate().is_err());
        assert!(ModelConfig::new(1).validate().is_err());
        assert!(ModelConfig::new(2).with_image_size(32).validate().is_ok());
    }

    #[test]
    fn test_output_width_equals_class_count() {
        let device = Default::default();
        let model = ModelConfig::new(3)
            .with_image_size(32)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);
        assert_eq!(model.num_classes(), 3);

        let images = Tensor::<TestBackend, 4>::zeros([2, 32, 32, 3], &device);
        assert_eq!(model.forward(images).dims(), [2, 3]);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let device = Default::default();
        let model = ModelConfig::new(2)
            .with_image_size(32)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::random(
            [3, 32, 32, 3],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let probs = model.forward_probabilities(images);
        let sums: Vec<f32> = probs.sum_dim(1).into_data().iter::<f32>().collect();
        assert_eq!(sums.len(), 3);
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5, "sum = {sum}");
        }
    }

    #[test]
    fn test_cross_entropy_matches_manual_value() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.0f32, 0.0]]), &device);
        let labels = Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.0f32, 0.0]]), &device);

        let loss: f32 = categorical_cross_entropy(logits, labels).into_scalar();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_load_and_normalize_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(40, 30, image::Rgb([255, 255, 255])).save(&path).unwrap();

        let data = load_and_normalize_image_with_size(&path, 24).unwrap();
        assert_eq!(data.len(), 24 * 24 * 3);
        assert!(data.iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
    }
}
