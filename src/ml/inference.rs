//! モデル推論機能
//!
//! エクスポートされたモデルファイルを読み込み、宣言された入力形状のテンソルで順伝播します。

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, PrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use std::path::Path;

use crate::ml::{load_and_normalize_image_with_size, Classifier};
use crate::model::{load_model_with_metadata, InferenceConfig, TensorDescriptor, WeightPrecision};

fn load_weights<B: Backend, S: PrecisionSettings>(
    model: Classifier<B>,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<Classifier<B>> {
    let record = BinBytesRecorder::<S>::default()
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    Ok(model.load_record(record))
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: Classifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (metadata, model_binary) = load_model_with_metadata(model_path)
            .with_context(|| format!("モデルファイルを読み込めません: {}", model_path.display()))?;
        metadata
            .validate()
            .with_context(|| format!("モデルファイルが不正です: {}", model_path.display()))?;

        let config = InferenceConfig::from_metadata(&metadata);
        let model_config = config.model_config();
        model_config.validate()?;

        let model = model_config.init::<B>(device);
        let model = match config.precision {
            WeightPrecision::F32 => load_weights::<B, FullPrecisionSettings>(model, model_binary, device)?,
            WeightPrecision::F16 => load_weights::<B, HalfPrecisionSettings>(model, model_binary, device)?,
        };

        Ok(Self {
            model,
            config,
            device: device.clone(),
        })
    }

    /// 入力テンソルの記述子
    pub fn input_details(&self) -> &TensorDescriptor {
        &self.config.input
    }

    /// 出力テンソルの記述子
    pub fn output_details(&self) -> &TensorDescriptor {
        &self.config.output
    }

    /// 入力形状と同じ全ゼロのテンソル（正規化済みの真っ黒な画像1枚）
    pub fn zero_probe(&self) -> Vec<f32> {
        vec![0.0; self.config.input.num_elements()]
    }

    /// 1回だけ順伝播してクラス確率（行優先 [1, クラス数]）を返す
    pub fn run(&self, input: &[f32], shape: &[usize]) -> Result<Vec<f32>> {
        if shape != self.config.input.shape.as_slice() {
            anyhow::bail!(
                "入力形状が一致しません: {:?} (期待: {:?})",
                shape,
                self.config.input.shape
            );
        }
        if input.len() != self.config.input.num_elements() {
            anyhow::bail!(
                "入力要素数が一致しません: {} (期待: {})",
                input.len(),
                self.config.input.num_elements()
            );
        }

        let size = self.config.image_size;
        let tensor = Tensor::<B, 1>::from_floats(input, &self.device).reshape([1, size, size, 3]);

        let output = self.model.forward_probabilities(tensor);
        Ok(output.into_data().iter::<f32>().collect())
    }

    /// 単一画像を分類
    ///
    /// # 戻り値
    /// - (クラス名, クラス確率)
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<(String, Vec<f32>)> {
        let image_data = load_and_normalize_image_with_size(image_path.as_ref(), self.config.image_size)?;
        let input_shape = self.config.input.shape.clone();
        let probabilities = self.run(&image_data, &input_shape)?;

        let class_idx = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))?;

        let class_name = self
            .config
            .class_index_to_label(class_idx)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_idx))?
            .to_string();

        Ok((class_name, probabilities))
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{export_model, ModelConfig};
    use crate::model::ModelMetadata;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn export_fresh_model(path: &Path, precision: WeightPrecision) {
        let device = NdArrayDevice::default();
        let model = ModelConfig::new(2)
            .with_image_size(32)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);
        let metadata = ModelMetadata::new(
            vec!["cat".to_string(), "dog".to_string()],
            32,
            8,
            precision,
            1,
            None,
        );
        export_model(&model, &metadata, path).unwrap();
    }

    #[test]
    fn test_zero_probe_is_deterministic_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        export_fresh_model(&path, WeightPrecision::F32);
        let device = NdArrayDevice::default();

        let first = InferenceEngine::<TestBackend>::load(&path, &device).unwrap();
        let second = InferenceEngine::<TestBackend>::load(&path, &device).unwrap();

        assert_eq!(first.input_details().shape, vec![1, 32, 32, 3]);
        assert_eq!(first.output_details().shape, vec![1, 2]);

        let shape = first.input_details().shape.clone();
        let out1 = first.run(&first.zero_probe(), &shape).unwrap();
        let out2 = second.run(&second.zero_probe(), &shape).unwrap();

        assert_eq!(out1.len(), 2);
        assert_eq!(out1, out2);
        assert!((out1.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_half_precision_artifact_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_f16.tar.gz");
        export_fresh_model(&path, WeightPrecision::F16);

        let engine = InferenceEngine::<TestBackend>::load(&path, &NdArrayDevice::default()).unwrap();
        assert_eq!(engine.config().precision, WeightPrecision::F16);
        let shape = engine.input_details().shape.clone();
        let out = engine.run(&engine.zero_probe(), &shape).unwrap();
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        export_fresh_model(&path, WeightPrecision::F32);
        let engine = InferenceEngine::<TestBackend>::load(&path, &NdArrayDevice::default()).unwrap();

        let wrong = vec![0.0f32; 3 * 32 * 32];
        assert!(engine.run(&wrong, &[1, 3, 32, 32]).is_err());
        assert!(engine.run(&wrong[..10], &[1, 32, 32, 3]).is_err());
    }

    #[test]
    fn test_missing_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = InferenceEngine::<TestBackend>::load(dir.path().join("absent.tar.gz"), &NdArrayDevice::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_classify_image_returns_known_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        export_fresh_model(&path, WeightPrecision::F32);
        let image_path = dir.path().join("photo.png");
        image::RgbImage::from_pixel(64, 48, image::Rgb([120, 80, 40])).save(&image_path).unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&path, &NdArrayDevice::default()).unwrap();
        let (label, probabilities) = engine.classify_image(&image_path).unwrap();

        assert!(label == "cat" || label == "dog");
        assert_eq!(probabilities.len(), 2);
    }
}
