//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと一緒に保存される情報を定義します。
//! 推論側はこの情報だけでネットワークを再構築し、入出力テンソルの形状を知ることができます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// メタデータのフォーマットバージョン
pub const FORMAT_VERSION: u32 = 1;

/// 入出力テンソルの記述子
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    /// (scale, zero_point)。量子化しないテンソルは (0.0, 0)
    #[serde(default)]
    pub quantization: (f32, i32),
}

impl TensorDescriptor {
    pub fn float32(name: &str, shape: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            shape,
            dtype: "float32".to_string(),
            quantization: (0.0, 0),
        }
    }

    /// 要素数
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

impl std::fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{'name': '{}', 'shape': {:?}, 'dtype': {}, 'quantization': ({:?}, {})}}",
            self.name, self.shape, self.dtype, self.quantization.0, self.quantization.1
        )
    }
}

/// 重みの保存精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    F32,
    F16,
}

/// 学習終了時の指標
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalMetrics {
    pub accuracy: f64,
    pub loss: f64,
    pub val_accuracy: f64,
    pub val_loss: f64,
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// クラス名（出力インデックス順）
    /// 例: ["cat", "dog"]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub image_size: usize,

    /// 全結合層の隠れユニット数
    pub hidden_size: usize,

    pub input: TensorDescriptor,
    pub output: TensorDescriptor,

    pub precision: WeightPrecision,

    /// 学習エポック数
    pub num_epochs: usize,

    #[serde(default)]
    pub final_metrics: Option<FinalMetrics>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    ///
    /// 入力は `[1, image_size, image_size, 3]`、出力は `[1, クラス数]` の float32 です。
    pub fn new(
        class_names: Vec<String>,
        image_size: usize,
        hidden_size: usize,
        precision: WeightPrecision,
        num_epochs: usize,
        final_metrics: Option<FinalMetrics>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();
        let input = TensorDescriptor::float32("input", vec![1, image_size, image_size, 3]);
        let output = TensorDescriptor::float32("probabilities", vec![1, class_names.len()]);

        Self {
            format_version: FORMAT_VERSION,
            class_names,
            image_size,
            hidden_size,
            input,
            output,
            precision,
            num_epochs,
            final_metrics,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 記述子とクラス情報の整合性を確認
    pub fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            anyhow::bail!(
                "未対応のメタデータバージョンです: {} (対応: {})",
                self.format_version,
                FORMAT_VERSION
            );
        }
        if self.class_names.len() < 2 {
            anyhow::bail!("クラス数が不足しています: {}", self.class_names.len());
        }
        let expected_input = [1, self.image_size, self.image_size, 3];
        if self.input.shape != expected_input {
            anyhow::bail!(
                "入力形状が不正です: {:?} (期待: {:?})",
                self.input.shape,
                expected_input
            );
        }
        if self.output.shape != [1, self.class_names.len()] {
            anyhow::bail!(
                "出力形状 {:?} がクラス数 {} と一致しません",
                self.output.shape,
                self.class_names.len()
            );
        }
        if self.input.dtype != "float32" || self.output.dtype != "float32" {
            anyhow::bail!(
                "未対応のデータ型です: input={}, output={}",
                self.input.dtype,
                self.output.dtype
            );
        }
        if let Some(metrics) = &self.final_metrics {
            let values = [metrics.accuracy, metrics.loss, metrics.val_accuracy, metrics.val_loss];
            if values.iter().any(|v| !v.is_finite()) {
                anyhow::bail!("最終指標に有限でない値が含まれています: {:?}", metrics);
            }
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata::new(
            vec!["cat".to_string(), "dog".to_string()],
            224,
            128,
            WeightPrecision::F32,
            20,
            None,
        )
    }

    #[test]
    fn test_descriptors_follow_classes() {
        let metadata = sample();
        assert_eq!(metadata.input.shape, vec![1, 224, 224, 3]);
        assert_eq!(metadata.output.shape, vec![1, 2]);
        assert_eq!(metadata.input.num_elements(), 224 * 224 * 3);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_output() {
        let mut metadata = sample();
        metadata.output.shape = vec![1, 3];
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_input() {
        let mut metadata = sample();
        metadata.input.shape = vec![1, 3, 224, 224];
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_metrics() {
        let mut metadata = sample();
        metadata.final_metrics = Some(FinalMetrics {
            accuracy: 1.0,
            loss: 0.1,
            val_accuracy: 0.0,
            val_loss: f64::NAN,
        });
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_descriptor_display_includes_quantization() {
        let descriptor = TensorDescriptor::float32("input", vec![1, 4, 4, 3]);
        assert_eq!(
            descriptor.to_string(),
            "{'name': 'input', 'shape': [1, 4, 4, 3], 'dtype': float32, 'quantization': (0.0, 0)}"
        );
    }

    #[test]
    fn test_json_keeps_precision_lowercase() {
        let mut metadata = sample();
        metadata.precision = WeightPrecision::F16;
        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"f16\""));

        let parsed = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed.precision, WeightPrecision::F16);
        assert_eq!(parsed.class_names, metadata.class_names);
    }

    #[test]
    fn test_descriptor_display() {
        let descriptor = TensorDescriptor::float32("input", vec![1, 224, 224, 3]);
        let text = descriptor.to_string();
        assert!(text.contains("'shape': [1, 224, 224, 3]"));
        assert!(text.contains("float32"));
    }
}
