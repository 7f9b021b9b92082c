//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use crate::ml::ModelConfig;
use crate::model::model_metadata::{ModelMetadata, TensorDescriptor, WeightPrecision};

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラス名（出力インデックス順）
    pub class_names: Vec<String>,

    /// モデル入力解像度
    pub image_size: usize,
    pub hidden_size: usize,

    pub input: TensorDescriptor,
    pub output: TensorDescriptor,

    pub precision: WeightPrecision,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            image_size: metadata.image_size,
            hidden_size: metadata.hidden_size,
            input: metadata.input.clone(),
            output: metadata.output.clone(),
            precision: metadata.precision,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// ネットワーク再構築用の設定
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.num_classes())
            .with_image_size(self.image_size)
            .with_hidden_size(self.hidden_size)
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }
}
