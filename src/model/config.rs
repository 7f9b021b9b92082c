//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット、学習、エクスポート設定をJSON形式で保存・読み込みします。
//! 設定ファイルが無い場合は既定値（画像サイズ224、バッチ128、20エポック、検証20%、シード42）を使います。

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::ml::IMAGE_SIZE;
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// データセットのルート（クラスごとにサブディレクトリ）
    pub root: String,
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// 検証データの割合
    pub validation_split: f64,
    /// 分割用ランダムシード
    pub seed: u64,
    /// 学習データの左右反転
    pub horizontal_flip: bool,
    /// 学習データのズーム幅（0.2 なら 0.8〜1.2倍）
    pub zoom_range: f32,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            root: "../dataset".to_string(),
            image_size: IMAGE_SIZE,
            validation_split: 0.2,
            seed: 42,
            horizontal_flip: true,
            zoom_range: 0.2,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 全結合層の隠れユニット数
    pub hidden_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self { hidden_size: 128 }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// シャッフル用ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 128,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

/// エクスポート設定
///
/// `artifact_path` は学習側の書き込みとスモークテスト側の読み込みで共有されます。
/// モバイルアプリのアセットへのコピーはこのツールの範囲外です。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// 出力するモデルファイル（tar.gz）
    pub artifact_path: String,
    /// 重みをf16で保存する
    #[serde(default)]
    pub half_precision: bool,
    /// 学習履歴CSVの出力先（未指定なら出力しない）
    #[serde(default)]
    pub history_csv: Option<String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            artifact_path: "model.tar.gz".to_string(),
            half_precision: false,
            history_csv: None,
        }
    }
}

/// レポート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSettings {
    /// 学習曲線と混同行列をターミナルに描画する
    pub show_plots: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self { show_plots: true }
    }
}

/// スモークテスト設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// ゼロ画像の代わりに使う実画像（任意）
    #[serde(default)]
    pub probe_image: Option<String>,
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定ファイルが無ければデフォルト設定を返す。読み込めないファイルはエラー
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Ok(Self::default());
        }
        let config = Self::load(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        log::info!("設定ファイルを読み込みました: {}", path.display());
        Ok(config)
    }

    /// モデルファイルのパス
    pub fn artifact_path(&self) -> PathBuf {
        PathBuf::from(&self.export.artifact_path)
    }

    /// 設定情報を表示
    pub fn display(&self) {
        log::info!("=== アプリケーション設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        log::info!("データセット: {}", self.dataset.root);
        log::info!(
            "画像サイズ: {}x{}, 検証割合: {}, シード: {}",
            self.dataset.image_size,
            self.dataset.image_size,
            self.dataset.validation_split,
            self.dataset.seed
        );
        log::info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate
        );
        log::info!("モデル出力先: {}", self.export.artifact_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.dataset.image_size, 224);
        assert_eq!(config.dataset.root, "../dataset");
        assert_eq!(config.dataset.seed, 42);
        assert!((config.dataset.validation_split - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.training.batch_size, 128);
        assert_eq!(config.training.num_epochs, 20);
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.export.artifact_path, deserialized.export.artifact_path);
        assert_eq!(config.training.num_epochs, deserialized.training.num_epochs);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": { "num_epochs": 3, "batch_size": 4, "learning_rate": 0.01, "seed": 7 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.dataset.image_size, 224);
        assert_eq!(config.export.artifact_path, "model.tar.gz");
    }

    #[test]
    fn test_load_or_default_from_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(AppConfig::load_or_default_from(&path).is_err());
    }

    #[test]
    fn test_load_or_default_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default_from(dir.path().join("config.json")).unwrap();
        assert_eq!(config.training.num_epochs, 20);
    }

    #[test]
    fn test_load_or_default_from_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "export": { "artifact_path": "out/cats.tar.gz" } }"#).unwrap();

        let loaded = AppConfig::load_or_default_from(&path).unwrap();
        assert_eq!(loaded.artifact_path(), PathBuf::from("out/cats.tar.gz"));
        assert!(!loaded.export.half_precision);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
