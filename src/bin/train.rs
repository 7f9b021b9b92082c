//! 犬猫分類モデルの学習バイナリ
//!
//! 設定は作業ディレクトリの config.json から読み込みます（無ければ既定値）

use anyhow::Result;
use burn_ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use catdog_classifier::ml::{run_pipeline, TrainingOutcome};
use catdog_classifier::model::{AppConfig, DeviceType};
use env_logger::Env;

fn run(config: &AppConfig) -> Result<TrainingOutcome> {
    match config.device_type {
        DeviceType::Cpu => run_pipeline::<Autodiff<NdArray>>(config, NdArrayDevice::Cpu),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use burn::backend::Wgpu;
            use burn_wgpu::WgpuDevice;
            run_pipeline::<Autodiff<Wgpu>>(config, WgpuDevice::default())
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            anyhow::bail!("WGPU バックエンドが無効です。`--features wgpu` でビルドするか device_type を \"Cpu\" にしてください")
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = AppConfig::load_or_default()?;
    config.display();

    let outcome = run(&config)?;

    log::info!(
        "学習完了: {} クラス {:?}, 検証正解率 {:.4}",
        outcome.class_names.len(),
        outcome.class_names,
        outcome.report.accuracy
    );
    println!("モデルを保存しました: {}", outcome.artifact_path.display());
    Ok(())
}
