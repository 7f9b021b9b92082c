//! モデル学習とエクスポート
//!
//! データセット読み込み → 分割 → 学習 → グラフ・評価 → エクスポートの一連の処理を提供します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};

use crate::ml::batcher::{AugmentConfig, ImageBatcher};
use crate::ml::dataset::{ImageFolderDataset, ImageItem};
use crate::ml::evaluation::{evaluate, ClassificationReport, ConfusionMatrix};
use crate::ml::ml_model::{categorical_cross_entropy, Classifier, ModelConfig};
use crate::model::config::{AppConfig, TrainingSettings};
use crate::model::{save_model_with_metadata, FinalMetrics, ModelMetadata, WeightPrecision};
use crate::report;

/// 学習履歴
///
/// エポックごとの accuracy / loss / val_accuracy / val_loss を保持します。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub accuracy: Vec<f64>,
    pub loss: Vec<f64>,
    pub val_accuracy: Vec<f64>,
    pub val_loss: Vec<f64>,
}

/// 1エポック分の履歴行（CSV出力用）
#[derive(Debug, Serialize)]
struct HistoryRow {
    epoch: usize,
    accuracy: f64,
    loss: f64,
    val_accuracy: f64,
    val_loss: f64,
}

impl TrainingHistory {
    pub fn record(&mut self, train: EpochMetrics, valid: EpochMetrics) {
        self.accuracy.push(train.accuracy);
        self.loss.push(train.loss);
        self.val_accuracy.push(valid.accuracy);
        self.val_loss.push(valid.loss);
    }

    pub fn num_epochs(&self) -> usize {
        self.loss.len()
    }

    /// 指標名で系列を取得（"accuracy", "loss", "val_accuracy", "val_loss"）
    pub fn metric(&self, name: &str) -> Option<&[f64]> {
        match name {
            "accuracy" => Some(&self.accuracy),
            "loss" => Some(&self.loss),
            "val_accuracy" => Some(&self.val_accuracy),
            "val_loss" => Some(&self.val_loss),
            _ => None,
        }
    }

    /// 最終エポックの指標
    pub fn final_metrics(&self) -> Option<FinalMetrics> {
        Some(FinalMetrics {
            accuracy: *self.accuracy.last()?,
            loss: *self.loss.last()?,
            val_accuracy: *self.val_accuracy.last()?,
            val_loss: *self.val_loss.last()?,
        })
    }

    /// 履歴をCSVに保存
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("CSV作成エラー: {}", path.display()))?;
        for epoch in 0..self.num_epochs() {
            writer.serialize(HistoryRow {
                epoch: epoch + 1,
                accuracy: self.accuracy[epoch],
                loss: self.loss[epoch],
                val_accuracy: self.val_accuracy[epoch],
                val_loss: self.val_loss[epoch],
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// 1エポック分の平均損失と正解率
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// バッチごとの集計（損失はサンプル数で重み付け）
#[derive(Default)]
struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl MetricAccumulator {
    fn update(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    fn finish(&self) -> EpochMetrics {
        if self.samples == 0 {
            return EpochMetrics {
                loss: f64::NAN,
                accuracy: 0.0,
            };
        }
        EpochMetrics {
            loss: self.loss_sum / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
        }
    }
}

/// ロジットとクラスIDから正解数を数える
fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// 学習用データローダー
///
/// `iter()` のたびに並び順が変わります。同じシードで作り直せば同じ順序列になります。
fn shuffled_loader<B, O, Bt>(
    batcher: Bt,
    dataset: ImageFolderDataset,
    batch_size: usize,
    seed: u64,
) -> Arc<dyn DataLoader<B, O>>
where
    B: Backend,
    O: Send + Clone + std::fmt::Debug + 'static,
    Bt: Batcher<B, ImageItem, O> + 'static,
{
    DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .shuffle(seed)
        .build(dataset)
}

/// 学習結果
pub struct TrainedModel<B: AutodiffBackend> {
    pub model: Classifier<B>,
    pub history: TrainingHistory,
}

/// モデル学習を実行
///
/// 各エポックで学習データを1周（エポックごとに固定シードで再シャッフル）し、
/// その後検証データを1周して指標を記録します。
pub fn train<B: AutodiffBackend>(
    model: Classifier<B>,
    dataset_train: ImageFolderDataset,
    dataset_val: ImageFolderDataset,
    image_size: usize,
    settings: &TrainingSettings,
    augment: AugmentConfig,
    device: &B::Device,
) -> TrainedModel<B> {
    let num_classes = dataset_train.num_classes();

    let batcher_train = ImageBatcher::<B>::new(device.clone(), image_size, num_classes)
        .with_augmentation(augment, settings.seed);
    let batcher_val = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size, num_classes);

    let dataloader_train = shuffled_loader(batcher_train, dataset_train, settings.batch_size, settings.seed);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(settings.batch_size)
        .build(dataset_val);

    let mut model = model;
    let mut optim = AdamConfig::new().init();
    let mut history = TrainingHistory::default();

    log::info!(
        "学習を開始します (エポック数: {}, バッチサイズ: {}, 学習率: {})",
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    for epoch in 1..=settings.num_epochs {
        let mut train_metrics = MetricAccumulator::default();

        for batch in dataloader_train.iter() {
            let [batch_size, _, _, _] = batch.images.dims();
            let output = model.forward_classification(batch.images, batch.labels, batch.targets);

            let loss_value = output.loss.clone().into_scalar().elem::<f64>();
            let correct = count_correct(output.output, output.targets);
            train_metrics.update(loss_value, correct, batch_size);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        // 検証（重みは更新しない）
        let model_valid = model.valid();
        let mut valid_metrics = MetricAccumulator::default();

        for batch in dataloader_val.iter() {
            let [batch_size, _, _, _] = batch.images.dims();
            let logits = model_valid.forward(batch.images);
            let loss_value = categorical_cross_entropy(logits.clone(), batch.labels)
                .into_scalar()
                .elem::<f64>();
            let correct = count_correct(logits, batch.targets);
            valid_metrics.update(loss_value, correct, batch_size);
        }

        let train_epoch = train_metrics.finish();
        let valid_epoch = valid_metrics.finish();
        log::info!(
            "Epoch {:>3}/{} | loss={:.4} | accuracy={:.4} | val_loss={:.4} | val_accuracy={:.4}",
            epoch,
            settings.num_epochs,
            train_epoch.loss,
            train_epoch.accuracy,
            valid_epoch.loss,
            valid_epoch.accuracy
        );
        history.record(train_epoch, valid_epoch);
    }

    TrainedModel { model, history }
}

/// 重みをバイナリに変換
pub fn record_bytes<B: Backend>(model: &Classifier<B>, precision: WeightPrecision) -> Result<Vec<u8>> {
    let record = model.clone().into_record();
    let bytes = match precision {
        WeightPrecision::F32 => BinBytesRecorder::<FullPrecisionSettings>::default().record(record, ()),
        WeightPrecision::F16 => BinBytesRecorder::<HalfPrecisionSettings>::default().record(record, ()),
    };
    bytes.map_err(|e| anyhow::anyhow!("モデル重みの変換エラー: {:?}", e))
}

/// 学習済みモデルをメタデータと共にエクスポート
///
/// 既存ファイルは上書きされます。書き込んだバイト数を返します。
pub fn export_model<B: Backend>(model: &Classifier<B>, metadata: &ModelMetadata, output_path: &Path) -> Result<u64> {
    metadata.validate()?;
    if model.num_classes() != metadata.num_classes() {
        anyhow::bail!(
            "モデル出力幅 {} とクラス数 {} が一致しません",
            model.num_classes(),
            metadata.num_classes()
        );
    }

    let model_binary = record_bytes(model, metadata.precision)?;
    save_model_with_metadata(output_path, metadata, &model_binary)?;

    let saved_size = std::fs::metadata(output_path)?.len();
    log::info!(
        "モデルを保存しました: {} ({:.2} MB)",
        output_path.display(),
        saved_size as f64 / 1024.0 / 1024.0
    );
    Ok(saved_size)
}

/// パイプライン全体の結果
#[derive(Debug)]
pub struct TrainingOutcome {
    pub class_names: Vec<String>,
    pub history: TrainingHistory,
    pub confusion_matrix: ConfusionMatrix,
    pub report: ClassificationReport,
    pub artifact_path: PathBuf,
}

/// 学習パイプライン全体を実行
///
/// データセット読み込み → 分割 → 学習 → 学習曲線 → 混同行列・分類レポート → エクスポート
pub fn run_pipeline<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingOutcome> {
    let dataset_config = &config.dataset;
    let data_dir = PathBuf::from(&dataset_config.root);

    log::info!("データセットを読み込みます: {}", data_dir.display());
    let dataset = ImageFolderDataset::from_directory(&data_dir)?;
    let class_names = dataset.class_names().to_vec();

    let (dataset_train, dataset_val) =
        dataset.split(dataset_config.validation_split, dataset_config.seed)?;
    log::info!("学習データ: {} 枚", dataset_train.len());
    log::info!("検証データ: {} 枚", dataset_val.len());
    if dataset_train.is_empty() || dataset_val.is_empty() {
        anyhow::bail!(
            "学習データまたは検証データが0枚です (学習: {}, 検証: {}, 検証割合: {})。各クラスの画像を増やすか検証割合を見直してください",
            dataset_train.len(),
            dataset_val.len(),
            dataset_config.validation_split
        );
    }

    let model_config = ModelConfig::new(class_names.len())
        .with_image_size(dataset_config.image_size)
        .with_hidden_size(config.model.hidden_size);
    model_config.validate()?;
    log::info!(
        "モデル設定: {} クラス, 入力サイズ: {}x{}",
        model_config.num_classes,
        model_config.image_size,
        model_config.image_size
    );

    let model = model_config.init::<B>(&device);
    log::info!("パラメータ数: {}", model.num_params());

    let augment = AugmentConfig {
        horizontal_flip: dataset_config.horizontal_flip,
        zoom_range: dataset_config.zoom_range,
    };

    let trained = train(
        model,
        dataset_train,
        dataset_val.clone(),
        dataset_config.image_size,
        &config.training,
        augment,
        &device,
    );
    let history = trained.history;

    if let Some(csv_path) = &config.export.history_csv {
        history.save_csv(Path::new(csv_path))?;
        log::info!("学習履歴を保存しました: {}", csv_path);
    }

    if config.report.show_plots {
        println!("{}", report::render_history(&history));
    }

    let model_valid = trained.model.valid();
    let (confusion_matrix, classification_report) = evaluate(
        &model_valid,
        dataset_val,
        dataset_config.image_size,
        config.training.batch_size,
        &device,
    )?;

    if config.report.show_plots {
        println!("{}", report::render_confusion_matrix(&confusion_matrix));
    }
    println!("分類レポート:\n");
    println!("{}", classification_report);

    let precision = if config.export.half_precision {
        WeightPrecision::F16
    } else {
        WeightPrecision::F32
    };
    let metadata = ModelMetadata::new(
        class_names.clone(),
        model_config.image_size,
        model_config.hidden_size,
        precision,
        history.num_epochs(),
        history.final_metrics(),
    );

    let artifact_path = config.artifact_path();
    export_model(&model_valid, &metadata, &artifact_path)?;

    Ok(TrainingOutcome {
        class_names,
        history,
        confusion_matrix,
        report: classification_report,
        artifact_path,
    })
}
