//! 検証データでの評価（混同行列と分類レポート）

use anyhow::Result;
use burn::{data::dataloader::DataLoaderBuilder, tensor::backend::Backend};
use std::fmt;

use crate::ml::batcher::ImageBatcher;
use crate::ml::dataset::ImageFolderDataset;
use crate::ml::ml_model::Classifier;

/// 混同行列
///
/// `counts[i][j]` は正解クラス i をクラス j と予測した件数です。
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    pub class_names: Vec<String>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// 正解ラベル列と予測ラベル列から作成（両者はインデックスで対応）
    pub fn from_predictions(class_names: &[String], y_true: &[usize], y_pred: &[usize]) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            anyhow::bail!(
                "正解ラベル数 {} と予測数 {} が一致しません",
                y_true.len(),
                y_pred.len()
            );
        }
        let n = class_names.len();
        let mut counts = vec![vec![0usize; n]; n];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            if t >= n || p >= n {
                anyhow::bail!("クラスID が範囲外です: true={}, pred={} (クラス数 {})", t, p, n);
            }
            counts[t][p] += 1;
        }
        Ok(Self {
            class_names: class_names.to_vec(),
            counts,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// 正解クラスごとの件数
    pub fn row_sums(&self) -> Vec<usize> {
        self.counts.iter().map(|row| row.iter().sum()).collect()
    }

    /// 予測クラスごとの件数
    pub fn column_sums(&self) -> Vec<usize> {
        (0..self.num_classes())
            .map(|j| self.counts.iter().map(|row| row[j]).sum())
            .collect()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    pub fn max_count(&self) -> usize {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }
}

/// 1クラス分（または平均）の指標
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 分類レポート
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub class_names: Vec<String>,
    pub per_class: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ClassificationReport {
    /// 混同行列から作成。分母が0になる指標は0とします
    pub fn from_confusion_matrix(cm: &ConfusionMatrix) -> Self {
        let rows = cm.row_sums();
        let cols = cm.column_sums();
        let total = cm.total();

        let per_class: Vec<ClassMetrics> = (0..cm.num_classes())
            .map(|i| {
                let tp = cm.counts[i][i];
                let precision = ratio(tp, cols[i]);
                let recall = ratio(tp, rows[i]);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    precision,
                    recall,
                    f1,
                    support: rows[i],
                }
            })
            .collect();

        let n = per_class.len().max(1) as f64;
        let macro_avg = ClassMetrics {
            precision: per_class.iter().map(|m| m.precision).sum::<f64>() / n,
            recall: per_class.iter().map(|m| m.recall).sum::<f64>() / n,
            f1: per_class.iter().map(|m| m.f1).sum::<f64>() / n,
            support: total,
        };

        let weighted = |f: fn(&ClassMetrics) -> f64| {
            if total == 0 {
                0.0
            } else {
                per_class.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total as f64
            }
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1: weighted(|m| m.f1),
            support: total,
        };

        Self {
            class_names: cm.class_names.clone(),
            per_class,
            accuracy: ratio(cm.correct(), total),
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .class_names
            .iter()
            .map(|n| n.chars().count())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(0);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;

        let row = |f: &mut fmt::Formatter<'_>, name: &str, m: &ClassMetrics| {
            writeln!(
                f,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, m.precision, m.recall, m.f1, m.support
            )
        };

        for (name, metrics) in self.class_names.iter().zip(&self.per_class) {
            row(f, name, metrics)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.4} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        row(f, "macro avg", &self.macro_avg)?;
        row(f, "weighted avg", &self.weighted_avg)
    }
}

/// 検証データ全体を1回だけ順番通りに推論する
///
/// # 戻り値
/// - (正解ラベル列, 予測ラベル列)。インデックスはデータセット順で対応します
pub fn predict_dataset<B: Backend>(
    model: &Classifier<B>,
    dataset: ImageFolderDataset,
    image_size: usize,
    batch_size: usize,
    device: &B::Device,
) -> (Vec<usize>, Vec<usize>) {
    let batcher = ImageBatcher::<B>::new(device.clone(), image_size, dataset.num_classes());
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .build(dataset);

    let mut y_true = Vec::new();
    let mut y_pred = Vec::new();

    for batch in dataloader.iter() {
        let predictions = model.predict(batch.images);
        y_true.extend(batch.targets.into_data().iter::<i64>().map(|v| v as usize));
        y_pred.extend(predictions.into_data().iter::<i64>().map(|v| v as usize));
    }

    (y_true, y_pred)
}

/// 検証データで混同行列と分類レポートを作成
pub fn evaluate<B: Backend>(
    model: &Classifier<B>,
    dataset: ImageFolderDataset,
    image_size: usize,
    batch_size: usize,
    device: &B::Device,
) -> Result<(ConfusionMatrix, ClassificationReport)> {
    let class_names = dataset.class_names().to_vec();
    let (y_true, y_pred) = predict_dataset(model, dataset, image_size, batch_size, device);
    let cm = ConfusionMatrix::from_predictions(&class_names, &y_true, &y_pred)?;
    let report = ClassificationReport::from_confusion_matrix(&cm);
    Ok((cm, report))
}
