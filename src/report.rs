//! ターミナルへのグラフ描画
//!
//! 学習曲線（正解率・損失）と混同行列のヒートマップを文字列として描画します。
//! 描画結果は表示のみで、ファイルには保存しません。

use textplots::{Chart, Plot, Shape};

use crate::ml::evaluation::ConfusionMatrix;
use crate::ml::training::TrainingHistory;

const CHART_WIDTH: u32 = 120;
const CHART_HEIGHT: u32 = 40;

/// 濃淡（件数 0 → 最大）
const SHADES: [char; 5] = [' ', '░', '▒', '▓', '█'];

fn points(values: &[f64]) -> Vec<(f32, f32)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| ((i + 1) as f32, *v as f32))
        .collect()
}

/// 学習データ（線）と検証データ（点）の2系列を1つのグラフにする
fn render_chart(title: &str, train: &[f64], valid: &[f64]) -> String {
    let train_points = points(train);
    let valid_points = points(valid);
    let xmax = train.len().max(valid.len()).max(2) as f32;

    let (mut ymin, mut ymax) = train
        .iter()
        .chain(valid)
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f32), hi.max(v as f32))
        });
    if !ymin.is_finite() || !ymax.is_finite() {
        (ymin, ymax) = (0.0, 1.0);
    }
    if ymax - ymin < 1e-3 {
        ymin -= 0.5;
        ymax += 0.5;
    }

    let train_shape = Shape::Lines(&train_points);
    let valid_shape = Shape::Points(&valid_points);
    let mut chart = Chart::new_with_y_range(CHART_WIDTH, CHART_HEIGHT, 1.0, xmax, ymin, ymax);
    let chart = chart.lineplot(&train_shape).lineplot(&valid_shape);
    chart.axis();
    chart.figures();

    format!("{title}  (線: 学習, 点: 検証)\n{chart}\n")
}

/// 学習曲線を描画（正解率・損失）
pub fn render_history(history: &TrainingHistory) -> String {
    if history.num_epochs() == 0 {
        return "学習履歴がありません\n".to_string();
    }

    let mut out = String::new();
    out.push_str(&render_chart("正解率", &history.accuracy, &history.val_accuracy));
    out.push_str(&render_chart("損失", &history.loss, &history.val_loss));
    out.push_str("エポック | accuracy | val_accuracy |   loss   | val_loss\n");
    for epoch in 0..history.num_epochs() {
        out.push_str(&format!(
            "{:>8} | {:>8.4} | {:>12.4} | {:>8.4} | {:>8.4}\n",
            epoch + 1,
            history.accuracy[epoch],
            history.val_accuracy[epoch],
            history.loss[epoch],
            history.val_loss[epoch]
        ));
    }
    out
}

fn shade(count: usize, max: usize) -> char {
    if max == 0 || count == 0 {
        return SHADES[0];
    }
    let level = (count * (SHADES.len() - 1)).div_ceil(max);
    SHADES[level.min(SHADES.len() - 1)]
}

/// 混同行列をヒートマップ風に描画
///
/// 行が正解ラベル、列が予測ラベルです。各セルに件数を表示します。
pub fn render_confusion_matrix(cm: &ConfusionMatrix) -> String {
    let label_width = cm
        .class_names
        .iter()
        .map(|n| n.chars().count())
        .max()
        .unwrap_or(0)
        .max("正解\\予測".chars().count());
    let cell_width = cm
        .class_names
        .iter()
        .map(|n| n.chars().count())
        .chain(std::iter::once(cm.max_count().to_string().len() + 4))
        .max()
        .unwrap_or(0);
    let max = cm.max_count();

    let mut out = String::from("混同行列\n");
    out.push_str(&format!("{:>label_width$} ", "正解\\予測"));
    for name in &cm.class_names {
        out.push_str(&format!("|{:^cell_width$}", name));
    }
    out.push_str("|\n");

    for (name, row) in cm.class_names.iter().zip(&cm.counts) {
        out.push_str(&format!("{:>label_width$} ", name));
        for &count in row {
            let fill = shade(count, max);
            let number = count.to_string();
            let pad = cell_width.saturating_sub(number.len() + 2);
            let left = pad / 2;
            let right = pad - left;
            out.push('|');
            out.push_str(&fill.to_string().repeat(left + 1));
            out.push_str(&number);
            out.push_str(&fill.to_string().repeat(right + 1));
        }
        out.push_str("|\n");
    }
    out
}

/// 出力テンソルを行ごとに表示（例: `[[0.4987 0.5013]]`）
pub fn render_tensor(values: &[f32], shape: &[usize]) -> String {
    let row_len = shape.last().copied().filter(|&n| n > 0).unwrap_or(values.len().max(1));
    let rows: Vec<String> = values
        .chunks(row_len)
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
            format!("[{}]", cells.join(" "))
        })
        .collect();
    format!("[{}]", rows.join("\n "))
}
