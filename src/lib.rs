//! 犬猫画像分類モデルの学習・エクスポート・動作確認
//!
//! - `train` バイナリ: データセット読み込み → 学習 → 評価 → モデルファイル出力
//! - `smoke_test` バイナリ: 出力したモデルファイルを読み込み、1回だけ推論

// 学習と推論
pub mod ml;
// モデルファイルと設定
pub mod model;
// ターミナルへのグラフ描画
pub mod report;
