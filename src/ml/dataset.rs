//! ディレクトリ構成の画像データセット
//!
//! `root/<クラス名>/<画像>` の構成から (画像パス, クラスID) の一覧を作ります。
//! 画像本体はバッチ作成時に読み込みます。

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

/// 読み込み対象の拡張子
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 画像フォルダデータセット（パスのリストのみ保持）
#[derive(Clone, Debug)]
pub struct ImageFolderDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// ディレクトリから画像一覧を読み込む
    ///
    /// クラスはサブディレクトリ名の辞書順でIDを割り当てます。
    /// 各画像はヘッダを読んで読み込み可能か確認します。
    pub fn from_directory(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            anyhow::bail!("データセットのディレクトリが存在しません: {}", root.display());
        }

        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("ディレクトリを読み込めません: {}", root.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                class_dirs.push(path);
            }
        }
        class_dirs.sort();

        if class_dirs.len() < 2 {
            anyhow::bail!(
                "クラスディレクトリが2つ以上必要です: {} ({}個)",
                root.display(),
                class_dirs.len()
            );
        }

        let mut samples = Vec::new();
        let mut class_names = Vec::with_capacity(class_dirs.len());

        for (class_id, class_dir) in class_dirs.iter().enumerate() {
            let class_name = class_dir
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", class_dir.display()))?
                .to_string();

            let mut images = Vec::new();
            for entry in std::fs::read_dir(class_dir)? {
                let path = entry?.path();
                if is_image_file(&path) {
                    image::image_dimensions(&path)
                        .with_context(|| format!("画像を読み込めません: {}", path.display()))?;
                    images.push(path);
                }
            }
            images.sort();

            if images.is_empty() {
                anyhow::bail!("クラス '{}' に画像が1枚もありません", class_name);
            }

            log::info!("  クラス {}: {} ({} 枚)", class_id, class_name, images.len());
            samples.extend(images.into_iter().map(|path| (path, class_id)));
            class_names.push(class_name);
        }

        log::info!("{} クラスから {} 枚の画像を読み込みました", class_names.len(), samples.len());

        Ok(Self { samples, class_names })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }

    /// サンプル一覧（データセット順）
    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    /// データセットを学習用と検証用に分割
    ///
    /// クラスごとに固定シードでシャッフルし、先頭の `floor(n * validation_split)` 枚を検証用にします。
    /// 同じ入力とシードなら常に同じ分割になります。
    pub fn split(self, validation_split: f64, seed: u64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&validation_split) {
            anyhow::bail!("検証割合は [0, 1) の範囲で指定してください: {}", validation_split);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut valid = Vec::new();

        for class_id in 0..self.class_names.len() {
            let mut class_samples: Vec<_> = self
                .samples
                .iter()
                .filter(|(_, label)| *label == class_id)
                .cloned()
                .collect();
            class_samples.shuffle(&mut rng);

            let num_valid = (class_samples.len() as f64 * validation_split).floor() as usize;
            let rest = class_samples.split_off(num_valid);
            valid.extend(class_samples);
            train.extend(rest);
        }

        let train_dataset = Self {
            samples: train,
            class_names: self.class_names.clone(),
        };
        let val_dataset = Self {
            samples: valid,
            class_names: self.class_names,
        };

        Ok((train_dataset, val_dataset))
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// テスト用の画像フォルダを生成
#[cfg(test)]
pub(crate) fn write_test_dataset(root: &Path, classes: &[(&str, usize)], size: u32) {
    for (class_index, (name, count)) in classes.iter().enumerate() {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..*count {
            let shade = if class_index % 2 == 0 { 30 } else { 220 };
            let img = image::RgbImage::from_fn(size, size, |x, _| {
                image::Rgb([shade, (x % 256) as u8, (i * 10 % 256) as u8])
            });
            img.save(dir.join(format!("{name}_{i:02}.png"))).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovers_sorted_classes() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("dog", 3), ("cat", 2)], 8);

        let dataset = ImageFolderDataset::from_directory(dir.path()).unwrap();
        assert_eq!(dataset.class_names(), ["cat", "dog"]);
        assert_eq!(dataset.num_classes(), 2);
        assert_eq!(dataset.class_counts(), vec![2, 3]);
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.get(0).unwrap().label, 0);
        assert!(dataset.get(5).is_none());
    }

    #[test]
    fn test_ignores_non_image_files() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 2), ("dog", 2)], 8);
        std::fs::write(dir.path().join("cat").join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("README.md"), "top level file").unwrap();

        let dataset = ImageFolderDataset::from_directory(dir.path()).unwrap();
        assert_eq!(dataset.len(), 4);
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageFolderDataset::from_directory(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_single_class_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 3)], 8);
        assert!(ImageFolderDataset::from_directory(dir.path()).is_err());
    }

    #[test]
    fn test_empty_class_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 3)], 8);
        std::fs::create_dir_all(dir.path().join("dog")).unwrap();
        assert!(ImageFolderDataset::from_directory(dir.path()).is_err());
    }

    #[test]
    fn test_corrupt_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 2), ("dog", 2)], 8);
        std::fs::write(dir.path().join("dog").join("broken.png"), b"not a png").unwrap();
        assert!(ImageFolderDataset::from_directory(dir.path()).is_err());
    }

    #[test]
    fn test_split_counts_for_ten_and_ten() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 10), ("dog", 10)], 8);

        let dataset = ImageFolderDataset::from_directory(dir.path()).unwrap();
        let (train, valid) = dataset.split(0.2, 42).unwrap();

        assert_eq!(train.len(), 16);
        assert_eq!(valid.len(), 4);
        assert_eq!(valid.class_counts(), vec![2, 2]);
        assert_eq!(train.class_names(), valid.class_names());
    }

    #[test]
    fn test_split_count_is_floor_of_fraction() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 10), ("dog", 10)], 8);

        let dataset = ImageFolderDataset::from_directory(dir.path()).unwrap();
        let (train, valid) = dataset.split(0.7, 42).unwrap();

        assert_eq!(valid.class_counts(), vec![7, 7]);
        assert_eq!(train.class_counts(), vec![3, 3]);
    }

    #[test]
    fn test_split_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 7), ("dog", 9)], 8);

        let first = ImageFolderDataset::from_directory(dir.path()).unwrap().split(0.2, 42).unwrap();
        let second = ImageFolderDataset::from_directory(dir.path()).unwrap().split(0.2, 42).unwrap();

        assert_eq!(first.0.samples(), second.0.samples());
        assert_eq!(first.1.samples(), second.1.samples());
        assert_eq!(first.0.len() + first.1.len(), 16);
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), &[("cat", 2), ("dog", 2)], 8);
        let dataset = ImageFolderDataset::from_directory(dir.path()).unwrap();
        assert!(dataset.clone().split(1.0, 42).is_err());
        assert!(dataset.split(-0.1, 42).is_err());
    }
}
