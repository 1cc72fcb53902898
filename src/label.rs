// 该文件是 Fenjian （分拣） 项目的一部分。
// src/label.rs - 类别标签表与判定规则
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::RawOutput;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签表为空")]
  Empty,
  #[error("第 {0} 个标签为空白")]
  Blank(usize),
  #[error("模型输出长度 {outputs} 与标签表长度 {labels} 不一致")]
  LengthMismatch { outputs: usize, labels: usize },
  #[error("模型输出第 {0} 项为 NaN")]
  NotANumber(usize),
  #[error("标签文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件格式错误: {0}")]
  TomlError(#[from] toml::de::Error),
}

#[derive(Deserialize)]
struct LabelFile {
  labels: Vec<String>,
}

/// 类别下标到显示名称的映射，启动时加载一次，之后只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  names: Box<[String]>,
}

/// 一次判定的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision<'a> {
  pub index: usize,
  pub score: f32,
  pub label: &'a str,
}

impl LabelTable {
  pub fn new<I, S>(names: I) -> Result<Self, LabelError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let names: Box<[String]> = names.into_iter().map(Into::into).collect();
    if names.is_empty() {
      return Err(LabelError::Empty);
    }
    if let Some(index) = names.iter().position(|n| n.trim().is_empty()) {
      return Err(LabelError::Blank(index));
    }
    Ok(Self { names })
  }

  /// 解析形如 `labels = ["Recyclable", "Organic"]` 的 TOML 文本
  pub fn from_toml_str(text: &str) -> Result<Self, LabelError> {
    let file: LabelFile = toml::from_str(text)?;
    Self::new(file.labels)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let table = Self::from_toml_str(&text)?;
    info!("加载标签表 {}: {:?}", path.display(), table.names);
    Ok(table)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.names.get(index).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }

  /// 检查模型的类别数与标签表是否一致
  pub fn check_class_count(&self, classes: usize) -> Result<(), LabelError> {
    if classes != self.names.len() {
      return Err(LabelError::LengthMismatch {
        outputs: classes,
        labels: self.names.len(),
      });
    }
    Ok(())
  }

  /// 取得分最大的类别，并列时取下标最小者
  pub fn decide(&self, output: &RawOutput) -> Result<Decision<'_>, LabelError> {
    let scores = output.scores();
    self.check_class_count(scores.len())?;

    let mut best = 0usize;
    for (index, &score) in scores.iter().enumerate() {
      if score.is_nan() {
        return Err(LabelError::NotANumber(index));
      }
      if score > scores[best] {
        best = index;
      }
    }
    debug!("判定结果: 下标 {}, 得分 {}", best, scores[best]);

    Ok(Decision {
      index: best,
      score: scores[best],
      label: &self.names[best],
    })
  }
}

/// 将模型原始输出映射为标签名称
pub fn decide<'a>(output: &RawOutput, labels: &'a LabelTable) -> Result<&'a str, LabelError> {
  labels.decide(output).map(|d| d.label)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table(names: &[&str]) -> LabelTable {
    LabelTable::new(names.iter().copied()).unwrap()
  }

  #[test]
  fn picks_the_highest_score() {
    let labels = table(&["A", "B", "C"]);
    let output = RawOutput::from(vec![0.1, 0.9, 0.0]);
    assert_eq!(decide(&output, &labels).unwrap(), "B");
  }

  #[test]
  fn ties_go_to_the_lowest_index() {
    let labels = table(&["X", "Y"]);
    let output = RawOutput::from(vec![0.5, 0.5]);
    let decision = labels.decide(&output).unwrap();
    assert_eq!(decision.label, "X");
    assert_eq!(decision.index, 0);
  }

  #[test]
  fn negative_and_infinite_scores_rank_normally() {
    let labels = table(&["A", "B", "C"]);
    let output = RawOutput::from(vec![-3.0, -1.0, -2.0]);
    assert_eq!(decide(&output, &labels).unwrap(), "B");

    let output = RawOutput::from(vec![f32::NEG_INFINITY, 1.0, f32::INFINITY]);
    assert_eq!(decide(&output, &labels).unwrap(), "C");
  }

  #[test]
  fn length_mismatch_is_a_config_error() {
    let labels = table(&["Recyclable", "Organic"]);
    let output = RawOutput::from(vec![0.2, 0.3, 0.5]);
    assert!(matches!(
      decide(&output, &labels),
      Err(LabelError::LengthMismatch {
        outputs: 3,
        labels: 2
      })
    ));
  }

  #[test]
  fn nan_is_never_ranked() {
    let labels = table(&["A", "B"]);
    let output = RawOutput::from(vec![0.1, f32::NAN]);
    assert!(matches!(
      decide(&output, &labels),
      Err(LabelError::NotANumber(1))
    ));
  }

  #[test]
  fn same_input_same_label() {
    let labels = table(&["A", "B", "C", "D"]);
    let output = RawOutput::from(vec![0.3, 0.1, 0.3, 0.2]);
    let first = decide(&output, &labels).unwrap();
    for _ in 0..10 {
      assert_eq!(decide(&output, &labels).unwrap(), first);
    }
    assert_eq!(first, "A");
  }

  #[test]
  fn table_validation() {
    assert!(matches!(
      LabelTable::new(Vec::<String>::new()),
      Err(LabelError::Empty)
    ));
    assert!(matches!(
      LabelTable::new(["ok", "  "]),
      Err(LabelError::Blank(1))
    ));
  }

  #[test]
  fn parses_label_file() {
    let labels = LabelTable::from_toml_str(r#"labels = ["Recyclable", "Organic"]"#).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.get(1), Some("Organic"));
    assert_eq!(labels.get(2), None);
    assert!(LabelTable::from_toml_str("names = []").is_err());
  }
}
