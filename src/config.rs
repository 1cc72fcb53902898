// 该文件是 Fenjian （分拣） 项目的一部分。
// src/config.rs - 流水线配置
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

//! # 配置文件
//!
//! 模型、标签表与归一化方式必须成套给出，启动时一次性加载：
//!
//! ```toml
//! [model]
//! url = "models/model1.onnx"
//! input_name = "input"
//! output_name = "output"
//!
//! [preprocess]
//! width = 224
//! height = 224
//! filter = "triangle"
//! normalization = "unit"
//!
//! [labels]
//! file = "labels/waste.toml"
//!
//! [runtime]
//! timeout_ms = 5000
//! max_in_flight = 8
//! ```
//!
//! 相对路径以配置文件所在目录为基准。

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  input::ResizeFilter,
  label::{LabelError, LabelTable},
  model::{ModelError, OnnxClassifierBuilder, OptimizationLevel},
  pipeline::{DEFAULT_MAX_IN_FLIGHT, Preprocess},
  tensor::{Normalization, TensorLayout},
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("配置文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件格式错误: {0}")]
  TomlError(#[from] toml::de::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
  #[error("模型地址错误: {0}")]
  UrlError(#[from] url::ParseError),
  #[error("模型配置错误: {0}")]
  ModelError(#[from] ModelError),
  #[error("标签配置错误: {0}")]
  LabelError(#[from] LabelError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
  pub model: ModelConfig,
  #[serde(default)]
  pub preprocess: PreprocessConfig,
  pub labels: LabelsConfig,
  #[serde(default)]
  pub runtime: RuntimeConfig,
  #[serde(skip)]
  base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
  /// 模型文件路径或 `onnx://` 地址
  pub url: String,
  pub input_name: Option<String>,
  pub output_name: Option<String>,
  #[serde(default = "default_session_pool_size")]
  pub session_pool_size: usize,
  pub intra_threads: Option<usize>,
  pub optimization_level: Option<OptimizationLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationKind {
  #[default]
  Unit,
  Imagenet,
  MeanStd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreprocessConfig {
  /// 输入宽度；模型宽度为静态维度时必须与之一致
  pub width: Option<usize>,
  /// 输入高度；模型高度为静态维度时必须与之一致
  pub height: Option<usize>,
  #[serde(default)]
  pub filter: ResizeFilter,
  #[serde(default)]
  pub normalization: NormalizationKind,
  pub mean: Option<[f32; 3]>,
  pub std: Option<[f32; 3]>,
  pub layout: Option<TensorLayout>,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      width: None,
      height: None,
      filter: ResizeFilter::default(),
      normalization: NormalizationKind::default(),
      mean: None,
      std: None,
      layout: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelsConfig {
  pub file: Option<PathBuf>,
  pub names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
  pub timeout_ms: Option<u64>,
  /// 同时执行的带超时调用上限
  pub max_in_flight: Option<usize>,
}

fn default_session_pool_size() -> usize {
  1
}

impl PipelineConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Self::from_toml_str(&text, path.parent())
  }

  pub fn from_toml_str(text: &str, base_dir: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config: PipelineConfig = toml::from_str(text)?;
    config.base_dir = base_dir.map(Path::to_path_buf);
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    let pre = &self.preprocess;
    match (pre.width, pre.height) {
      (Some(w), Some(h)) if w == 0 || h == 0 => {
        return Err(ConfigError::Invalid(format!("输入尺寸必须大于 0: {}x{}", w, h)));
      }
      (Some(_), None) | (None, Some(_)) => {
        return Err(ConfigError::Invalid(
          "width 与 height 必须同时给出".to_string(),
        ));
      }
      _ => {}
    }
    if self.runtime.max_in_flight == Some(0) {
      return Err(ConfigError::Invalid("max_in_flight 必须大于 0".to_string()));
    }
    if self.model.session_pool_size == 0 {
      return Err(ConfigError::Invalid("会话池大小必须大于 0".to_string()));
    }

    match pre.normalization {
      NormalizationKind::MeanStd => match (&pre.mean, &pre.std) {
        (Some(mean), Some(std)) => {
          if mean.iter().any(|m| !m.is_finite()) {
            return Err(ConfigError::Invalid("mean 必须为有限值".to_string()));
          }
          if std.iter().any(|s| !s.is_finite() || *s == 0.0) {
            return Err(ConfigError::Invalid("std 必须为非零有限值".to_string()));
          }
        }
        _ => {
          return Err(ConfigError::Invalid(
            "mean_std 归一化需要同时给出 mean 与 std".to_string(),
          ));
        }
      },
      _ if pre.mean.is_some() || pre.std.is_some() => {
        return Err(ConfigError::Invalid(
          "只有 mean_std 归一化可以设置 mean 与 std".to_string(),
        ));
      }
      _ => {}
    }

    match (&self.labels.file, &self.labels.names) {
      (Some(_), None) | (None, Some(_)) => Ok(()),
      _ => Err(ConfigError::Invalid(
        "labels 中 file 与 names 必须且只能给出一个".to_string(),
      )),
    }
  }

  fn resolve(&self, path: &Path) -> PathBuf {
    match &self.base_dir {
      Some(base) if path.is_relative() => base.join(path),
      _ => path.to_path_buf(),
    }
  }

  pub fn normalization(&self) -> Normalization {
    let pre = &self.preprocess;
    match (pre.normalization, pre.mean, pre.std) {
      (NormalizationKind::Imagenet, _, _) => Normalization::imagenet(),
      (NormalizationKind::MeanStd, Some(mean), Some(std)) => Normalization::MeanStd { mean, std },
      _ => Normalization::Unit,
    }
  }

  pub fn preprocess(&self) -> Preprocess {
    Preprocess {
      filter: self.preprocess.filter,
      normalization: self.normalization(),
    }
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.runtime.timeout_ms.map(Duration::from_millis)
  }

  pub fn max_in_flight(&self) -> usize {
    self.runtime.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT)
  }

  pub fn label_table(&self) -> Result<LabelTable, ConfigError> {
    let table = match (&self.labels.file, &self.labels.names) {
      (Some(file), _) => LabelTable::load(self.resolve(file))?,
      (None, Some(names)) => LabelTable::new(names.iter().cloned())?,
      (None, None) => return Err(ConfigError::Invalid("缺少标签表".to_string())),
    };
    Ok(table)
  }

  pub fn model_builder(&self) -> Result<OnnxClassifierBuilder, ConfigError> {
    let model = &self.model;
    let builder = if model.url.contains("://") {
      OnnxClassifierBuilder::from_url(&Url::parse(&model.url)?)?
    } else {
      OnnxClassifierBuilder::new(self.resolve(Path::new(&model.url)))
    };

    Ok(
      builder
        .input_name(model.input_name.clone())
        .output_name(model.output_name.clone())
        .session_pool_size(model.session_pool_size)
        .intra_threads(model.intra_threads)
        .optimization_level(model.optimization_level)
        .layout(self.preprocess.layout)
        .input_size(self.preprocess.height.zip(self.preprocess.width)),
    )
  }
}
