// 该文件是 Fenjian （分拣） 项目的一部分。
// src/pipeline.rs - 分类流水线
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

//! 解码缩放 → 归一化 → 推理 → 判定，按顺序执行，任何一步失败即整体失败。
//!
//! 外层（HTTP 服务或命令行）只需要调用 [`Pipeline::run`]，
//! 所有错误都以统一的 [`PipelineError`] 返回。

use std::{
  fmt,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, RecvTimeoutError},
  },
  thread,
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{ConfigError, PipelineConfig},
  input::{InputError, ResizeFilter, UploadedImage, decode_and_resize},
  label::{LabelError, LabelTable},
  model::{Classifier, Model, ModelError},
  tensor::{InputSpec, Normalization, TensorError, normalize},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Decode,
  ShapeMismatch,
  Inference,
  Config,
  Timeout,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::Decode => "DecodeError",
      ErrorKind::ShapeMismatch => "ShapeMismatchError",
      ErrorKind::Inference => "InferenceError",
      ErrorKind::Config => "ConfigError",
      ErrorKind::Timeout => "Timeout",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct PipelineError {
  pub kind: ErrorKind,
  pub message: String,
}

impl PipelineError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  /// 启动阶段的模型错误一律视为配置错误
  fn startup(err: ModelError) -> Self {
    Self::new(ErrorKind::Config, err.to_string())
  }
}

impl From<InputError> for PipelineError {
  fn from(err: InputError) -> Self {
    let kind = match err {
      InputError::InvalidTarget(..) => ErrorKind::Config,
      _ => ErrorKind::Decode,
    };
    Self::new(kind, err.to_string())
  }
}

impl From<TensorError> for PipelineError {
  fn from(err: TensorError) -> Self {
    Self::new(ErrorKind::ShapeMismatch, err.to_string())
  }
}

impl From<ModelError> for PipelineError {
  fn from(err: ModelError) -> Self {
    let kind = match err {
      ModelError::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
      _ => ErrorKind::Inference,
    };
    Self::new(kind, err.to_string())
  }
}

impl From<LabelError> for PipelineError {
  fn from(err: LabelError) -> Self {
    let kind = match err {
      LabelError::NotANumber(_) => ErrorKind::Inference,
      _ => ErrorKind::Config,
    };
    Self::new(kind, err.to_string())
  }
}

impl From<ConfigError> for PipelineError {
  fn from(err: ConfigError) -> Self {
    Self::new(ErrorKind::Config, err.to_string())
  }
}

/// 与模型配套的预处理参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Preprocess {
  pub filter: ResizeFilter,
  pub normalization: Normalization,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
  pub label: String,
  pub index: usize,
  pub score: f32,
}

/// 分类流水线，持有唯一的模型实例
///
/// 初始化后只读，可放入 `Arc` 由多个线程同时调用。
pub struct Pipeline {
  classifier: Box<dyn Classifier>,
  labels: LabelTable,
  preprocess: Preprocess,
  input_spec: InputSpec,
  in_flight: Arc<AtomicUsize>,
  max_in_flight: usize,
}

/// 带超时调用的默认并发上限
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// 带超时调用的计数，工作线程结束时释放
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
  fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
    counter
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        (n < limit).then_some(n + 1)
      })
      .ok()?;
    Some(Self(Arc::clone(counter)))
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}

impl fmt::Debug for Pipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pipeline")
      .field("labels", &self.labels)
      .field("preprocess", &self.preprocess)
      .field("input_spec", &self.input_spec)
      .field("max_in_flight", &self.max_in_flight)
      .finish()
  }
}

impl Pipeline {
  /// 按配置加载标签表与模型；失败时不得对外提供服务
  pub fn initialize(config: &PipelineConfig) -> Result<Self, PipelineError> {
    let labels = config.label_table()?;
    let classifier = config
      .model_builder()?
      .build()
      .map_err(PipelineError::startup)?;
    let pipeline = Self::new(classifier, labels, config.preprocess())?;
    Ok(pipeline.with_max_in_flight(config.max_in_flight()))
  }

  /// 模型声明了固定类别数时立即检查与标签表是否一致
  pub fn new(
    classifier: impl Classifier + 'static,
    labels: LabelTable,
    preprocess: Preprocess,
  ) -> Result<Self, PipelineError> {
    let input_spec = classifier.input_spec();
    match classifier.num_classes() {
      Some(classes) => labels.check_class_count(classes)?,
      None => warn!("模型输出维度为动态，类别数将在每次推理时检查"),
    }
    info!(
      "流水线就绪: 输入 {:?}, {} 个类别, 归一化 {:?}",
      input_spec.shape(),
      labels.len(),
      preprocess.normalization
    );

    Ok(Self {
      classifier: Box::new(classifier),
      labels,
      preprocess,
      input_spec,
      in_flight: Arc::new(AtomicUsize::new(0)),
      max_in_flight: DEFAULT_MAX_IN_FLIGHT,
    })
  }

  /// 同时执行的带超时调用上限（含已超时但仍在后台运行的调用）
  pub fn with_max_in_flight(mut self, limit: usize) -> Self {
    self.max_in_flight = limit.max(1);
    self
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  pub fn input_spec(&self) -> InputSpec {
    self.input_spec
  }

  pub fn predict(&self, image: UploadedImage) -> Result<Prediction, PipelineError> {
    debug!("解码图像: {}", image);
    let frame = decode_and_resize(
      &image,
      self.input_spec.width,
      self.input_spec.height,
      self.preprocess.filter,
    )?;
    drop(image);

    let tensor = normalize(&frame, &self.input_spec, &self.preprocess.normalization)?;
    let output = self.classifier.infer(&tensor)?;
    let decision = self.labels.decide(&output)?;

    Ok(Prediction {
      label: decision.label.to_string(),
      index: decision.index,
      score: decision.score,
    })
  }

  pub fn run(&self, image: UploadedImage) -> Result<String, PipelineError> {
    self.predict(image).map(|p| p.label)
  }

  /// 在工作线程上执行，超过 `timeout` 返回 `Timeout`
  ///
  /// 超时的调用会在后台继续执行完毕，其结果被丢弃，期间仍占用一个会话。
  /// 后台线程数不超过 `max_in_flight`，达到上限时新调用直接返回 `Timeout`，
  /// 不再排在滞留的调用之后。
  pub fn predict_with_timeout(
    self: &Arc<Self>,
    image: UploadedImage,
    timeout: Duration,
  ) -> Result<Prediction, PipelineError> {
    let source = image.to_string();
    let in_flight = InFlight::acquire(&self.in_flight, self.max_in_flight).ok_or_else(|| {
      warn!("图像 {} 被拒绝: 已有 {} 个调用在执行", source, self.max_in_flight);
      PipelineError::new(
        ErrorKind::Timeout,
        format!("已有 {} 个带超时的调用在执行", self.max_in_flight),
      )
    })?;

    let (tx, rx) = mpsc::sync_channel(1);
    let pipeline = Arc::clone(self);

    thread::Builder::new()
      .name("fenjian-predict".to_string())
      .spawn(move || {
        let _in_flight = in_flight;
        let _ = tx.send(pipeline.predict(image));
      })
      .map_err(|e| PipelineError::new(ErrorKind::Inference, format!("无法启动工作线程: {}", e)))?;

    match rx.recv_timeout(timeout) {
      Ok(result) => result,
      Err(RecvTimeoutError::Timeout) => {
        warn!("图像 {} 处理超时 ({:?})", source, timeout);
        Err(PipelineError::new(
          ErrorKind::Timeout,
          format!("处理超过 {:?}", timeout),
        ))
      }
      Err(RecvTimeoutError::Disconnected) => Err(PipelineError::new(
        ErrorKind::Inference,
        "工作线程异常退出",
      )),
    }
  }

  pub fn run_with_timeout(
    self: &Arc<Self>,
    image: UploadedImage,
    timeout: Duration,
  ) -> Result<String, PipelineError> {
    self.predict_with_timeout(image, timeout).map(|p| p.label)
  }

  /// 释放推理引擎资源
  pub fn shutdown(self) {
    info!("关闭流水线");
    drop(self);
  }
}
