// 该文件是 Fenjian （分拣） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 分类模型
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

use std::{
  path::{Path, PathBuf},
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use ndarray::ArrayView4;
use ort::{
  session::{
    Session,
    builder::{GraphOptimizationLevel, SessionBuilder},
  },
  tensor::TensorElementType,
  value::{TensorRef, ValueType},
};
use serde::Deserialize;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  model::{Classifier, Model, ModelError, RawOutput, check_input},
  tensor::{InputSpec, InputTensor, TensorLayout},
};

const ONNX_DEFAULT_INPUT_H: usize = 224;
const ONNX_DEFAULT_INPUT_W: usize = 224;
const ONNX_RGB_CHANNELS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
  Disable,
  Level1,
  Level2,
  Level3,
}

impl From<OptimizationLevel> for GraphOptimizationLevel {
  fn from(level: OptimizationLevel) -> Self {
    match level {
      OptimizationLevel::Disable => GraphOptimizationLevel::Disable,
      OptimizationLevel::Level1 => GraphOptimizationLevel::Level1,
      OptimizationLevel::Level2 => GraphOptimizationLevel::Level2,
      OptimizationLevel::Level3 => GraphOptimizationLevel::Level3,
    }
  }
}

/// ONNX 分类模型
///
/// `Session::run` 需要独占访问，因此持有一个会话池，每个会话由 `Mutex` 保护，
/// 调用按轮询方式分配会话。池大小为 1 时所有调用串行执行。
pub struct OnnxClassifier {
  sessions: Vec<Mutex<Session>>,
  next_idx: AtomicUsize,
  input_name: String,
  output_name: String,
  input_spec: InputSpec,
  num_classes: Option<usize>,
  model_path: PathBuf,
}

impl std::fmt::Debug for OnnxClassifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OnnxClassifier")
      .field("sessions", &self.sessions.len())
      .field("input_name", &self.input_name)
      .field("output_name", &self.output_name)
      .field("input_spec", &self.input_spec)
      .field("num_classes", &self.num_classes)
      .field("model_path", &self.model_path)
      .finish()
  }
}

impl OnnxClassifier {
  pub fn model_path(&self) -> &Path {
    &self.model_path
  }
}

impl Drop for OnnxClassifier {
  fn drop(&mut self) {
    info!(
      "释放模型 {} 的 {} 个推理会话",
      self.model_path.display(),
      self.sessions.len()
    );
  }
}

pub struct OnnxClassifierBuilder {
  model_path: PathBuf,
  input_name: Option<String>,
  output_name: Option<String>,
  session_pool_size: usize,
  intra_threads: Option<usize>,
  optimization_level: Option<OptimizationLevel>,
  layout: Option<TensorLayout>,
  input_size: Option<(usize, usize)>,
}

impl FromUrlWithScheme for OnnxClassifierBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxClassifierBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Self::new(decode_url_path(url)))
  }
}

impl OnnxClassifierBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      input_name: None,
      output_name: None,
      session_pool_size: 1,
      intra_threads: None,
      optimization_level: None,
      layout: None,
      input_size: None,
    }
  }

  pub fn input_name(mut self, name: Option<String>) -> Self {
    self.input_name = name;
    self
  }

  pub fn output_name(mut self, name: Option<String>) -> Self {
    self.output_name = name;
    self
  }

  pub fn session_pool_size(mut self, size: usize) -> Self {
    self.session_pool_size = size;
    self
  }

  pub fn intra_threads(mut self, threads: Option<usize>) -> Self {
    self.intra_threads = threads;
    self
  }

  pub fn optimization_level(mut self, level: Option<OptimizationLevel>) -> Self {
    self.optimization_level = level;
    self
  }

  /// 强制指定输入布局，否则根据模型声明推断
  pub fn layout(mut self, layout: Option<TensorLayout>) -> Self {
    self.layout = layout;
    self
  }

  /// 期望的输入高宽：模型高宽为动态维度时使用，为静态维度时必须与之一致
  pub fn input_size(mut self, size: Option<(usize, usize)>) -> Self {
    self.input_size = size;
    self
  }

  fn session_builder(&self) -> Result<SessionBuilder, ort::Error> {
    let mut builder = Session::builder()?;
    if let Some(threads) = self.intra_threads {
      builder = builder.with_intra_threads(threads)?;
    }
    if let Some(level) = self.optimization_level {
      builder = builder.with_optimization_level(level.into())?;
    }
    Ok(builder)
  }

  pub fn build(self) -> Result<OnnxClassifier, ModelError> {
    if self.session_pool_size == 0 {
      return Err(ModelError::invalid("会话池大小必须大于 0"));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 {} 个 ONNX 推理会话", self.session_pool_size);
    let mut sessions = Vec::with_capacity(self.session_pool_size);
    for _ in 0..self.session_pool_size {
      let session = self.session_builder()?.commit_from_memory(&model_data)?;
      sessions.push(session);
    }

    let first = &sessions[0];
    debug!(
      "模型输入: {:?}",
      first.inputs.iter().map(|i| &i.name).collect::<Vec<_>>()
    );
    debug!(
      "模型输出: {:?}",
      first.outputs.iter().map(|o| &o.name).collect::<Vec<_>>()
    );

    let input = match &self.input_name {
      Some(name) => first.inputs.iter().find(|i| &i.name == name),
      None => first.inputs.first(),
    }
    .ok_or_else(|| {
      error!("模型中找不到输入 {:?}", self.input_name);
      ModelError::invalid("找不到模型输入")
    })?;
    let input_dims: Vec<i64> = match &input.input_type {
      ValueType::Tensor { ty, shape, .. } => {
        check_element_type(*ty, "输入")?;
        shape.iter().copied().collect()
      }
      _ => return Err(ModelError::invalid("模型输入不是张量")),
    };

    let output = match &self.output_name {
      Some(name) => first.outputs.iter().find(|o| &o.name == name),
      None => first.outputs.first(),
    }
    .ok_or_else(|| {
      error!("模型中找不到输出 {:?}", self.output_name);
      ModelError::invalid("找不到模型输出")
    })?;
    let output_dims: Vec<i64> = match &output.output_type {
      ValueType::Tensor { ty, shape, .. } => {
        check_element_type(*ty, "输出")?;
        shape.iter().copied().collect()
      }
      _ => return Err(ModelError::invalid("模型输出不是张量")),
    };

    let input_spec = resolve_input_spec(&input_dims, self.layout, self.input_size)?;
    let num_classes = resolve_class_count(&output_dims);
    info!(
      "模型加载完成: 输入 '{}' {:?} ({:?}), 输出 '{}' {:?}",
      input.name,
      input_spec.shape(),
      input_spec.layout,
      output.name,
      output_dims
    );

    let input_name = input.name.clone();
    let output_name = output.name.clone();

    Ok(OnnxClassifier {
      sessions: sessions.into_iter().map(Mutex::new).collect(),
      next_idx: AtomicUsize::new(0),
      input_name,
      output_name,
      input_spec,
      num_classes,
      model_path: self.model_path,
    })
  }
}

/// 输入与输出都必须是 f32 张量
fn check_element_type(ty: TensorElementType, what: &str) -> Result<(), ModelError> {
  if ty != TensorElementType::Float32 {
    return Err(ModelError::ModelInvalid(format!(
      "模型{}元素类型必须为 f32，实际为 {:?}",
      what, ty
    )));
  }
  Ok(())
}

/// 静态维度必须与期望尺寸一致；动态维度取期望尺寸，未给出时取默认值
fn resolve_dim(
  declared: i64,
  requested: Option<usize>,
  default: usize,
  name: &str,
) -> Result<usize, ModelError> {
  match (declared, requested) {
    (d, Some(r)) if d > 0 && d as usize != r => Err(ModelError::ModelInvalid(format!(
      "配置的输入{}为 {}，模型声明为 {}",
      name, r, d
    ))),
    (d, _) if d > 0 => Ok(d as usize),
    (_, requested) => Ok(requested.unwrap_or(default)),
  }
}

/// 由模型声明的输入维度得到输入形状
fn resolve_input_spec(
  dims: &[i64],
  layout: Option<TensorLayout>,
  requested: Option<(usize, usize)>,
) -> Result<InputSpec, ModelError> {
  if dims.len() != 4 {
    return Err(ModelError::ModelInvalid(format!(
      "模型输入必须为 4 维，实际为 {:?}",
      dims
    )));
  }
  if dims[0] > 1 {
    return Err(ModelError::ModelInvalid(format!(
      "模型批大小必须为 1 或动态，实际为 {}",
      dims[0]
    )));
  }

  let layout = match layout {
    Some(layout) => layout,
    None if dims[1] == ONNX_RGB_CHANNELS => TensorLayout::Nchw,
    None if dims[3] == ONNX_RGB_CHANNELS => TensorLayout::Nhwc,
    None => {
      return Err(ModelError::ModelInvalid(format!(
        "无法从输入维度 {:?} 推断通道位置",
        dims
      )));
    }
  };

  let (c, h, w) = match layout {
    TensorLayout::Nchw => (dims[1], dims[2], dims[3]),
    TensorLayout::Nhwc => (dims[3], dims[1], dims[2]),
  };
  if c != ONNX_RGB_CHANNELS {
    return Err(ModelError::ModelInvalid(format!(
      "模型输入通道数必须为 3，实际为 {}",
      c
    )));
  }

  let height = resolve_dim(h, requested.map(|r| r.0), ONNX_DEFAULT_INPUT_H, "高度")?;
  let width = resolve_dim(w, requested.map(|r| r.1), ONNX_DEFAULT_INPUT_W, "宽度")?;

  Ok(match layout {
    TensorLayout::Nchw => InputSpec::nchw(3, height, width),
    TensorLayout::Nhwc => InputSpec::nhwc(height, width, 3),
  })
}

/// 去掉批维度后的元素数即类别数；含动态维度时无法确定
fn resolve_class_count(dims: &[i64]) -> Option<usize> {
  let rest = dims.get(1..)?;
  if rest.is_empty() || rest.iter().any(|&d| d <= 0) {
    return None;
  }
  Some(rest.iter().product::<i64>() as usize)
}

impl Model for OnnxClassifier {
  type Input = InputTensor;
  type Output = RawOutput;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    check_input(&self.input_spec, input)?;

    let [n, d1, d2, d3] = input.shape();
    let view = ArrayView4::from_shape((n, d1, d2, d3), input.data())
      .map_err(|e| ModelError::InferenceFailed(format!("张量视图构造失败: {}", e)))?;
    let input_tensor = TensorRef::from_array_view(view)?;

    let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
    let mut session = self.sessions[idx].lock().map_err(|_| {
      ModelError::InferenceFailed(format!(
        "无法获取会话锁 {}/{}",
        idx,
        self.sessions.len()
      ))
    })?;

    debug!("执行模型推理 (会话 {})", idx);
    let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;
    let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
    debug!("模型输出形状: {:?}", shape.iter().collect::<Vec<_>>());

    if data.is_empty() {
      return Err(ModelError::InferenceFailed("模型输出为空".to_string()));
    }

    Ok(RawOutput::from(data.to_vec()))
  }
}

impl Classifier for OnnxClassifier {
  fn input_spec(&self) -> InputSpec {
    self.input_spec
  }

  fn num_classes(&self) -> Option<usize> {
    self.num_classes
  }
}
