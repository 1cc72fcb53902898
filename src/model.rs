// 该文件是 Fenjian （分拣） 项目的一部分。
// src/model.rs - 模型
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

use thiserror::Error;

use crate::tensor::{InputSpec, InputTensor};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 分类模型：输入归一化后的张量，输出每个类别的得分
///
/// 实现必须允许多个线程同时调用 `infer`，互不干扰。
pub trait Classifier:
  Model<Input = InputTensor, Output = RawOutput, Error = ModelError> + Send + Sync
{
  /// 模型声明（并已解析动态维度）的输入形状
  fn input_spec(&self) -> InputSpec;

  /// 模型声明的类别数，输出维度为动态时返回 `None`
  fn num_classes(&self) -> Option<usize>;
}

/// 模型原始输出，顺序即训练时的类别顺序
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
  scores: Box<[f32]>,
}

impl RawOutput {
  pub fn scores(&self) -> &[f32] {
    &self.scores
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }
}

impl From<Vec<f32>> for RawOutput {
  fn from(scores: Vec<f32>) -> Self {
    Self {
      scores: scores.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("输入张量形状不匹配: 模型声明 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: [usize; 4],
    actual: [usize; 4],
  },
  #[error("推理错误: {0}")]
  InferenceFailed(String),
}

impl ModelError {
  pub fn invalid(msg: &str) -> Self {
    ModelError::ModelInvalid(msg.to_string())
  }
}

/// 调用推理前检查张量形状是否与模型声明一致
pub fn check_input(spec: &InputSpec, tensor: &InputTensor) -> Result<(), ModelError> {
  if tensor.shape() != spec.shape() || tensor.layout() != spec.layout {
    return Err(ModelError::ShapeMismatch {
      expected: spec.shape(),
      actual: tensor.shape(),
    });
  }
  Ok(())
}

mod onnx;
pub use self::onnx::{OnnxClassifier, OnnxClassifierBuilder, OptimizationLevel};

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::RgbNhwcFrame,
    pipeline::{ErrorKind, PipelineError},
    tensor::{Normalization, normalize},
  };

  fn tensor(spec: InputSpec, height: usize, width: usize) -> InputTensor {
    let frame = RgbNhwcFrame::with_shape(height, width);
    normalize(&frame, &spec, &Normalization::Unit).unwrap()
  }

  #[test]
  fn matching_tensor_passes() {
    let spec = InputSpec::nchw(3, 8, 6);
    assert!(check_input(&spec, &tensor(spec, 8, 6)).is_ok());
  }

  #[test]
  fn wrong_spatial_size_is_a_shape_mismatch() {
    let declared = InputSpec::nchw(3, 224, 224);
    let err = check_input(&declared, &tensor(InputSpec::nchw(3, 32, 32), 32, 32)).unwrap_err();
    assert!(
      matches!(
        err,
        ModelError::ShapeMismatch {
          expected: [1, 3, 224, 224],
          actual: [1, 3, 32, 32]
        }
      ),
      "{err:?}"
    );
    assert_eq!(PipelineError::from(err).kind, ErrorKind::ShapeMismatch);
  }

  #[test]
  fn layout_disagreement_is_a_shape_mismatch() {
    // [1, 3, 3, 3] reads the same in both layouts; only the layout tells them apart
    let declared = InputSpec::nchw(3, 3, 3);
    let nhwc = tensor(InputSpec::nhwc(3, 3, 3), 3, 3);
    assert_eq!(nhwc.shape(), declared.shape());
    let err = check_input(&declared, &nhwc).unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { .. }), "{err:?}");

    let declared = InputSpec::nhwc(4, 5, 3);
    let err = check_input(&declared, &tensor(InputSpec::nchw(3, 4, 5), 4, 5)).unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { .. }), "{err:?}");
  }
}
