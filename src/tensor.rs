// 该文件是 Fenjian （分拣） 项目的一部分。
// src/tensor.rs - 输入张量与归一化
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

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::frame::{RGB_CHANNELS, RgbNhwcFrame};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
  #[error("张量形状不匹配: 模型声明 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: [usize; 4],
    actual: [usize; 4],
  },
}

/// 张量维度顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
  /// (batch, channel, height, width)
  Nchw,
  /// (batch, height, width, channel)
  Nhwc,
}

/// 模型声明的输入形状，批大小恒为 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
  pub layout: TensorLayout,
  pub channels: usize,
  pub height: usize,
  pub width: usize,
}

impl InputSpec {
  pub fn nchw(channels: usize, height: usize, width: usize) -> Self {
    Self {
      layout: TensorLayout::Nchw,
      channels,
      height,
      width,
    }
  }

  pub fn nhwc(height: usize, width: usize, channels: usize) -> Self {
    Self {
      layout: TensorLayout::Nhwc,
      channels,
      height,
      width,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    match self.layout {
      TensorLayout::Nchw => [1, self.channels, self.height, self.width],
      TensorLayout::Nhwc => [1, self.height, self.width, self.channels],
    }
  }

  pub fn element_count(&self) -> usize {
    self.shape().iter().product()
  }
}

/// 逐元素的像素值变换
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Normalization {
  /// `raw / 255`
  #[default]
  Unit,
  /// 按通道 `(raw / 255 - mean) / std`
  MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
  pub fn imagenet() -> Self {
    Normalization::MeanStd {
      mean: IMAGENET_MEAN,
      std: IMAGENET_STD,
    }
  }

  #[inline]
  pub fn apply(&self, raw: u8, channel: usize) -> f32 {
    let unit = raw as f32 / 255.0;
    match self {
      Normalization::Unit => unit,
      Normalization::MeanStd { mean, std } => (unit - mean[channel]) / std[channel],
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
  layout: TensorLayout,
  shape: [usize; 4],
  data: Box<[f32]>,
}

impl InputTensor {
  pub fn layout(&self) -> TensorLayout {
    self.layout
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// 将 HWC 交错的像素帧转换为模型声明布局的浮点张量
pub fn normalize(
  frame: &RgbNhwcFrame,
  spec: &InputSpec,
  normalization: &Normalization,
) -> Result<InputTensor, TensorError> {
  let (height, width, channels) = (frame.height(), frame.width(), frame.channels());
  let actual = match spec.layout {
    TensorLayout::Nchw => [1, channels, height, width],
    TensorLayout::Nhwc => [1, height, width, channels],
  };
  if actual != spec.shape() {
    return Err(TensorError::ShapeMismatch {
      expected: spec.shape(),
      actual,
    });
  }

  let pixels = frame.as_nhwc();
  let data: Vec<f32> = match spec.layout {
    TensorLayout::Nhwc => pixels
      .iter()
      .enumerate()
      .map(|(i, &raw)| normalization.apply(raw, i % RGB_CHANNELS))
      .collect(),
    TensorLayout::Nchw => {
      let plane = height * width;
      let mut data = vec![0f32; channels * plane];
      for (i, &raw) in pixels.iter().enumerate() {
        let c = i % channels;
        let hw = i / channels;
        data[c * plane + hw] = normalization.apply(raw, c);
      }
      data
    }
  };
  debug!("归一化完成: 形状 {:?}", actual);

  Ok(InputTensor {
    layout: spec.layout,
    shape: actual,
    data: data.into_boxed_slice(),
  })
}
