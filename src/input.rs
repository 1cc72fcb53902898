// 该文件是 Fenjian （分拣） 项目的一部分。
// src/input.rs - 上传图像输入与解码缩放
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
  borrow::Cow,
  fmt,
  path::{Path, PathBuf},
};

use image::{ImageFormat, imageops::FilterType};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{FromUrl, frame::RgbNhwcFrame};

mod read_image_file;
pub use self::read_image_file::ImageFileInput;

#[cfg(feature = "directory_input")]
mod directory_input;
#[cfg(feature = "directory_input")]
pub use self::directory_input::DirectoryInput;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("不支持的 MIME 类型: '{0}'，仅允许 JPEG 和 PNG")]
  UnsupportedMime(String),
  #[error("无法识别的图像格式")]
  UnknownFormat,
  #[error("不支持的图像格式: {0:?}")]
  UnsupportedFormat(ImageFormat),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("目标尺寸无效: {0}x{1}")]
  InvalidTarget(usize, usize),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 允许上传的图像类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
  Jpeg,
  Png,
}

impl ImageMime {
  /// 解析声明的 MIME 类型，忽略大小写与 `;` 之后的参数
  pub fn parse(declared: &str) -> Result<Self, InputError> {
    let essence = declared
      .split(';')
      .next()
      .unwrap_or_default()
      .trim()
      .to_ascii_lowercase();
    match essence.as_str() {
      "image/jpeg" | "image/jpg" | "image/pjpeg" => Ok(ImageMime::Jpeg),
      "image/png" => Ok(ImageMime::Png),
      _ => Err(InputError::UnsupportedMime(declared.to_string())),
    }
  }

  pub fn from_extension(path: &Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      "jpg" | "jpeg" => Some(ImageMime::Jpeg),
      "png" => Some(ImageMime::Png),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ImageMime::Jpeg => "image/jpeg",
      ImageMime::Png => "image/png",
    }
  }

  fn image_format(&self) -> ImageFormat {
    match self {
      ImageMime::Jpeg => ImageFormat::Jpeg,
      ImageMime::Png => ImageFormat::Png,
    }
  }
}

/// 缩放插值方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
  Nearest,
  #[default]
  Triangle,
  CatmullRom,
  Gaussian,
  Lanczos3,
}

impl From<ResizeFilter> for FilterType {
  fn from(filter: ResizeFilter) -> Self {
    match filter {
      ResizeFilter::Nearest => FilterType::Nearest,
      ResizeFilter::Triangle => FilterType::Triangle,
      ResizeFilter::CatmullRom => FilterType::CatmullRom,
      ResizeFilter::Gaussian => FilterType::Gaussian,
      ResizeFilter::Lanczos3 => FilterType::Lanczos3,
    }
  }
}

#[derive(Debug, Clone)]
enum ImageData {
  Path(PathBuf),
  Bytes(Box<[u8]>),
}

/// 一次上传的图像：原始字节（或待读取的文件路径）加上声明的 MIME 类型
///
/// MIME 类型在解码阶段才校验，以便错误统一由流水线报告。
#[derive(Debug, Clone)]
pub struct UploadedImage {
  data: ImageData,
  declared_mime: String,
}

impl UploadedImage {
  pub fn from_path(path: impl Into<PathBuf>, mime: impl Into<String>) -> Self {
    Self {
      data: ImageData::Path(path.into()),
      declared_mime: mime.into(),
    }
  }

  pub fn from_bytes(bytes: impl Into<Box<[u8]>>, mime: impl Into<String>) -> Self {
    Self {
      data: ImageData::Bytes(bytes.into()),
      declared_mime: mime.into(),
    }
  }

  /// 按扩展名推断 MIME 类型，无法识别时声明为 `application/octet-stream`
  pub fn from_path_guess_mime(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let mime = ImageMime::from_extension(&path)
      .map(|m| m.as_str())
      .unwrap_or("application/octet-stream");
    Self::from_path(path, mime)
  }

  pub fn declared_mime(&self) -> &str {
    &self.declared_mime
  }

  pub fn path(&self) -> Option<&Path> {
    match &self.data {
      ImageData::Path(path) => Some(path),
      ImageData::Bytes(_) => None,
    }
  }

  /// 读取源数据；文件在返回前即被关闭
  fn read_bytes(&self) -> Result<Cow<'_, [u8]>, InputError> {
    match &self.data {
      ImageData::Path(path) => Ok(Cow::Owned(std::fs::read(path)?)),
      ImageData::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
    }
  }
}

impl fmt::Display for UploadedImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.data {
      ImageData::Path(path) => write!(f, "{}", path.display()),
      ImageData::Bytes(bytes) => write!(f, "<内存 {} 字节>", bytes.len()),
    }
  }
}

/// 解码上传图像并缩放到模型输入尺寸，输出固定为 3 通道 RGB
///
/// 带透明通道的图像丢弃 alpha，灰度图像扩展为 RGB。
/// 缩放直接拉伸到目标尺寸，不保持宽高比。
pub fn decode_and_resize(
  image: &UploadedImage,
  target_width: usize,
  target_height: usize,
  filter: ResizeFilter,
) -> Result<RgbNhwcFrame, InputError> {
  if target_width == 0 || target_height == 0 {
    return Err(InputError::InvalidTarget(target_width, target_height));
  }

  let declared = ImageMime::parse(image.declared_mime())?;
  let bytes = image.read_bytes()?;
  debug!("读取图像 {}: {} 字节", image, bytes.len());

  let format = image::guess_format(&bytes).map_err(|_| InputError::UnknownFormat)?;
  if format != ImageFormat::Jpeg && format != ImageFormat::Png {
    return Err(InputError::UnsupportedFormat(format));
  }
  if format != declared.image_format() {
    warn!(
      "声明类型 {} 与实际内容 {:?} 不一致，按实际内容解码",
      declared.as_str(),
      format
    );
  }

  let decoded = image::load_from_memory_with_format(&bytes, format)?;
  let rgb = decoded.to_rgb8();
  debug!(
    "原始尺寸 {}x{}, 目标尺寸 {}x{}",
    rgb.width(),
    rgb.height(),
    target_width,
    target_height
  );

  let (width, height) = (target_width as u32, target_height as u32);
  let resized = if rgb.dimensions() == (width, height) {
    rgb
  } else {
    image::imageops::resize(&rgb, width, height, filter.into())
  };

  Ok(RgbNhwcFrame::from(resized))
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "directory_input")]
  Directory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?)),
      #[cfg(feature = "directory_input")]
      DirectoryInput::SCHEME => Ok(InputWrapper::Directory(DirectoryInput::from_url(url)?)),
      other => Err(InputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Iterator for InputWrapper {
  type Item = UploadedImage;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "directory_input")]
      InputWrapper::Directory(input) => input.next(),
    }
  }
}
