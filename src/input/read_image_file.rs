// 该文件是 Fenjian （分拣） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  input::{InputError, UploadedImage},
};

/// 单个图像文件输入，例如 `image:///uploads/1700000000.jpg?mime=image/png`
///
/// 未给出 `mime` 参数时按扩展名推断。
pub struct ImageFileInput {
  image: Option<UploadedImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = decode_url_path(url);
    let mime = url
      .query_pairs()
      .find(|(key, _)| key == "mime")
      .map(|(_, value)| value.into_owned());

    let image = match mime {
      Some(mime) => UploadedImage::from_path(&path, mime),
      None => UploadedImage::from_path_guess_mime(&path),
    };
    debug!("图像输入: {} ({})", path, image.declared_mime());

    Ok(ImageFileInput { image: Some(image) })
  }
}

impl Iterator for ImageFileInput {
  type Item = UploadedImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_the_file_once() {
    let url = Url::parse("image:///tmp/up%20loads/a.png").unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let image = input.next().unwrap();
    assert_eq!(image.path().unwrap().to_str(), Some("/tmp/up loads/a.png"));
    assert_eq!(image.declared_mime(), "image/png");
    assert!(input.next().is_none());
  }

  #[test]
  fn mime_query_overrides_extension() {
    let url = Url::parse("image:///tmp/upload.bin?mime=image/jpeg").unwrap();
    let image = ImageFileInput::from_url(&url).unwrap().next().unwrap();
    assert_eq!(image.declared_mime(), "image/jpeg");
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("file:///tmp/a.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }
}
