// 该文件是 Fenjian （分拣） 项目的一部分。
// src/input/directory_input.rs - 上传目录输入
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

use std::{collections::VecDeque, path::PathBuf};

use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  input::{ImageMime, InputError, UploadedImage},
};

/// 目录输入，例如 `dir:///srv/uploads`
///
/// 按文件名顺序产出目录下所有 jpg/jpeg/png 文件，不递归子目录。
pub struct DirectoryInput {
  pending: VecDeque<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "dir";
}

impl FromUrl for DirectoryInput {
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

    let dir = PathBuf::from(decode_url_path(url));
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
      let path = entry?.path();
      if path.is_file() && ImageMime::from_extension(&path).is_some() {
        files.push(path);
      }
    }
    files.sort();
    info!("目录 {} 中找到 {} 个图像文件", dir.display(), files.len());

    Ok(DirectoryInput {
      pending: files.into(),
    })
  }
}

impl Iterator for DirectoryInput {
  type Item = UploadedImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.pending.pop_front().map(UploadedImage::from_path_guess_mime)
  }
}
