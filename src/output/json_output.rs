// 该文件是 Fenjian （分拣） 项目的一部分。
// src/output/json_output.rs - JSON 行输出
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

use std::io::Write;

use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, output::Render, pipeline::Prediction};

#[derive(Error, Debug)]
pub enum JsonOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("不支持的输出流: {0}，仅支持 stdout 或 stderr")]
  UnknownStream(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
  Stdout,
  Stderr,
}

/// 每个结果输出一行 JSON，例如 `json://stdout`
#[derive(Debug)]
pub struct JsonOutput {
  stream: Stream,
}

impl FromUrlWithScheme for JsonOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonOutput {
  type Error = JsonOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonOutputError::SchemeMismatch);
    }

    let stream = match url.host_str().unwrap_or("stdout") {
      "stdout" | "" => Stream::Stdout,
      "stderr" => Stream::Stderr,
      other => return Err(JsonOutputError::UnknownStream(other.to_string())),
    };
    Ok(JsonOutput { stream })
  }
}

fn to_line(source: &str, result: &Prediction) -> String {
  json!({
    "source": source,
    "label": result.label,
    "index": result.index,
    "score": result.score,
  })
  .to_string()
}

impl Render<str, Prediction> for JsonOutput {
  type Error = JsonOutputError;

  fn render_result(&self, source: &str, result: &Prediction) -> Result<(), Self::Error> {
    let line = to_line(source, result);
    match self.stream {
      Stream::Stdout => writeln!(std::io::stdout().lock(), "{}", line)?,
      Stream::Stderr => writeln!(std::io::stderr().lock(), "{}", line)?,
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stream_is_taken_from_host() {
    let output = JsonOutput::from_url(&Url::parse("json://stderr").unwrap()).unwrap();
    assert_eq!(output.stream, Stream::Stderr);
    let output = JsonOutput::from_url(&Url::parse("json://stdout").unwrap()).unwrap();
    assert_eq!(output.stream, Stream::Stdout);
    assert!(matches!(
      JsonOutput::from_url(&Url::parse("json://socket").unwrap()),
      Err(JsonOutputError::UnknownStream(_))
    ));
  }

  #[test]
  fn line_carries_label_and_score() {
    let prediction = Prediction {
      label: "Recyclable".to_string(),
      index: 0,
      score: 0.5,
    };
    let value: serde_json::Value = serde_json::from_str(&to_line("uploads/a.png", &prediction)).unwrap();
    assert_eq!(value["source"], "uploads/a.png");
    assert_eq!(value["label"], "Recyclable");
    assert_eq!(value["index"], 0);
    assert_eq!(value["score"], 0.5);
  }
}
