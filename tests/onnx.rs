// 该文件是 Fenjian （分拣） 项目的一部分。
// tests/onnx.rs - ONNX 推理引擎测试
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

//! `tests/fixtures/channel_mean.onnx`：输入 `input` f32 `[1, 3, height, width]`，
//! GlobalAveragePool → Flatten → MatMul，输出 `output` f32 `[1, 2]`，
//! 两个得分分别为红、绿通道均值。`channel_mean_u8.onnx` 相同，但输入为 uint8。

use std::{path::PathBuf, sync::Arc, thread};

use fenjian::{
  config::PipelineConfig,
  frame::RgbNhwcFrame,
  input::UploadedImage,
  label::LabelTable,
  model::{Classifier, Model, ModelError, OnnxClassifier, OnnxClassifierBuilder},
  pipeline::{ErrorKind, Pipeline, Preprocess},
  tensor::{InputSpec, Normalization, normalize},
};
use image::{ImageFormat, Rgb, RgbImage};

fn fixture(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests/fixtures")
    .join(name)
}

fn channel_mean(pool: usize, size: Option<(usize, usize)>) -> OnnxClassifier {
  OnnxClassifierBuilder::new(fixture("channel_mean.onnx"))
    .input_name(Some("input".to_string()))
    .output_name(Some("output".to_string()))
    .session_pool_size(pool)
    .input_size(size)
    .build()
    .unwrap()
}

fn solid_frame(height: usize, width: usize, color: [u8; 3]) -> RgbNhwcFrame {
  let data = color.iter().copied().cycle().take(height * width * 3).collect();
  RgbNhwcFrame::from_raw(height, width, data).unwrap()
}

fn png(color: [u8; 3]) -> UploadedImage {
  let mut bytes = Vec::new();
  RgbImage::from_pixel(40, 30, Rgb(color))
    .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
    .unwrap();
  UploadedImage::from_bytes(bytes, "image/png")
}

#[test]
fn metadata_is_read_at_load() {
  let classifier = channel_mean(1, Some((16, 16)));
  assert_eq!(classifier.input_spec(), InputSpec::nchw(3, 16, 16));
  assert_eq!(classifier.num_classes(), Some(2));

  let classifier = channel_mean(1, None);
  assert_eq!(classifier.input_spec(), InputSpec::nchw(3, 224, 224));
}

#[test]
fn scores_come_from_the_engine() {
  let classifier = channel_mean(2, Some((16, 16)));
  let spec = classifier.input_spec();

  // 池大小为 2，连续调用会轮流使用两个会话
  for _ in 0..4 {
    let tensor = normalize(&solid_frame(16, 16, [255, 51, 0]), &spec, &Normalization::Unit).unwrap();
    let output = classifier.infer(&tensor).unwrap();
    assert_eq!(output.len(), 2);
    assert!((output.scores()[0] - 1.0).abs() < 1e-5, "{:?}", output.scores());
    assert!((output.scores()[1] - 0.2).abs() < 1e-5, "{:?}", output.scores());
  }
}

#[test]
fn wrong_tensor_is_rejected_before_the_engine() {
  let classifier = channel_mean(1, Some((16, 16)));
  let spec = InputSpec::nchw(3, 8, 8);
  let tensor = normalize(&solid_frame(8, 8, [0, 0, 0]), &spec, &Normalization::Unit).unwrap();
  let err = classifier.infer(&tensor).unwrap_err();
  assert!(matches!(err, ModelError::ShapeMismatch { .. }), "{err:?}");
}

#[test]
fn pipeline_over_the_engine_labels_each_caller() {
  let labels = LabelTable::new(["Recyclable", "Organic"]).unwrap();
  let pipeline = Arc::new(
    Pipeline::new(channel_mean(2, Some((32, 32))), labels, Preprocess::default()).unwrap(),
  );

  let handles: Vec<_> = (0..6)
    .map(|i| {
      let pipeline = Arc::clone(&pipeline);
      thread::spawn(move || {
        let (color, expected) = if i % 2 == 0 {
          ([230, 30, 30], "Recyclable")
        } else {
          ([30, 230, 30], "Organic")
        };
        for _ in 0..5 {
          assert_eq!(pipeline.run(png(color)).unwrap(), expected);
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }
}

#[test]
fn non_f32_input_is_refused_at_load() {
  let err = OnnxClassifierBuilder::new(fixture("channel_mean_u8.onnx"))
    .build()
    .unwrap_err();
  assert!(matches!(err, ModelError::ModelInvalid(_)), "{err:?}");
}

#[test]
fn unknown_tensor_names_are_refused_at_load() {
  let err = OnnxClassifierBuilder::new(fixture("channel_mean.onnx"))
    .input_name(Some("images".to_string()))
    .build()
    .unwrap_err();
  assert!(matches!(err, ModelError::ModelInvalid(_)), "{err:?}");

  let err = OnnxClassifierBuilder::new(fixture("channel_mean.onnx"))
    .output_name(Some("logits".to_string()))
    .build()
    .unwrap_err();
  assert!(matches!(err, ModelError::ModelInvalid(_)), "{err:?}");
}

#[test]
fn initialize_from_configuration() {
  let config = PipelineConfig::from_toml_str(
    r#"
      [model]
      url = "channel_mean.onnx"
      input_name = "input"
      output_name = "output"

      [preprocess]
      width = 24
      height = 24

      [labels]
      names = ["Recyclable", "Organic"]
    "#,
    Some(fixture("").as_path()),
  )
  .unwrap();
  let pipeline = Pipeline::initialize(&config).unwrap();
  assert_eq!(pipeline.input_spec(), InputSpec::nchw(3, 24, 24));
  assert_eq!(pipeline.run(png([20, 200, 20])).unwrap(), "Organic");
  pipeline.shutdown();

  let config = PipelineConfig::from_toml_str(
    r#"
      [model]
      url = "channel_mean_u8.onnx"

      [labels]
      names = ["Recyclable", "Organic"]
    "#,
    Some(fixture("").as_path()),
  )
  .unwrap();
  let err = Pipeline::initialize(&config).unwrap_err();
  assert_eq!(err.kind, ErrorKind::Config);
}
