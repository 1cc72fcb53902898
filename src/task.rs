// 该文件是 Fenjian （分拣） 项目的一部分。
// src/task.rs - 任务
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
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver},
  },
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::{
  input::UploadedImage,
  output::Render,
  pipeline::{Pipeline, PipelineError, Prediction},
};

pub trait Task<I, O>: Sized {
  type Error;
  fn run_task(self, input: I, pipeline: Arc<Pipeline>, output: O) -> Result<(), Self::Error>;
}

fn classify(
  pipeline: &Arc<Pipeline>,
  image: UploadedImage,
  timeout: Option<Duration>,
) -> Result<Prediction, PipelineError> {
  match timeout {
    Some(timeout) => pipeline.predict_with_timeout(image, timeout),
    None => pipeline.predict(image),
  }
}

/// 任务结束后，若没有其他持有者则关闭流水线
fn finish(pipeline: Arc<Pipeline>) {
  match Arc::try_unwrap(pipeline) {
    Ok(pipeline) => pipeline.shutdown(),
    Err(_) => warn!("仍有未完成的推理，流水线将在其结束后释放"),
  }
}

#[derive(Default, Debug)]
pub struct OneShotTask {
  timeout: Option<Duration>,
}

impl OneShotTask {
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<I, O, RE> Task<I, O> for OneShotTask
where
  I: Iterator<Item = UploadedImage>,
  O: Render<str, Prediction, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pipeline: Arc<Pipeline>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    let source = image.to_string();
    info!("输入图像 {}，开始分类...", source);
    let now = Instant::now();
    let result = classify(&pipeline, image, self.timeout)?;
    info!("分类完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&source, &result)?;

    finish(pipeline);
    Ok(())
  }
}

/// 对同一张图像重复分类，统计平均耗时
#[derive(Debug)]
pub struct RepeatShotTask {
  repeat: usize,
  timeout: Option<Duration>,
}

const REPEAT_WARMUP: usize = 2;

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      repeat: 1000,
      timeout: None,
    }
  }
}

impl RepeatShotTask {
  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat;
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<I, O, RE> Task<I, O> for RepeatShotTask
where
  I: Iterator<Item = UploadedImage>,
  O: Render<str, Prediction, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pipeline: Arc<Pipeline>, output: O) -> Result<(), Self::Error> {
    if self.repeat <= REPEAT_WARMUP {
      anyhow::bail!("重复次数必须大于 {}", REPEAT_WARMUP);
    }

    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    let source = image.to_string();
    info!("输入图像 {}，开始分类...", source);

    let mut times = Vec::with_capacity(self.repeat);
    let mut failures = 0usize;
    for i in 0..self.repeat {
      let now = Instant::now();
      let result = classify(&pipeline, image.clone(), self.timeout);
      let elapsed = now.elapsed();
      match result {
        Ok(prediction) => {
          info!("({})分类完成，耗时: {:.2?}", i, elapsed);
          output.render_result(&source, &prediction)?;
        }
        Err(e) => {
          error!("({})分类失败: {}", i, e);
          failures += 1;
        }
      }
      times.push(elapsed);
    }

    warn!(
      "平均分类时间: {:.2?}，失败 {} 次",
      times.iter().skip(REPEAT_WARMUP).sum::<Duration>() / (times.len() - REPEAT_WARMUP) as u32,
      failures
    );

    finish(pipeline);
    Ok(())
  }
}

/// 依次处理输入源中的所有图像，直到耗尽、达到指定数量或收到中断信号
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  timeout: Option<Duration>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<I, O, RE> Task<I, O> for ContinuousTask
where
  I: Iterator<Item = UploadedImage>,
  O: Render<str, Prediction, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: Arc<Pipeline>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("无法设置 Ctrl-C 处理函数")?;

    let summary = self.run_loop(input, &pipeline, &output, &rx)?;
    info!("任务完成: 共 {} 张，失败 {} 张", summary.processed, summary.failures);
    finish(pipeline);
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousSummary {
  pub processed: usize,
  pub failures: usize,
}

impl ContinuousTask {
  /// 任务主循环；`stop` 收到消息后处理完当前图像即退出
  pub fn run_loop<I, O, RE>(
    &self,
    input: I,
    pipeline: &Arc<Pipeline>,
    output: &O,
    stop: &Receiver<()>,
  ) -> anyhow::Result<ContinuousSummary>
  where
    I: Iterator<Item = UploadedImage>,
    O: Render<str, Prediction, Error = RE>,
    RE: std::error::Error + Sync + Send + 'static,
  {
    let mut image_index = 0usize;
    let mut failures = 0usize;
    for image in input {
      image_index += 1;
      let source = image.to_string();
      info!("处理第 {} 张图像: {}", image_index, source);
      let now = Instant::now();
      match classify(pipeline, image, self.timeout) {
        Ok(prediction) => output.render_result(&source, &prediction)?,
        Err(e) => {
          error!("图像 {} 分类失败: {}", source, e);
          failures += 1;
        }
      }
      info!("耗时: {:.2?}", now.elapsed());

      if self.frame_number.map(|n| image_index >= n).unwrap_or(false) {
        info!("达到指定数量 {}, 退出任务循环", image_index);
        break;
      }
      if stop.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    Ok(ContinuousSummary {
      processed: image_index,
      failures,
    })
  }
}

/// 多个工作线程共享同一流水线，并发处理输入源中的图像
#[derive(Debug)]
pub struct ConcurrentTask {
  workers: usize,
  timeout: Option<Duration>,
}

impl Default for ConcurrentTask {
  fn default() -> Self {
    Self {
      workers: 4,
      timeout: None,
    }
  }
}

impl ConcurrentTask {
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<I, O, RE> Task<I, O> for ConcurrentTask
where
  I: Iterator<Item = UploadedImage> + Send,
  O: Render<str, Prediction, Error = RE> + Sync,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: Arc<Pipeline>, output: O) -> Result<(), Self::Error> {
    if self.workers == 0 {
      anyhow::bail!("工作线程数必须大于 0");
    }

    info!("开始任务，{} 个工作线程...", self.workers);
    let input = Mutex::new(input);
    let done = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);
    let now = Instant::now();

    thread::scope(|scope| {
      for worker in 0..self.workers {
        let (input, output, pipeline) = (&input, &output, &pipeline);
        let (done, failures) = (&done, &failures);
        scope.spawn(move || {
          loop {
            let next = match input.lock() {
              Ok(mut input) => input.next(),
              Err(_) => {
                error!("工作线程 {}: 输入锁已损坏", worker);
                break;
              }
            };
            let Some(image) = next else { break };

            let source = image.to_string();
            let rendered = classify(pipeline, image, self.timeout)
              .map_err(anyhow::Error::from)
              .and_then(|p| output.render_result(&source, &p).map_err(anyhow::Error::from));
            if let Err(e) = rendered {
              error!("工作线程 {}: 图像 {} 处理失败: {}", worker, source, e);
              failures.fetch_add(1, Ordering::Relaxed);
            }
            done.fetch_add(1, Ordering::Relaxed);
          }
        });
      }
    });

    info!(
      "任务完成: 共 {} 张，失败 {} 张，总耗时 {:.2?}",
      done.load(Ordering::Relaxed),
      failures.load(Ordering::Relaxed),
      now.elapsed()
    );
    finish(pipeline);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    label::LabelTable,
    model::{Classifier, Model, ModelError, RawOutput},
    pipeline::Preprocess,
    tensor::{InputSpec, InputTensor},
  };
  use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
  use std::{convert::Infallible, io::Cursor};

  /// 红色分量占优判为第 0 类，否则为第 1 类
  struct RedOrNot;

  impl Model for RedOrNot {
    type Input = InputTensor;
    type Output = RawOutput;
    type Error = ModelError;

    fn infer(&self, input: &InputTensor) -> Result<RawOutput, ModelError> {
      let plane = input.len() / 3;
      let red: f32 = input.data()[..plane].iter().sum();
      let green: f32 = input.data()[plane..2 * plane].iter().sum();
      Ok(RawOutput::from(if red > green {
        vec![1.0, 0.0]
      } else {
        vec![0.0, 1.0]
      }))
    }
  }

  impl Classifier for RedOrNot {
    fn input_spec(&self) -> InputSpec {
      InputSpec::nchw(3, 4, 4)
    }

    fn num_classes(&self) -> Option<usize> {
      Some(2)
    }
  }

  #[derive(Default)]
  struct Collect(Mutex<Vec<(String, String)>>);

  impl Render<str, Prediction> for &Collect {
    type Error = Infallible;

    fn render_result(&self, source: &str, result: &Prediction) -> Result<(), Self::Error> {
      self
        .0
        .lock()
        .unwrap()
        .push((source.to_string(), result.label.clone()));
      Ok(())
    }
  }

  fn image(color: [u8; 3]) -> UploadedImage {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 6, Rgb(color)))
      .write_to(&mut buffer, ImageFormat::Png)
      .unwrap();
    UploadedImage::from_bytes(buffer.into_inner(), "image/png")
  }

  fn pipeline() -> Arc<Pipeline> {
    let labels = LabelTable::new(["Red", "Other"]).unwrap();
    Arc::new(Pipeline::new(RedOrNot, labels, Preprocess::default()).unwrap())
  }

  #[test]
  fn oneshot_renders_first_image() {
    let collect = Collect::default();
    let inputs = vec![image([255, 0, 0]), image([0, 255, 0])];
    OneShotTask::default()
      .run_task(inputs.into_iter(), pipeline(), &collect)
      .unwrap();
    let rendered = collect.0.into_inner().unwrap();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].1, "Red");
  }

  #[test]
  fn oneshot_without_input_fails() {
    let collect = Collect::default();
    let result = OneShotTask::default().run_task(std::iter::empty::<UploadedImage>(), pipeline(), &collect);
    assert!(result.is_err());
  }

  #[test]
  fn repeatshot_renders_every_round() {
    let collect = Collect::default();
    RepeatShotTask::default()
      .with_repeat(5)
      .run_task(std::iter::once(image([0, 0, 255])), pipeline(), &collect)
      .unwrap();
    let rendered = collect.0.into_inner().unwrap();
    assert_eq!(rendered.len(), 5);
    assert!(rendered.iter().all(|(_, label)| label == "Other"));
  }

  fn upload_dir(colors: &[Option<[u8; 3]>]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (i, color) in colors.iter().enumerate() {
      let path = dir.path().join(format!("{:03}.png", i));
      match color {
        Some(color) => RgbImage::from_pixel(6, 6, Rgb(*color)).save(&path).unwrap(),
        None => std::fs::write(&path, b"broken upload").unwrap(),
      }
    }
    dir
  }

  fn dir_input(dir: &tempfile::TempDir) -> impl Iterator<Item = UploadedImage> {
    let mut paths: Vec<_> = std::fs::read_dir(dir.path())
      .unwrap()
      .map(|entry| entry.unwrap().path())
      .collect();
    paths.sort();
    paths.into_iter().map(UploadedImage::from_path_guess_mime)
  }

  #[test]
  fn continuous_task_stops_at_frame_number() {
    let dir = upload_dir(&[
      Some([255, 0, 0]),
      Some([0, 255, 0]),
      Some([255, 0, 0]),
      Some([0, 0, 255]),
    ]);
    let collect = Collect::default();
    let (_tx, rx) = mpsc::channel();

    let summary = ContinuousTask::default()
      .with_frame_number(Some(3))
      .run_loop(dir_input(&dir), &pipeline(), &&collect, &rx)
      .unwrap();
    assert_eq!(summary, ContinuousSummary { processed: 3, failures: 0 });

    let labels: Vec<_> = collect
      .0
      .into_inner()
      .unwrap()
      .into_iter()
      .map(|(_, label)| label)
      .collect();
    assert_eq!(labels, vec!["Red", "Other", "Red"]);
  }

  #[test]
  fn continuous_task_continues_after_a_broken_upload() {
    let dir = upload_dir(&[Some([255, 0, 0]), None, Some([0, 255, 0])]);
    let collect = Collect::default();
    let (_tx, rx) = mpsc::channel();

    let summary = ContinuousTask::default()
      .run_loop(dir_input(&dir), &pipeline(), &&collect, &rx)
      .unwrap();
    assert_eq!(summary, ContinuousSummary { processed: 3, failures: 1 });

    let rendered = collect.0.into_inner().unwrap();
    assert_eq!(rendered.len(), 2);
    assert!(rendered[0].0.ends_with("000.png"));
    assert!(rendered[1].0.ends_with("002.png"));
  }

  #[test]
  fn continuous_task_honours_stop_signal() {
    let dir = upload_dir(&[Some([255, 0, 0]), Some([0, 255, 0]), Some([255, 0, 0])]);
    let collect = Collect::default();
    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();

    let summary = ContinuousTask::default()
      .run_loop(dir_input(&dir), &pipeline(), &&collect, &rx)
      .unwrap();
    assert_eq!(summary.processed, 1);
  }

  #[test]
  fn concurrent_task_labels_each_image() {
    let collect = Collect::default();
    let inputs: Vec<_> = (0..24)
      .map(|i| {
        if i % 3 == 0 {
          image([200, 10, 10])
        } else {
          image([10, 200, 10])
        }
      })
      .collect();
    ConcurrentTask::default()
      .with_workers(4)
      .run_task(inputs.into_iter(), pipeline(), &collect)
      .unwrap();

    let rendered = collect.0.into_inner().unwrap();
    assert_eq!(rendered.len(), 24);
    assert_eq!(rendered.iter().filter(|(_, l)| l == "Red").count(), 8);
  }

  #[test]
  fn concurrent_task_skips_broken_uploads() {
    let collect = Collect::default();
    let inputs = vec![
      image([255, 0, 0]),
      UploadedImage::from_bytes(b"not an image".to_vec(), "image/png"),
      image([0, 255, 0]),
    ];
    ConcurrentTask::default()
      .with_workers(2)
      .run_task(inputs.into_iter(), pipeline(), &collect)
      .unwrap();
    assert_eq!(collect.0.into_inner().unwrap().len(), 2);
  }
}
