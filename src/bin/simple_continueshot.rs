// 该文件是 Fenjian （分拣） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续分类输入源中的图像
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use url::Url;

use fenjian::{
  FromUrl,
  config::PipelineConfig,
  input::InputWrapper,
  output::OutputWrapper,
  pipeline::Pipeline,
  task::{ContinuousTask, Task},
};
use tracing::info;

/// Fenjian 连续分类
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 流水线配置文件
  #[arg(long, value_name = "CONFIG")]
  pub config: PathBuf,
  /// 输入来源，例如 dir:///srv/uploads
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出目标
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 处理的图像数量，缺省时处理到输入耗尽
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("配置文件: {}", args.config.display());
  info!("输入来源: {}", args.input);
  info!("输出目标: {}", args.output);

  let config = PipelineConfig::load(&args.config)?;
  let pipeline = Arc::new(Pipeline::initialize(&config)?);
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_timeout(config.timeout())
    .run_task(input, pipeline, output)?;

  Ok(())
}
