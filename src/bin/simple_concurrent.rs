// 该文件是 Fenjian （分拣） 项目的一部分。
// src/bin/simple_concurrent.rs - 多线程并发分类
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
  task::{ConcurrentTask, Task},
};
use tracing::info;

/// Fenjian 并发分类
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
  /// 工作线程数
  #[arg(long, value_name = "WORKERS", default_value_t = 4)]
  pub workers: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("配置文件: {}", args.config.display());
  info!("输入来源: {}", args.input);
  info!("输出目标: {}", args.output);
  info!("工作线程数: {}", args.workers);

  let config = PipelineConfig::load(&args.config)?;
  let pipeline = Arc::new(Pipeline::initialize(&config)?);
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  ConcurrentTask::default()
    .with_workers(args.workers)
    .with_timeout(config.timeout())
    .run_task(input, pipeline, output)?;

  Ok(())
}
