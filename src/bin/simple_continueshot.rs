// 该文件是 Looker3d 项目的一部分。
// src/bin/simple_continueshot.rs - 持续解码并渲染样本流
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use looker3d::{
  FromUrl,
  decode::LabelDecoder,
  overlay::ColoringConfig,
  settings::Looker3dSettings,
  task::{ContinuousTask, SceneOptions, Task},
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 样本来源，`.jsonl` 每行一组样本
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  #[arg(long, value_name = "FILE")]
  pub settings: Option<PathBuf>,
  #[arg(long, value_name = "FILE")]
  pub coloring: Option<PathBuf>,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("样本来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut options = SceneOptions::default();
  if let Some(path) = &args.settings {
    options.settings = Looker3dSettings::from_json_file(path)?;
  }
  if let Some(path) = &args.coloring {
    options.coloring = ColoringConfig::from_json_file(path)?;
  }

  let input = looker3d::input::InputWrapper::from_url(&args.input)?;
  let output = looker3d::output::OutputWrapper::from_url(&args.output)?;

  ContinuousTask::new(options)
    .with_frame_number(args.frame_number)
    .run_task(input, LabelDecoder, output)?;

  Ok(())
}
