// 该文件是 Looker3d 项目的一部分。
// src/output/directory_record.rs - 按日期目录记录场景
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

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme,
  label::SampleGroup,
  output::Render,
  scene::{Scene, SceneNode},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 写入错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Record<'a> {
  sample_ids: Vec<&'a str>,
  recorded_at: String,
  nodes: &'a [SceneNode],
}

/// `folder:///dir`，场景为空时不记录，除非带 `always`
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  record_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      record_counter: AtomicU16::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn record_id(&self) -> u16 {
    self.record_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn record_path(&self, sample_id: &str) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}-{}.json",
      now.format("%H-%M-%S"),
      self.record_id(),
      file_safe(sample_id)
    )))
  }
}

// 样本 id 来自输入文档，只保留不会改变路径的字符
fn file_safe(sample_id: &str) -> String {
  sample_id
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect()
}

impl Render<SampleGroup, Scene> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, group: &SampleGroup, scene: &Scene) -> Result<(), Self::Error> {
    if !self.always && scene.is_empty() {
      return Ok(());
    }

    let path = self.record_path(group.canonical_sample_id().unwrap_or("unknown"))?;
    let record = Record {
      sample_ids: group.samples.iter().map(|s| s.id.as_str()).collect(),
      recorded_at: Utc::now().to_rfc3339(),
      nodes: &scene.nodes,
    };
    serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &record)?;
    info!("场景记录已保存: {}", path.display());
    Ok(())
  }
}
