// 该文件是 Looker3d 项目的一部分。
// src/input/sample_file.rs - 从 JSON 文件读取样本
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
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  label::{SampleError, SampleGroup},
};

#[derive(Error, Debug)]
pub enum SampleFileInputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{found}'")]
  SchemeMismatch { expected: String, found: String },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("样本文档错误: {0}")]
  SampleError(#[from] SampleError),
}

enum Source {
  /// 单个 `.json` 文档
  Single(Option<SampleGroup>),
  /// `.jsonl` 每行一个分组
  Lines(Lines<BufReader<File>>),
}

/// `sample:///path/to/samples.json` 或 `sample:///path/to/samples.jsonl`
pub struct SampleFileInput {
  source: Source,
}

impl FromUrlWithScheme for SampleFileInput {
  const SCHEME: &'static str = "sample";
}

impl FromUrl for SampleFileInput {
  type Error = SampleFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SampleFileInputError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        found: url.scheme().to_string(),
      });
    }
    Self::open(url.path())
  }
}

impl SampleFileInput {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SampleFileInputError> {
    let path = path.as_ref();
    let source = if path.extension().is_some_and(|ext| ext == "jsonl") {
      Source::Lines(BufReader::new(File::open(path)?).lines())
    } else {
      let text = std::fs::read_to_string(path)?;
      let doc = serde_json::from_str(&text)?;
      Source::Single(Some(SampleGroup::from_document(doc)?))
    };
    Ok(SampleFileInput { source })
  }
}

fn parse_line(line: &str) -> Result<SampleGroup, SampleFileInputError> {
  let doc = serde_json::from_str(line)?;
  Ok(SampleGroup::from_document(doc)?)
}

impl Iterator for SampleFileInput {
  type Item = SampleGroup;

  fn next(&mut self) -> Option<Self::Item> {
    match &mut self.source {
      Source::Single(group) => group.take(),
      Source::Lines(lines) => loop {
        let line = match lines.next()? {
          Ok(line) => line,
          Err(e) => {
            error!("读取样本文件失败: {}", e);
            return None;
          }
        };
        if line.trim().is_empty() {
          continue;
        }
        match parse_line(&line) {
          Ok(group) => return Some(group),
          Err(e) => warn!("跳过无法解析的样本行: {}", e),
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn reads_single_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.json");
    std::fs::write(&path, r#"{"_id": "s1", "gt": {"_cls": "Detections", "detections": []}}"#).unwrap();

    let url = Url::parse(&format!("sample://{}", path.display())).unwrap();
    let mut input = SampleFileInput::from_url(&url).unwrap();
    let group = input.next().unwrap();
    assert_eq!(group.canonical_sample_id(), Some("s1"));
    assert!(input.next().is_none());
  }

  #[test]
  fn reads_lines_and_skips_bad_ones() {
    let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
    writeln!(file, r#"{{"_id": "a"}}"#).unwrap();
    writeln!(file).unwrap();
    writeln!(file, "not json").unwrap();
    writeln!(file, r#"[{{"_id": "b"}}, {{"_id": "c"}}]"#).unwrap();
    file.flush().unwrap();

    let ids: Vec<_> = SampleFileInput::open(file.path())
      .unwrap()
      .map(|g| g.samples.len())
      .collect();
    assert_eq!(ids, vec![1, 2]);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("image:///tmp/a.png").unwrap();
    assert!(matches!(
      SampleFileInput::from_url(&url),
      Err(SampleFileInputError::SchemeMismatch { .. })
    ));
  }
}
