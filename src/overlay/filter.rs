// 该文件是 Looker3d 项目的一部分。
// src/overlay/filter.rs - 标签过滤
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

use serde::Deserialize;

use crate::label::LabelRef;

/// 决定某个字段路径上的标签是否参与渲染
pub trait LabelFilter {
  fn include(&self, path: &str, label: &LabelRef<'_>) -> bool;
}

impl<F> LabelFilter for F
where
  F: Fn(&str, &LabelRef<'_>) -> bool,
{
  fn include(&self, path: &str, label: &LabelRef<'_>) -> bool {
    self(path, label)
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl LabelFilter for AcceptAll {
  fn include(&self, _path: &str, _label: &LabelRef<'_>) -> bool {
    true
  }
}

/// 按字段路径与标签标记过滤
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagFilter {
  /// 非空时只保留这些路径
  pub paths: Vec<String>,
  /// 非空时只保留带有其中任一标记的标签
  pub include_tags: Vec<String>,
  pub exclude_tags: Vec<String>,
}

impl LabelFilter for TagFilter {
  fn include(&self, path: &str, label: &LabelRef<'_>) -> bool {
    if !self.paths.is_empty() && !self.paths.iter().any(|p| p == path) {
      return false;
    }
    let tags = label.tags();
    if tags.iter().any(|t| self.exclude_tags.contains(t)) {
      return false;
    }
    self.include_tags.is_empty() || tags.iter().any(|t| self.include_tags.contains(t))
  }
}
