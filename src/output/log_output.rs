// 该文件是 Looker3d 项目的一部分。
// src/output/log_output.rs - 以日志形式输出场景
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

use std::convert::Infallible;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  label::SampleGroup,
  output::Render,
  overlay::OverlayDescriptor,
  scene::Scene,
};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `log://`，`log://?verbose` 逐个打印节点
pub struct LogOutput {
  verbose: bool,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    let verbose = uri.query_pairs().any(|(k, _)| k == "verbose");
    Ok(LogOutput { verbose })
  }
}

impl Render<SampleGroup, Scene> for LogOutput {
  type Error = Infallible;

  fn render_result(&self, group: &SampleGroup, scene: &Scene) -> Result<(), Self::Error> {
    info!(
      "样本 {}: {} 个长方体, {} 条折线",
      group.canonical_sample_id().unwrap_or("-"),
      scene.cuboids().count(),
      scene.polylines().count()
    );
    if self.verbose {
      for node in &scene.nodes {
        let common = node.overlay.common();
        match &node.overlay {
          OverlayDescriptor::Cuboid(c) => info!(
            "  {} [{}] {:?} 颜色 {} 中心 {:?} 尺寸 {:?}",
            node.key,
            common.path,
            common.label,
            common.color,
            c.center.to_array(),
            c.dimensions.to_array()
          ),
          OverlayDescriptor::Polyline(p) => info!(
            "  {} [{}] {:?} 颜色 {} 共 {} 段",
            node.key,
            common.path,
            common.label,
            common.color,
            p.points.len()
          ),
        }
      }
    } else {
      debug!("场景节点: {:?}", scene.nodes.iter().map(|n| &n.key).collect::<Vec<_>>());
    }
    Ok(())
  }
}
