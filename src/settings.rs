// 该文件是 Looker3d 项目的一部分。
// src/settings.rs - 三维场景设置
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

use std::path::Path;

use glam::{EulerRot, Quat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_LINE_WIDTH: f32 = 20.0;
const DEFAULT_LINE_WIDTH: f32 = 3.0;

#[derive(Error, Debug)]
pub enum SettingsError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 叠加层的旋转，单位为度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlaySettings {
  pub rotation: [f32; 3],
  pub item_rotation: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Looker3dSettings {
  pub overlay: OverlaySettings,
  /// 旧坐标系下长方体的 location 位于底面中心
  pub use_legacy_coordinates: bool,
  pub cuboid_line_width: f32,
  pub polyline_line_width: f32,
}

impl Default for Looker3dSettings {
  fn default() -> Self {
    Looker3dSettings {
      overlay: OverlaySettings::default(),
      use_legacy_coordinates: false,
      cuboid_line_width: DEFAULT_LINE_WIDTH,
      polyline_line_width: DEFAULT_LINE_WIDTH,
    }
  }
}

impl Looker3dSettings {
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
    let text = std::fs::read_to_string(path)?;
    let settings: Looker3dSettings = serde_json::from_str(&text)?;
    Ok(settings.clamped())
  }

  /// 线宽限制在 0..=20
  pub fn clamped(mut self) -> Self {
    self.cuboid_line_width = clamp_line_width(self.cuboid_line_width);
    self.polyline_line_width = clamp_line_width(self.polyline_line_width);
    self
  }

  pub fn overlay_rotation(&self) -> Quat {
    euler_from_degrees(self.overlay.rotation)
  }

  pub fn item_rotation(&self) -> Quat {
    euler_from_degrees(self.overlay.item_rotation)
  }
}

fn clamp_line_width(width: f32) -> f32 {
  if width.is_nan() {
    DEFAULT_LINE_WIDTH
  } else {
    width.clamp(0.0, MAX_LINE_WIDTH)
  }
}

pub fn euler_from_degrees(degrees: [f32; 3]) -> Quat {
  let [x, y, z] = degrees.map(f32::to_radians);
  Quat::from_euler(EulerRot::XYZ, x, y, z)
}

/// 标签自带的旋转，单位为弧度
pub fn euler_from_radians(radians: [f32; 3]) -> Quat {
  let [x, y, z] = radians;
  Quat::from_euler(EulerRot::XYZ, x, y, z)
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use glam::Vec3;
  use std::io::Write;

  #[test]
  fn missing_keys_use_defaults() {
    let settings: Looker3dSettings = serde_json::from_str("{}").unwrap();
    assert_eq!(settings, Looker3dSettings::default());
  }

  #[test]
  fn degrees_are_converted() {
    let q = euler_from_degrees([0.0, 0.0, 90.0]);
    let v = q * Vec3::X;
    assert_relative_eq!(v.x, 0.0, epsilon = 1e-6);
    assert_relative_eq!(v.y, 1.0, epsilon = 1e-6);
  }

  #[test]
  fn loads_and_clamps_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"{{"overlay": {{"rotation": [-90, 0, 0], "itemRotation": [0, 0, 45]}},
          "useLegacyCoordinates": true, "cuboidLineWidth": 40, "polylineLineWidth": -1}}"#
    )
    .unwrap();

    let settings = Looker3dSettings::from_json_file(file.path()).unwrap();
    assert!(settings.use_legacy_coordinates);
    assert_eq!(settings.overlay.item_rotation, [0.0, 0.0, 45.0]);
    assert_eq!(settings.cuboid_line_width, MAX_LINE_WIDTH);
    assert_eq!(settings.polyline_line_width, 0.0);

    let up = settings.overlay_rotation() * Vec3::Y;
    assert_relative_eq!(up.z, -1.0, epsilon = 1e-6);
  }
}
