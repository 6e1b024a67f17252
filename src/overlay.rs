// 该文件是 Looker3d 项目的一部分。
// src/overlay.rs - 三维叠加层描述
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

use std::collections::HashSet;

use glam::{Quat, Vec3};
use serde::Serialize;
use tracing::debug;

use crate::{
  label::{Detection, LabelRef, Polyline, Sample},
  settings::{Looker3dSettings, euler_from_radians},
};

pub mod color;
pub mod filter;

pub use self::color::{Color, ColorBy, ColoringConfig, label_color, should_show_label_tag};
pub use self::filter::{AcceptAll, LabelFilter, TagFilter};

/// 每个叠加层共有的信息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayCommon {
  pub id: String,
  pub path: String,
  pub sample_id: String,
  pub instance_id: Option<String>,
  pub label: Option<String>,
  pub color: Color,
  pub opacity: f32,
  pub tagged: bool,
  pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CuboidOverlay {
  #[serde(flatten)]
  pub common: OverlayCommon,
  pub dimensions: Vec3,
  /// 已旋转到场景坐标系的中心点
  pub center: Vec3,
  pub orientation: Quat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolylineOverlay {
  #[serde(flatten)]
  pub common: OverlayCommon,
  pub points: Vec<Vec<Vec3>>,
  pub closed: bool,
  pub filled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OverlayDescriptor {
  Cuboid(CuboidOverlay),
  Polyline(PolylineOverlay),
}

impl OverlayDescriptor {
  pub fn common(&self) -> &OverlayCommon {
    match self {
      OverlayDescriptor::Cuboid(c) => &c.common,
      OverlayDescriptor::Polyline(p) => &p.common,
    }
  }

  /// 场景中节点的键
  pub fn key(&self) -> String {
    let common = self.common();
    let kind = match self {
      OverlayDescriptor::Cuboid(_) => "cuboid",
      OverlayDescriptor::Polyline(_) => "polyline",
    };
    format!("{}-{}-{}", kind, common.id, common.sample_id)
  }
}

/// 构建叠加层所需的状态
#[derive(Debug, Clone, Default)]
pub struct OverlayConfig {
  pub coloring: ColoringConfig,
  pub settings: Looker3dSettings,
  pub selected_labels: HashSet<String>,
}

/// 把样本中的标签展开为叠加层描述。
///
/// 只有带 dimensions 与 location 的 Detection 成为长方体，
/// 只有带 points3d 的 Polyline 成为折线，其余标签被忽略。
pub fn build_overlays<'a, S>(
  samples: S,
  config: &OverlayConfig,
  filter: &dyn LabelFilter,
) -> Vec<OverlayDescriptor>
where
  S: IntoIterator<Item = &'a Sample>,
{
  let overlay_rotation = config.settings.overlay_rotation();
  let item_rotation = config.settings.item_rotation();
  let selected_tags = config.coloring.selected_label_tags.as_deref();

  let mut overlays = Vec::new();
  for sample in samples {
    for field in &sample.fields {
      for (index, leaf) in field.label.leaves().into_iter().enumerate() {
        let tagged = should_show_label_tag(selected_tags, leaf.tags());
        if !filter.include(&field.path, &leaf) {
          continue;
        }
        // 缺少 id 的标签按其在字段中的位置命名
        let id = match leaf.id() {
          Some(id) => id.to_string(),
          None => {
            debug!("字段 {} 中第 {} 个标签缺少 id", field.path, index);
            format!("{}-{}", field.path, index)
          }
        };

        let common = OverlayCommon {
          path: field.path.clone(),
          sample_id: sample.id.clone(),
          instance_id: leaf.instance_id().map(str::to_string),
          label: leaf.label().map(str::to_string),
          color: label_color(&config.coloring, &field.path, &leaf, tagged),
          opacity: config.coloring.opacity,
          tagged,
          selected: config.selected_labels.contains(&id),
          id,
        };

        let overlay = match leaf {
          LabelRef::Detection(d) => {
            cuboid(d, common, &config.settings, overlay_rotation, item_rotation)
          }
          LabelRef::Polyline(p) => polyline(p, common, overlay_rotation),
          LabelRef::Heatmap(_) | LabelRef::Segmentation(_) => None,
        };
        overlays.extend(overlay);
      }
    }
  }
  overlays
}

fn cuboid(
  detection: &Detection,
  common: OverlayCommon,
  settings: &Looker3dSettings,
  overlay_rotation: Quat,
  item_rotation: Quat,
) -> Option<OverlayDescriptor> {
  let dimensions = Vec3::from_array(detection.dimensions?);
  let mut location = Vec3::from_array(detection.location?);
  if settings.use_legacy_coordinates {
    // 旧坐标系的 location 在底面，移到几何中心
    location.y -= 0.5 * dimensions.y;
  }
  let label_rotation = euler_from_radians(detection.rotation.unwrap_or_default());

  Some(OverlayDescriptor::Cuboid(CuboidOverlay {
    common,
    dimensions,
    center: overlay_rotation * location,
    orientation: overlay_rotation * label_rotation * item_rotation,
  }))
}

fn polyline(line: &Polyline, common: OverlayCommon, overlay_rotation: Quat) -> Option<OverlayDescriptor> {
  let points = line
    .points3d
    .as_ref()?
    .iter()
    .map(|segment| {
      segment
        .iter()
        .map(|p| overlay_rotation * Vec3::from_array(*p))
        .collect()
    })
    .collect();

  Some(OverlayDescriptor::Polyline(PolylineOverlay {
    common,
    points,
    closed: line.closed,
    filled: line.filled,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::label::SampleGroup;
  use approx::assert_relative_eq;
  use serde_json::json;

  fn group() -> SampleGroup {
    SampleGroup::from_document(json!({
      "_id": "s1",
      "gt": {
        "_cls": "Detections",
        "detections": [
          { "_cls": "Detection", "_id": "box", "label": "car", "tags": ["fp"],
            "dimensions": [2, 4, 2], "location": [1, 2, 3], "rotation": [0, 0, 0] },
          { "_cls": "Detection", "_id": "flat", "label": "car", "bounding_box": [0, 0, 1, 1] }
        ]
      },
      "lanes": {
        "_cls": "Polylines",
        "polylines": [
          { "_cls": "Polyline", "_id": "lane", "points3d": [[[1, 0, 0], [2, 0, 0]]], "closed": true },
          { "_cls": "Polyline", "_id": "lane2d", "points": [[[0, 0], [1, 1]]] }
        ]
      },
      "seg": { "_cls": "Segmentation", "_id": "seg" }
    }))
    .unwrap()
  }

  #[test]
  fn partitions_by_geometry() {
    let group = group();
    let overlays = build_overlays(&group.samples, &OverlayConfig::default(), &AcceptAll);
    let keys: Vec<_> = overlays.iter().map(OverlayDescriptor::key).collect();
    assert_eq!(keys, vec!["cuboid-box-s1", "polyline-lane-s1"]);

    let OverlayDescriptor::Polyline(line) = &overlays[1] else {
      panic!("expected polyline");
    };
    assert!(line.closed);
    assert_eq!(line.points[0].len(), 2);
  }

  #[test]
  fn tag_filter_drops_labels() {
    let group = group();
    let filter = TagFilter {
      exclude_tags: vec!["fp".to_string()],
      ..Default::default()
    };
    let overlays = build_overlays(&group.samples, &OverlayConfig::default(), &filter);
    assert_eq!(overlays.len(), 1);
    assert_eq!(overlays[0].common().id, "lane");
  }

  #[test]
  fn applies_rotations_and_legacy_shift() {
    let group = group();
    let mut config = OverlayConfig::default();
    config.settings.overlay.rotation = [0.0, 0.0, 90.0];
    config.settings.use_legacy_coordinates = true;

    let overlays = build_overlays(&group.samples, &config, &AcceptAll);
    let OverlayDescriptor::Cuboid(cuboid) = &overlays[0] else {
      panic!("expected cuboid");
    };
    // (1, 2 - 2, 3) 绕 z 轴旋转 90 度
    assert_relative_eq!(cuboid.center.x, 0.0, epsilon = 1e-5);
    assert_relative_eq!(cuboid.center.y, 1.0, epsilon = 1e-5);
    assert_relative_eq!(cuboid.center.z, 3.0, epsilon = 1e-5);
    assert_eq!(cuboid.dimensions, Vec3::new(2.0, 4.0, 2.0));

    let OverlayDescriptor::Polyline(line) = &overlays[1] else {
      panic!("expected polyline");
    };
    assert_relative_eq!(line.points[0][1].y, 2.0, epsilon = 1e-5);
  }

  #[test]
  fn marks_selected_and_tagged() {
    let group = group();
    let mut config = OverlayConfig::default();
    config.selected_labels.insert("lane".to_string());
    config.coloring.selected_label_tags = Some(vec!["fp".to_string()]);

    let overlays = build_overlays(&group.samples, &config, &AcceptAll);
    assert!(overlays[0].common().tagged);
    assert!(!overlays[0].common().selected);
    assert!(overlays[1].common().selected);
    assert!(!overlays[1].common().tagged);
  }

  #[test]
  fn labels_without_id_keep_positional_keys() {
    let group = SampleGroup::from_document(json!({
      "_id": "s1",
      "gt": {
        "_cls": "Detections",
        "detections": [
          { "_cls": "Detection", "_id": "box", "dimensions": [1, 1, 1], "location": [0, 0, 0] },
          { "_cls": "Detection", "dimensions": [1, 1, 1], "location": [2, 0, 0] }
        ]
      },
      "lane": { "_cls": "Polyline", "points3d": [[[0, 0, 0], [1, 0, 0]]] }
    }))
    .unwrap();

    let overlays = build_overlays(&group.samples, &OverlayConfig::default(), &AcceptAll);
    let keys: Vec<_> = overlays.iter().map(OverlayDescriptor::key).collect();
    assert_eq!(keys, vec!["cuboid-box-s1", "cuboid-gt-1-s1", "polyline-lane-0-s1"]);
  }

  #[test]
  fn serializes_descriptor() {
    let group = group();
    let overlays = build_overlays(&group.samples, &OverlayConfig::default(), &AcceptAll);
    let value = serde_json::to_value(&overlays[0]).unwrap();
    assert_eq!(value["kind"], "cuboid");
    assert_eq!(value["sampleId"], "s1");
    assert_eq!(value["path"], "gt");
  }
}
