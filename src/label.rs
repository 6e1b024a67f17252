// 该文件是 Looker3d 项目的一部分。
// src/label.rs - 标签与样本定义
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
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::transfer::BufferId;

pub mod mask;

pub use self::mask::{EncodedArrayPayload, RenderableMask};

pub const MASK_PROPERTY: &str = "mask";
pub const MAP_PROPERTY: &str = "map";

const LABEL_CLASSES: [&str; 6] = [
  "Detection",
  "Detections",
  "Heatmap",
  "Segmentation",
  "Polyline",
  "Polylines",
];

/// 标签的解码状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderStatus {
  #[default]
  Undecoded,
  Decoded,
  /// 解码失败，渲染端不再重试
  Failed,
}

impl RenderStatus {
  /// 集合状态：非空且全部已解码时为已解码；
  /// 仍有未解码成员时为未解码；其余情况为失败
  pub fn fold<I>(children: I) -> RenderStatus
  where
    I: IntoIterator<Item = RenderStatus>,
  {
    let mut any = false;
    let mut failed = false;
    for status in children {
      any = true;
      match status {
        RenderStatus::Undecoded => return RenderStatus::Undecoded,
        RenderStatus::Failed => failed = true,
        RenderStatus::Decoded => {}
      }
    }
    match (any, failed) {
      (false, _) => RenderStatus::Undecoded,
      (true, true) => RenderStatus::Failed,
      (true, false) => RenderStatus::Decoded,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Instance {
  #[serde(rename = "_id")]
  pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Detection {
  #[serde(rename = "_id", default)]
  pub id: Option<String>,
  #[serde(default)]
  pub label: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub instance: Option<Instance>,
  #[serde(default)]
  pub dimensions: Option<[f32; 3]>,
  #[serde(default)]
  pub location: Option<[f32; 3]>,
  #[serde(default)]
  pub rotation: Option<[f32; 3]>,
  #[serde(flatten)]
  pub attrs: Map<String, Value>,
  #[serde(skip)]
  pub mask: Option<RenderableMask>,
  #[serde(skip)]
  pub status: RenderStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct Detections {
  #[serde(default)]
  pub detections: Vec<Detection>,
  #[serde(flatten)]
  pub attrs: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Heatmap {
  #[serde(rename = "_id", default)]
  pub id: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub range: Option<[f64; 2]>,
  #[serde(flatten)]
  pub attrs: Map<String, Value>,
  #[serde(skip)]
  pub map: Option<RenderableMask>,
  #[serde(skip)]
  pub status: RenderStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct Segmentation {
  #[serde(rename = "_id", default)]
  pub id: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(flatten)]
  pub attrs: Map<String, Value>,
  #[serde(skip)]
  pub mask: Option<RenderableMask>,
  #[serde(skip)]
  pub status: RenderStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Polyline {
  #[serde(rename = "_id", default)]
  pub id: Option<String>,
  #[serde(default)]
  pub label: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub instance: Option<Instance>,
  #[serde(default)]
  pub points3d: Option<Vec<Vec<[f32; 3]>>>,
  #[serde(default)]
  pub closed: bool,
  #[serde(default)]
  pub filled: bool,
  #[serde(flatten)]
  pub attrs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Polylines {
  #[serde(default)]
  pub polylines: Vec<Polyline>,
  #[serde(flatten)]
  pub attrs: Map<String, Value>,
}

/// 按 `_cls` 区分的标签
#[derive(Debug, Deserialize)]
#[serde(tag = "_cls")]
pub enum Label {
  Detection(Detection),
  Detections(Detections),
  Heatmap(Heatmap),
  Segmentation(Segmentation),
  Polyline(Polyline),
  Polylines(Polylines),
  #[serde(other)]
  Unsupported,
}

impl Label {
  pub fn is_known_class(cls: &str) -> bool {
    LABEL_CLASSES.contains(&cls)
  }

  pub fn cls(&self) -> &'static str {
    match self {
      Label::Detection(_) => "Detection",
      Label::Detections(_) => "Detections",
      Label::Heatmap(_) => "Heatmap",
      Label::Segmentation(_) => "Segmentation",
      Label::Polyline(_) => "Polyline",
      Label::Polylines(_) => "Polylines",
      Label::Unsupported => "Unsupported",
    }
  }

  /// 当前解码状态，集合类型由成员折叠得出
  pub fn status(&self) -> RenderStatus {
    match self {
      Label::Detection(d) => d.status,
      Label::Detections(c) => RenderStatus::fold(c.detections.iter().map(|d| d.status)),
      Label::Heatmap(h) => h.status,
      Label::Segmentation(s) => s.status,
      Label::Polyline(_) | Label::Polylines(_) | Label::Unsupported => RenderStatus::Undecoded,
    }
  }

  /// 展开为逐个可渲染的标签
  pub fn leaves(&self) -> Vec<LabelRef<'_>> {
    match self {
      Label::Detection(d) => vec![LabelRef::Detection(d)],
      Label::Detections(c) => c.detections.iter().map(LabelRef::Detection).collect(),
      Label::Heatmap(h) => vec![LabelRef::Heatmap(h)],
      Label::Segmentation(s) => vec![LabelRef::Segmentation(s)],
      Label::Polyline(p) => vec![LabelRef::Polyline(p)],
      Label::Polylines(c) => c.polylines.iter().map(LabelRef::Polyline).collect(),
      Label::Unsupported => Vec::new(),
    }
  }

  pub fn collect_buffer_ids(&self, out: &mut Vec<BufferId>) {
    match self {
      Label::Detection(d) => collect_mask_ids(&d.mask, out),
      Label::Detections(c) => c
        .detections
        .iter()
        .for_each(|d| collect_mask_ids(&d.mask, out)),
      Label::Heatmap(h) => collect_mask_ids(&h.map, out),
      Label::Segmentation(s) => collect_mask_ids(&s.mask, out),
      Label::Polyline(_) | Label::Polylines(_) | Label::Unsupported => {}
    }
  }

  /// 复制标签文档，不带已解码的缓冲区，状态回到未解码
  pub fn clone_undecoded(&self) -> Label {
    match self {
      Label::Detection(d) => Label::Detection(d.clone_undecoded()),
      Label::Detections(c) => Label::Detections(Detections {
        detections: c.detections.iter().map(Detection::clone_undecoded).collect(),
        attrs: c.attrs.clone(),
      }),
      Label::Heatmap(h) => Label::Heatmap(Heatmap {
        id: h.id.clone(),
        tags: h.tags.clone(),
        range: h.range,
        attrs: h.attrs.clone(),
        map: None,
        status: RenderStatus::Undecoded,
      }),
      Label::Segmentation(s) => Label::Segmentation(Segmentation {
        id: s.id.clone(),
        tags: s.tags.clone(),
        attrs: s.attrs.clone(),
        mask: None,
        status: RenderStatus::Undecoded,
      }),
      Label::Polyline(p) => Label::Polyline(p.clone()),
      Label::Polylines(c) => Label::Polylines(c.clone()),
      Label::Unsupported => Label::Unsupported,
    }
  }

  /// 渲染端首轮展示用的外壳：去掉编码载荷
  pub fn shell(&self) -> Label {
    let mut shell = self.clone_undecoded();
    match &mut shell {
      Label::Detection(d) => {
        d.attrs.remove(MASK_PROPERTY);
      }
      Label::Detections(c) => c.detections.iter_mut().for_each(|d| {
        d.attrs.remove(MASK_PROPERTY);
      }),
      Label::Heatmap(h) => {
        h.attrs.remove(MAP_PROPERTY);
      }
      Label::Segmentation(s) => {
        s.attrs.remove(MASK_PROPERTY);
      }
      Label::Polyline(_) | Label::Polylines(_) | Label::Unsupported => {}
    }
    shell
  }
}

fn collect_mask_ids(mask: &Option<RenderableMask>, out: &mut Vec<BufferId>) {
  if let Some(mask) = mask {
    out.extend(mask.buffer_ids());
  }
}

impl Detection {
  pub fn clone_undecoded(&self) -> Detection {
    Detection {
      id: self.id.clone(),
      label: self.label.clone(),
      tags: self.tags.clone(),
      instance: self.instance.clone(),
      dimensions: self.dimensions,
      location: self.location,
      rotation: self.rotation,
      attrs: self.attrs.clone(),
      mask: None,
      status: RenderStatus::Undecoded,
    }
  }
}

/// 对单个叶子标签的只读视图
#[derive(Debug, Clone, Copy)]
pub enum LabelRef<'a> {
  Detection(&'a Detection),
  Heatmap(&'a Heatmap),
  Segmentation(&'a Segmentation),
  Polyline(&'a Polyline),
}

impl<'a> LabelRef<'a> {
  pub fn cls(&self) -> &'static str {
    match self {
      LabelRef::Detection(_) => "Detection",
      LabelRef::Heatmap(_) => "Heatmap",
      LabelRef::Segmentation(_) => "Segmentation",
      LabelRef::Polyline(_) => "Polyline",
    }
  }

  pub fn id(&self) -> Option<&'a str> {
    match self {
      LabelRef::Detection(d) => d.id.as_deref(),
      LabelRef::Heatmap(h) => h.id.as_deref(),
      LabelRef::Segmentation(s) => s.id.as_deref(),
      LabelRef::Polyline(p) => p.id.as_deref(),
    }
  }

  pub fn tags(&self) -> &'a [String] {
    match self {
      LabelRef::Detection(d) => &d.tags,
      LabelRef::Heatmap(h) => &h.tags,
      LabelRef::Segmentation(s) => &s.tags,
      LabelRef::Polyline(p) => &p.tags,
    }
  }

  pub fn label(&self) -> Option<&'a str> {
    match self {
      LabelRef::Detection(d) => d.label.as_deref(),
      LabelRef::Polyline(p) => p.label.as_deref(),
      LabelRef::Heatmap(_) | LabelRef::Segmentation(_) => None,
    }
  }

  pub fn instance_id(&self) -> Option<&'a str> {
    match self {
      LabelRef::Detection(d) => d.instance.as_ref().map(|i| i.id.as_str()),
      LabelRef::Polyline(p) => p.instance.as_ref().map(|i| i.id.as_str()),
      LabelRef::Heatmap(_) | LabelRef::Segmentation(_) => None,
    }
  }

  fn attrs(&self) -> &'a Map<String, Value> {
    match self {
      LabelRef::Detection(d) => &d.attrs,
      LabelRef::Heatmap(h) => &h.attrs,
      LabelRef::Segmentation(s) => &s.attrs,
      LabelRef::Polyline(p) => &p.attrs,
    }
  }

  /// 以文本读取属性值，用于按值着色
  pub fn attribute(&self, key: &str) -> Option<String> {
    match key {
      "_id" | "id" => self.id().map(str::to_string),
      "label" => self.label().map(str::to_string),
      _ => match self.attrs().get(key)? {
        Value::String(s) => Some(s.clone()),
        v @ (Value::Bool(_) | Value::Number(_)) => Some(v.to_string()),
        _ => None,
      },
    }
  }
}

/// 样本中某个字段路径上的标签
#[derive(Debug)]
pub struct LabelField {
  pub path: String,
  pub label: Label,
}

#[derive(Error, Debug)]
pub enum SampleError {
  #[error("样本文档必须是 JSON 对象")]
  NotAnObject,
  #[error("样本缺少 id")]
  MissingId,
  #[error("样本分组为空")]
  EmptyGroup,
}

#[derive(Debug)]
pub struct Sample {
  pub id: String,
  pub fields: Vec<LabelField>,
}

impl Sample {
  /// 从样本文档解析。文档可以是样本本体，也可以把本体放在 `sample` 键下
  pub fn from_document(doc: Value) -> Result<Self, SampleError> {
    let Value::Object(mut object) = doc else {
      return Err(SampleError::NotAnObject);
    };

    let outer_id = object.get("id").and_then(document_id);
    let body = match object.remove("sample") {
      Some(Value::Object(inner)) => inner,
      _ => object,
    };
    let id = outer_id
      .or_else(|| body.get("_id").and_then(document_id))
      .or_else(|| body.get("id").and_then(document_id))
      .ok_or(SampleError::MissingId)?;

    let mut fields = Vec::new();
    collect_fields("", body, &mut fields);
    debug!("样本 {} 解析出 {} 个标签字段", id, fields.len());

    Ok(Sample { id, fields })
  }

  pub fn shell(&self) -> Sample {
    Sample {
      id: self.id.clone(),
      fields: self
        .fields
        .iter()
        .map(|f| LabelField {
          path: f.path.clone(),
          label: f.label.shell(),
        })
        .collect(),
    }
  }

  pub fn clone_undecoded(&self) -> Sample {
    Sample {
      id: self.id.clone(),
      fields: self
        .fields
        .iter()
        .map(|f| LabelField {
          path: f.path.clone(),
          label: f.label.clone_undecoded(),
        })
        .collect(),
    }
  }
}

fn document_id(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Object(o) => o.get("$oid").and_then(Value::as_str).map(str::to_string),
    _ => None,
  }
}

fn collect_fields(prefix: &str, object: Map<String, Value>, out: &mut Vec<LabelField>) {
  for (key, value) in object {
    if key.starts_with('_') {
      continue;
    }
    let path = if prefix.is_empty() {
      key
    } else {
      format!("{}.{}", prefix, key)
    };

    let Value::Object(inner) = value else {
      continue;
    };
    match inner.get("_cls").and_then(Value::as_str) {
      Some(cls) if Label::is_known_class(cls) => {
        match serde_json::from_value::<Label>(Value::Object(inner)) {
          Ok(label) => out.push(LabelField { path, label }),
          Err(e) => warn!("字段 {} 的标签无法解析: {}", path, e),
        }
      }
      // 嵌入文档
      _ => collect_fields(&path, inner, out),
    }
  }
}

/// 一起渲染的一组样本（分组数据的各个切片）
#[derive(Debug, Default)]
pub struct SampleGroup {
  pub samples: Vec<Sample>,
}

impl SampleGroup {
  /// 接受单个样本、样本数组或 `{切片名: 样本}` 映射
  pub fn from_document(doc: Value) -> Result<Self, SampleError> {
    let samples = match doc {
      Value::Array(items) => items
        .into_iter()
        .map(Sample::from_document)
        .collect::<Result<Vec<_>, _>>()?,
      Value::Object(object)
        if ["id", "_id", "sample"].iter().any(|k| object.contains_key(*k)) =>
      {
        vec![Sample::from_document(Value::Object(object))?]
      }
      Value::Object(slices) => slices
        .into_iter()
        .map(|(_, sample)| Sample::from_document(sample))
        .collect::<Result<Vec<_>, _>>()?,
      _ => return Err(SampleError::NotAnObject),
    };

    if samples.is_empty() {
      return Err(SampleError::EmptyGroup);
    }
    Ok(SampleGroup { samples })
  }

  /// 第一个样本的 id
  pub fn canonical_sample_id(&self) -> Option<&str> {
    self.samples.first().map(|s| s.id.as_str())
  }

  pub fn shell(&self) -> SampleGroup {
    SampleGroup {
      samples: self.samples.iter().map(Sample::shell).collect(),
    }
  }

  pub fn clone_undecoded(&self) -> SampleGroup {
    SampleGroup {
      samples: self.samples.iter().map(Sample::clone_undecoded).collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn folds_collection_status() {
    use RenderStatus::*;
    assert_eq!(RenderStatus::fold(Vec::new()), Undecoded);
    assert_eq!(RenderStatus::fold([Undecoded, Decoded]), Undecoded);
    assert_eq!(RenderStatus::fold([Decoded, Decoded]), Decoded);
    assert_eq!(RenderStatus::fold([Decoded, Failed]), Failed);
    assert_eq!(RenderStatus::fold([Failed, Undecoded]), Undecoded);
  }

  #[test]
  fn parses_label_kinds() {
    let label: Label = serde_json::from_value(json!({
      "_cls": "Detection",
      "_id": "d1",
      "label": "car",
      "tags": ["reviewed"],
      "dimensions": [1, 2, 3],
      "location": [0.5, 0.0, -1.0],
      "confidence": 0.9,
      "mask": "AAAA"
    }))
    .unwrap();
    let Label::Detection(d) = &label else {
      panic!("expected detection");
    };
    assert_eq!(d.id.as_deref(), Some("d1"));
    assert_eq!(d.dimensions, Some([1.0, 2.0, 3.0]));
    assert!(d.attrs.contains_key("mask"));
    assert_eq!(label.status(), RenderStatus::Undecoded);

    let unknown: Label = serde_json::from_value(json!({ "_cls": "Keypoints" })).unwrap();
    assert!(matches!(unknown, Label::Unsupported));
  }

  #[test]
  fn reads_attributes_as_text() {
    let label: Label = serde_json::from_value(json!({
      "_cls": "Polyline",
      "_id": "p1",
      "label": "lane",
      "confidence": 0.5,
      "occluded": false,
      "meta": { "a": 1 }
    }))
    .unwrap();
    let leaf = label.leaves()[0];
    assert_eq!(leaf.attribute("label").as_deref(), Some("lane"));
    assert_eq!(leaf.attribute("confidence").as_deref(), Some("0.5"));
    assert_eq!(leaf.attribute("occluded").as_deref(), Some("false"));
    assert_eq!(leaf.attribute("meta"), None);
    assert_eq!(leaf.attribute("id").as_deref(), Some("p1"));
  }

  #[test]
  fn parses_sample_fields_and_embedded_documents() {
    let sample = Sample::from_document(json!({
      "id": "s1",
      "sample": {
        "_id": { "$oid": "ignored" },
        "filepath": "/data/scene.pcd",
        "ground_truth": {
          "_cls": "Detections",
          "detections": [{ "_cls": "Detection", "_id": "d1" }]
        },
        "extra": {
          "lanes": { "_cls": "Polylines", "polylines": [] }
        },
        "broken": { "_cls": "Detection", "dimensions": "wide" },
        "keypoints": { "_cls": "Keypoints" }
      }
    }))
    .unwrap();

    assert_eq!(sample.id, "s1");
    let paths: Vec<_> = sample.fields.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["extra.lanes", "ground_truth"]);
  }

  #[test]
  fn sample_without_id_is_rejected() {
    assert!(matches!(
      Sample::from_document(json!({ "field": 1 })),
      Err(SampleError::MissingId)
    ));
    assert!(matches!(
      Sample::from_document(json!([])),
      Err(SampleError::NotAnObject)
    ));
  }

  #[test]
  fn parses_group_forms() {
    let single = SampleGroup::from_document(json!({ "_id": "a" })).unwrap();
    assert_eq!(single.canonical_sample_id(), Some("a"));

    let list = SampleGroup::from_document(json!([{ "_id": "a" }, { "_id": "b" }])).unwrap();
    assert_eq!(list.samples.len(), 2);

    let slices =
      SampleGroup::from_document(json!({ "left": { "_id": "l" }, "pcd": { "_id": "p" } })).unwrap();
    assert_eq!(slices.canonical_sample_id(), Some("l"));

    assert!(matches!(
      SampleGroup::from_document(json!([])),
      Err(SampleError::EmptyGroup)
    ));
  }

  #[test]
  fn slice_map_keeps_document_order() {
    let doc: Value =
      serde_json::from_str(r#"{ "pcd": { "_id": "p" }, "left": { "_id": "l" }, "mid": { "_id": "m" } }"#)
        .unwrap();
    let group = SampleGroup::from_document(doc).unwrap();
    assert_eq!(group.canonical_sample_id(), Some("p"));
    let ids: Vec<_> = group.samples.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["p", "l", "m"]);
  }

  #[test]
  fn shell_drops_encoded_payloads() {
    let label: Label = serde_json::from_value(json!({
      "_cls": "Heatmap",
      "_id": "h1",
      "map": "AAAA"
    }))
    .unwrap();
    let Label::Heatmap(shell) = label.shell() else {
      panic!("expected heatmap");
    };
    assert!(!shell.attrs.contains_key(MAP_PROPERTY));
    assert_eq!(shell.id.as_deref(), Some("h1"));
  }
}
