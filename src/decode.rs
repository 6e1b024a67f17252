// 该文件是 Looker3d 项目的一部分。
// src/decode.rs - 标签解码
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

#[cfg(feature = "parallel_decode")]
use rayon::prelude::*;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  array::ArrayDecodeError,
  label::{Label, LabelField, MAP_PROPERTY, MASK_PROPERTY, RenderStatus, RenderableMask, mask},
  transfer::{DecodeRequest, DecodedBatch, TransferList},
};

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("数组编码无效: {0}")]
  MalformedArrayEncoding(#[from] ArrayDecodeError),
  #[error("形状为 {0:?} 的数组不能作为掩码")]
  MaskShape(Vec<usize>),
}

/// 解码单个标签上的掩码或热力图。
///
/// 已解码或已失败的标签直接跳过；集合类型逐个解码成员，
/// 返回第一个错误，但不会因此中断其余成员。
pub fn decode_label(label: &mut Label, transfer: &mut TransferList) -> Result<(), DecodeError> {
  match label {
    Label::Detection(d) => decode_slot(
      &mut d.attrs,
      MASK_PROPERTY,
      &mut d.mask,
      &mut d.status,
      transfer,
    ),
    Label::Detections(c) => {
      let mut first_error = None;
      for d in c.detections.iter_mut() {
        if let Err(e) = decode_slot(
          &mut d.attrs,
          MASK_PROPERTY,
          &mut d.mask,
          &mut d.status,
          transfer,
        ) {
          debug!("检测 {:?} 的掩码解码失败: {}", d.id, e);
          first_error.get_or_insert(e);
        }
      }
      first_error.map_or(Ok(()), Err)
    }
    Label::Heatmap(h) => decode_slot(
      &mut h.attrs,
      MAP_PROPERTY,
      &mut h.map,
      &mut h.status,
      transfer,
    ),
    Label::Segmentation(s) => decode_slot(
      &mut s.attrs,
      MASK_PROPERTY,
      &mut s.mask,
      &mut s.status,
      transfer,
    ),
    Label::Polyline(_) | Label::Polylines(_) | Label::Unsupported => Ok(()),
  }
}

fn decode_slot(
  attrs: &mut Map<String, Value>,
  property: &str,
  slot: &mut Option<RenderableMask>,
  status: &mut RenderStatus,
  transfer: &mut TransferList,
) -> Result<(), DecodeError> {
  if *status != RenderStatus::Undecoded {
    return Ok(());
  }
  // 没有载荷的标签保持未解码
  let Some(payload) = mask::extract(attrs, property) else {
    return Ok(());
  };

  let decoded = payload
    .decode()
    .map_err(DecodeError::from)
    .and_then(|array| RenderableMask::allocate(array, transfer));

  match decoded {
    Ok(renderable) => {
      *slot = Some(renderable);
      *status = RenderStatus::Decoded;
      attrs.remove(property);
      Ok(())
    }
    Err(e) => {
      *status = RenderStatus::Failed;
      Err(e)
    }
  }
}

/// 解码一批标签，返回本批新产生的缓冲区清单。
///
/// 单个标签失败只记录日志，不影响其余标签。
pub fn decode_batch(fields: &mut [LabelField]) -> TransferList {
  #[cfg(feature = "parallel_decode")]
  {
    fields
      .par_iter_mut()
      .map(decode_field)
      .reduce(TransferList::default, |mut a, b| {
        a.append(b);
        a
      })
  }
  #[cfg(not(feature = "parallel_decode"))]
  {
    let mut transfer = TransferList::default();
    for field in fields.iter_mut() {
      transfer.append(decode_field(field));
    }
    transfer
  }
}

fn decode_field(field: &mut LabelField) -> TransferList {
  let mut transfer = TransferList::default();
  if let Err(e) = decode_label(&mut field.label, &mut transfer) {
    warn!("字段 {} 的标签解码失败: {}", field.path, e);
  }
  transfer
}

/// 解码线程使用的解码器
pub trait Decode {
  type Error;

  fn decode(&self, request: DecodeRequest) -> Result<DecodedBatch, Self::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LabelDecoder;

impl Decode for LabelDecoder {
  type Error = Infallible;

  fn decode(&self, request: DecodeRequest) -> Result<DecodedBatch, Self::Error> {
    let DecodeRequest {
      sample_id,
      generation,
      mut labels,
    } = request;
    let transfer = decode_batch(&mut labels);
    debug!(
      "样本 {} 解码完成，共 {} 个缓冲区",
      sample_id,
      transfer.len()
    );
    Ok(DecodedBatch {
      sample_id,
      generation,
      labels,
      transfer,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::array::{ArrayData, ArrayEncoding, DecodedArray, encode_array};
  use serde_json::json;
  use std::collections::BTreeSet;

  fn payload(shape: Vec<usize>) -> String {
    let len = shape.iter().product();
    let array = DecodedArray::new(ArrayData::Uint8(vec![7; len]), shape).unwrap();
    encode_array(&array, ArrayEncoding::ZlibNpy)
  }

  fn label(value: Value) -> Label {
    serde_json::from_value(value).unwrap()
  }

  #[test]
  fn decodes_segmentation_mask() {
    let mut seg = label(json!({
      "_cls": "Segmentation",
      "_id": "s1",
      "mask": payload(vec![2, 3]),
    }));
    let mut transfer = TransferList::default();
    decode_label(&mut seg, &mut transfer).unwrap();

    let Label::Segmentation(s) = &seg else {
      panic!("expected segmentation");
    };
    let mask = s.mask.as_ref().unwrap();
    assert_eq!(mask.data().shape(), &[2, 3]);
    assert_eq!(mask.image().as_raw().len(), 24);
    assert_eq!(s.status, RenderStatus::Decoded);
    assert!(!s.attrs.contains_key("mask"));
    assert_eq!(transfer.len(), 2);
  }

  #[test]
  fn heatmap_is_written_under_map() {
    let mut heatmap = label(json!({
      "_cls": "Heatmap",
      "map": { "$binary": { "base64": payload(vec![4, 4]), "subType": "00" } },
    }));
    let mut transfer = TransferList::default();
    decode_label(&mut heatmap, &mut transfer).unwrap();
    let Label::Heatmap(h) = &heatmap else {
      panic!("expected heatmap");
    };
    assert_eq!(h.map.as_ref().map(|m| m.width()), Some(4));
    assert_eq!(h.status, RenderStatus::Decoded);
  }

  #[test]
  fn empty_detections_stays_undecoded() {
    let mut dets = label(json!({ "_cls": "Detections", "detections": [] }));
    let mut transfer = TransferList::default();
    decode_label(&mut dets, &mut transfer).unwrap();
    assert_eq!(dets.status(), RenderStatus::Undecoded);
    assert!(transfer.is_empty());
  }

  #[test]
  fn malformed_sibling_does_not_block_others() {
    let mut dets = label(json!({
      "_cls": "Detections",
      "detections": [
        { "_cls": "Detection", "_id": "a", "mask": payload(vec![2, 2]) },
        { "_cls": "Detection", "_id": "b", "mask": "bm90IGFuIGFycmF5" },
      ]
    }));
    let mut transfer = TransferList::default();
    let err = decode_label(&mut dets, &mut transfer).unwrap_err();
    assert!(matches!(err, DecodeError::MalformedArrayEncoding(_)));

    let Label::Detections(c) = &dets else {
      panic!("expected detections");
    };
    assert_eq!(c.detections[0].status, RenderStatus::Decoded);
    assert!(c.detections[0].mask.is_some());
    assert_eq!(c.detections[1].status, RenderStatus::Failed);
    assert_eq!(dets.status(), RenderStatus::Failed);
    assert_eq!(transfer.len(), 2);
  }

  #[derive(Clone, Default)]
  struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

  impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn failed_collection_member_warns_once() {
    let mut field = LabelField {
      path: "gt".to_string(),
      label: label(json!({
        "_cls": "Detections",
        "detections": [
          { "_cls": "Detection", "_id": "a", "mask": "bm90IGFuIGFycmF5" },
          { "_cls": "Detection", "_id": "b", "mask": payload(vec![2, 2]) },
        ]
      })),
    };

    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::WARN)
      .with_ansi(false)
      .with_writer(move || writer.clone())
      .finish();
    let transfer = tracing::subscriber::with_default(subscriber, || decode_field(&mut field));

    assert_eq!(transfer.len(), 2);
    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert_eq!(text.matches("WARN").count(), 1, "{text}");
    assert!(text.contains("gt"));
  }

  #[test]
  fn decoded_labels_are_skipped() {
    let mut seg = label(json!({ "_cls": "Segmentation", "mask": payload(vec![1, 1]) }));
    let mut transfer = TransferList::default();
    decode_label(&mut seg, &mut transfer).unwrap();
    decode_label(&mut seg, &mut transfer).unwrap();
    assert_eq!(transfer.len(), 2);
  }

  #[test]
  fn failed_labels_are_not_retried() {
    let mut seg = label(json!({ "_cls": "Segmentation", "mask": payload(vec![5]) }));
    let mut transfer = TransferList::default();
    assert!(matches!(
      decode_label(&mut seg, &mut transfer),
      Err(DecodeError::MaskShape(_))
    ));
    assert_eq!(seg.status(), RenderStatus::Failed);
    decode_label(&mut seg, &mut transfer).unwrap();
    assert_eq!(seg.status(), RenderStatus::Failed);
  }

  #[test]
  fn labels_without_payload_are_untouched() {
    for value in [
      json!({ "_cls": "Detection", "_id": "d" }),
      json!({ "_cls": "Polyline", "points3d": [[[0, 0, 0]]] }),
      json!({ "_cls": "Keypoints" }),
    ] {
      let mut l = label(value);
      let mut transfer = TransferList::default();
      decode_label(&mut l, &mut transfer).unwrap();
      assert_eq!(l.status(), RenderStatus::Undecoded);
      assert!(transfer.is_empty());
    }
  }

  #[test]
  fn batch_transfer_set_matches_decoded_buffers() {
    let mut fields = vec![
      LabelField {
        path: "gt".to_string(),
        label: label(json!({
          "_cls": "Detections",
          "detections": [
            { "_cls": "Detection", "mask": payload(vec![2, 2]) },
            { "_cls": "Detection", "mask": payload(vec![3, 1]) },
          ]
        })),
      },
      LabelField {
        path: "seg".to_string(),
        label: label(json!({ "_cls": "Segmentation", "mask": "%%%" })),
      },
      LabelField {
        path: "heat".to_string(),
        label: label(json!({ "_cls": "Heatmap", "map": payload(vec![2, 5]) })),
      },
    ];

    let transfer = decode_batch(&mut fields);
    let listed: BTreeSet<_> = transfer.ids().iter().copied().collect();
    let mut held = Vec::new();
    for field in &fields {
      field.label.collect_buffer_ids(&mut held);
    }
    let held: BTreeSet<_> = held.into_iter().collect();
    assert_eq!(listed, held);
    assert_eq!(listed.len(), 6);
    assert_eq!(fields[1].label.status(), RenderStatus::Failed);
  }

  #[test]
  fn decoder_preserves_request_identity() {
    let request = DecodeRequest {
      sample_id: "s9".to_string(),
      generation: 3,
      labels: vec![LabelField {
        path: "seg".to_string(),
        label: label(json!({ "_cls": "Segmentation", "mask": payload(vec![2, 3]) })),
      }],
    };
    let Ok(batch) = LabelDecoder.decode(request);
    assert_eq!(batch.sample_id, "s9");
    assert_eq!(batch.generation, 3);
    assert_eq!(batch.transfer.len(), 2);
  }
}
