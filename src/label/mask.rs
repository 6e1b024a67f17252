// 该文件是 Looker3d 项目的一部分。
// src/label/mask.rs - 掩码载荷提取与可渲染掩码
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

use image::RgbaImage;
use serde_json::{Map, Value};

use crate::{
  array::{ArrayDecodeError, DecodedArray, decode_array},
  decode::DecodeError,
  transfer::{BufferId, TransferList, Transferable},
};

// 二进制包装对象的键，`$binary` 为 Extended JSON 写法
const BINARY_WRAPPER_KEYS: [&str; 2] = ["$binary", "binary"];
const RGBA_CHANNELS: u64 = 4;

/// 标签属性中找到的已编码数组
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedArrayPayload<'a>(&'a str);

impl<'a> EncodedArrayPayload<'a> {
  pub fn as_str(&self) -> &'a str {
    self.0
  }

  pub fn decode(&self) -> Result<DecodedArray, ArrayDecodeError> {
    decode_array(self.0)
  }
}

/// 从标签属性中取出 `property` 对应的载荷。
///
/// 属性缺失、为 null 或形态不认识时返回 `None`，从不报错。
pub fn extract<'a>(attrs: &'a Map<String, Value>, property: &str) -> Option<EncodedArrayPayload<'a>> {
  match attrs.get(property)? {
    Value::String(payload) => Some(EncodedArrayPayload(payload)),
    Value::Object(wrapper) => BINARY_WRAPPER_KEYS
      .iter()
      .find_map(|key| wrapper.get(*key)?.get("base64")?.as_str())
      .map(EncodedArrayPayload),
    _ => None,
  }
}

/// 解码后挂在标签上的掩码/热力图
#[derive(Debug)]
pub struct RenderableMask {
  data: Transferable<DecodedArray>,
  image: Transferable<RgbaImage>,
}

impl RenderableMask {
  /// 分配 RGBA 占位图像，并把两块缓冲区登记到移交清单
  pub fn allocate(data: DecodedArray, transfer: &mut TransferList) -> Result<Self, DecodeError> {
    let shape_error = || DecodeError::MaskShape(data.shape().to_vec());

    let (height, width) = data.height_width().ok_or_else(shape_error)?;
    let width = u32::try_from(width).map_err(|_| shape_error())?;
    let height = u32::try_from(height).map_err(|_| shape_error())?;
    u64::from(width)
      .checked_mul(u64::from(height))
      .and_then(|n| n.checked_mul(RGBA_CHANNELS))
      .filter(|n| usize::try_from(*n).is_ok())
      .ok_or_else(shape_error)?;

    let image = RgbaImage::new(width, height);
    Ok(Self {
      data: transfer.adopt(data),
      image: transfer.adopt(image),
    })
  }

  pub fn data(&self) -> &DecodedArray {
    &self.data
  }

  pub fn image(&self) -> &RgbaImage {
    &self.image
  }

  /// 供后续着色步骤写入像素
  pub fn image_mut(&mut self) -> &mut RgbaImage {
    self.image.get_mut()
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn buffer_ids(&self) -> [BufferId; 2] {
    [self.data.id(), self.image.id()]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::array::ArrayData;
  use serde_json::json;

  fn attrs(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => unreachable!(),
    }
  }

  #[test]
  fn absent_or_null_property_is_absent() {
    assert_eq!(extract(&attrs(json!({})), "mask"), None);
    assert_eq!(extract(&attrs(json!({ "mask": null })), "mask"), None);
  }

  #[test]
  fn plain_string_is_payload() {
    let a = attrs(json!({ "mask": "AAAA" }));
    assert_eq!(extract(&a, "mask").map(|p| p.as_str()), Some("AAAA"));
  }

  #[test]
  fn binary_wrapper_is_payload() {
    let a = attrs(json!({ "map": { "$binary": { "base64": "BBBB", "subType": "00" } } }));
    assert_eq!(extract(&a, "map").map(|p| p.as_str()), Some("BBBB"));
    let b = attrs(json!({ "map": { "binary": { "base64": "CCCC" } } }));
    assert_eq!(extract(&b, "map").map(|p| p.as_str()), Some("CCCC"));
  }

  #[test]
  fn other_shapes_are_absent() {
    for value in [
      json!({ "mask": 3 }),
      json!({ "mask": [1, 2] }),
      json!({ "mask": { "$binary": "x" } }),
      json!({ "mask": { "$binary": { "base64": 1 } } }),
    ] {
      assert_eq!(extract(&attrs(value), "mask"), None);
    }
  }

  #[test]
  fn path_suffix_is_not_consulted() {
    let a = attrs(json!({ "mask_path": "/tmp/mask.png" }));
    assert_eq!(extract(&a, "mask"), None);
  }

  #[test]
  fn allocates_rgba_placeholder() {
    let mut list = TransferList::default();
    let data = DecodedArray::new(ArrayData::Uint8(vec![0; 6]), vec![2, 3]).unwrap();
    let mask = RenderableMask::allocate(data, &mut list).unwrap();
    assert_eq!((mask.width(), mask.height()), (3, 2));
    assert_eq!(mask.image().as_raw().len(), 2 * 3 * 4);
    assert!(mask.image().as_raw().iter().all(|b| *b == 0));
    assert_eq!(list.ids(), &mask.buffer_ids());
  }

  #[test]
  fn vector_cannot_be_a_mask() {
    let mut list = TransferList::default();
    let data = DecodedArray::new(ArrayData::Uint8(vec![0; 3]), vec![3]).unwrap();
    let err = RenderableMask::allocate(data, &mut list).unwrap_err();
    assert!(matches!(err, DecodeError::MaskShape(_)));
    assert!(list.is_empty());
  }
}
