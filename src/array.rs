// 该文件是 Looker3d 项目的一部分。
// src/array.rs - 二进制数组解码
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

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use half::f16;
use miniz_oxide::inflate::{TINFLStatus, decompress_to_vec_zlib_with_limit};
use thiserror::Error;
use tracing::debug;

mod encode;
mod npy;

pub use self::encode::encode_array;

#[derive(Error, Debug)]
pub enum ArrayDecodeError {
  #[error("base64 解码失败: {0}")]
  Base64(#[from] base64::DecodeError),
  #[error("zlib 解压失败: {0}")]
  Inflate(String),
  #[error("无法识别的数组编码")]
  UnknownEncoding,
  #[error("不支持的 npy 版本: {0}.{1}")]
  UnsupportedVersion(u8, u8),
  #[error("数组头部无效: {0}")]
  Header(String),
  #[error("不支持的数据类型: {0}")]
  UnsupportedDType(String),
  #[error("数据长度不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("形状 {shape:?} 与元素数量 {len} 不一致")]
  ShapeMismatch { shape: Vec<usize>, len: usize },
}

impl ArrayDecodeError {
  pub(crate) fn header(msg: impl Into<String>) -> Self {
    ArrayDecodeError::Header(msg.into())
  }
}

/// 载荷的二进制编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayEncoding {
  /// 未压缩的 `.npy` 流
  Npy,
  /// 经 zlib 压缩的 `.npy` 流
  ZlibNpy,
}

impl ArrayEncoding {
  /// 根据开头的字节识别编码方式
  pub fn sniff(bytes: &[u8]) -> Option<Self> {
    if bytes.starts_with(npy::NPY_MAGIC) {
      return Some(ArrayEncoding::Npy);
    }
    // zlib 头: CM = 8 且 (CMF * 256 + FLG) 是 31 的倍数
    if let &[cmf, flg, ..] = bytes
      && cmf & 0x0f == 8
      && (u16::from(cmf) * 256 + u16::from(flg)) % 31 == 0
    {
      return Some(ArrayEncoding::ZlibNpy);
    }
    None
  }
}

/// 元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
  Bool,
  Int8,
  Uint8,
  Int16,
  Uint16,
  Int32,
  Uint32,
  Int64,
  Uint64,
  Float16,
  Float32,
  Float64,
}

impl DType {
  pub fn item_size(&self) -> usize {
    match self {
      DType::Bool | DType::Int8 | DType::Uint8 => 1,
      DType::Int16 | DType::Uint16 | DType::Float16 => 2,
      DType::Int32 | DType::Uint32 | DType::Float32 => 4,
      DType::Int64 | DType::Uint64 | DType::Float64 => 8,
    }
  }

  /// numpy 类型码（不含字节序）
  pub fn type_code(&self) -> &'static str {
    match self {
      DType::Bool => "b1",
      DType::Int8 => "i1",
      DType::Uint8 => "u1",
      DType::Int16 => "i2",
      DType::Uint16 => "u2",
      DType::Int32 => "i4",
      DType::Uint32 => "u4",
      DType::Int64 => "i8",
      DType::Uint64 => "u8",
      DType::Float16 => "f2",
      DType::Float32 => "f4",
      DType::Float64 => "f8",
    }
  }
}

/// 按元素类型区分的扁平数据
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
  Bool(Vec<bool>),
  Int8(Vec<i8>),
  Uint8(Vec<u8>),
  Int16(Vec<i16>),
  Uint16(Vec<u16>),
  Int32(Vec<i32>),
  Uint32(Vec<u32>),
  Int64(Vec<i64>),
  Uint64(Vec<u64>),
  Float16(Vec<f16>),
  Float32(Vec<f32>),
  Float64(Vec<f64>),
}

macro_rules! for_each_variant {
  ($value:expr, $data:ident => $body:expr) => {
    match $value {
      ArrayData::Bool($data) => $body,
      ArrayData::Int8($data) => $body,
      ArrayData::Uint8($data) => $body,
      ArrayData::Int16($data) => $body,
      ArrayData::Uint16($data) => $body,
      ArrayData::Int32($data) => $body,
      ArrayData::Uint32($data) => $body,
      ArrayData::Int64($data) => $body,
      ArrayData::Uint64($data) => $body,
      ArrayData::Float16($data) => $body,
      ArrayData::Float32($data) => $body,
      ArrayData::Float64($data) => $body,
    }
  };
}

impl ArrayData {
  pub fn len(&self) -> usize {
    for_each_variant!(self, data => data.len())
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn dtype(&self) -> DType {
    match self {
      ArrayData::Bool(_) => DType::Bool,
      ArrayData::Int8(_) => DType::Int8,
      ArrayData::Uint8(_) => DType::Uint8,
      ArrayData::Int16(_) => DType::Int16,
      ArrayData::Uint16(_) => DType::Uint16,
      ArrayData::Int32(_) => DType::Int32,
      ArrayData::Uint32(_) => DType::Uint32,
      ArrayData::Int64(_) => DType::Int64,
      ArrayData::Uint64(_) => DType::Uint64,
      ArrayData::Float16(_) => DType::Float16,
      ArrayData::Float32(_) => DType::Float32,
      ArrayData::Float64(_) => DType::Float64,
    }
  }

  /// 底层缓冲区的字节数
  pub fn byte_len(&self) -> usize {
    self.len() * self.dtype().item_size()
  }

  /// 以 f64 读取第 `index` 个元素，供着色等下游步骤使用
  pub fn get_f64(&self, index: usize) -> Option<f64> {
    match self {
      ArrayData::Bool(d) => d.get(index).map(|v| if *v { 1.0 } else { 0.0 }),
      ArrayData::Int8(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Uint8(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Int16(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Uint16(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Int32(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Uint32(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Int64(d) => d.get(index).map(|v| *v as f64),
      ArrayData::Uint64(d) => d.get(index).map(|v| *v as f64),
      ArrayData::Float16(d) => d.get(index).map(|v| v.to_f64()),
      ArrayData::Float32(d) => d.get(index).map(|v| f64::from(*v)),
      ArrayData::Float64(d) => d.get(index).copied(),
    }
  }
}

/// 解码后的数组：扁平数据加形状
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedArray {
  data: ArrayData,
  shape: Vec<usize>,
}

impl DecodedArray {
  /// 构造数组，形状各维之积必须等于元素数量
  pub fn new(data: ArrayData, shape: Vec<usize>) -> Result<Self, ArrayDecodeError> {
    let expected = shape
      .iter()
      .try_fold(1usize, |acc, d| acc.checked_mul(*d))
      .ok_or_else(|| ArrayDecodeError::header("形状元素数量溢出"))?;
    if expected != data.len() {
      return Err(ArrayDecodeError::ShapeMismatch {
        shape,
        len: data.len(),
      });
    }
    Ok(Self { data, shape })
  }

  pub fn data(&self) -> &ArrayData {
    &self.data
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn dtype(&self) -> DType {
    self.data.dtype()
  }

  /// 作为掩码/热力图使用时的 (height, width)
  pub fn height_width(&self) -> Option<(usize, usize)> {
    match self.shape.as_slice() {
      [height, width, ..] => Some((*height, *width)),
      _ => None,
    }
  }

  pub fn into_parts(self) -> (ArrayData, Vec<usize>) {
    (self.data, self.shape)
  }
}

/// 解码 base64 文本形式的数组载荷
pub fn decode_array(payload: &str) -> Result<DecodedArray, ArrayDecodeError> {
  let bytes = BASE64.decode(payload.trim())?;
  decode_array_bytes(&bytes)
}

/// 解码原始字节形式的数组载荷
pub fn decode_array_bytes(bytes: &[u8]) -> Result<DecodedArray, ArrayDecodeError> {
  match ArrayEncoding::sniff(bytes) {
    Some(ArrayEncoding::Npy) => npy::read(bytes),
    Some(ArrayEncoding::ZlibNpy) => {
      let inflated = inflate_npy(bytes)?;
      debug!("zlib 解压: {} -> {} 字节", bytes.len(), inflated.len());
      npy::read(&inflated)
    }
    None => Err(ArrayDecodeError::UnknownEncoding),
  }
}

// 足以容纳 v1 头部的最大长度
const NPY_HEADER_PROBE: usize = 64 * 1024 + 16;

/// 先解出头部，再以头部声明的大小为上限解压整个流
fn inflate_npy(bytes: &[u8]) -> Result<Vec<u8>, ArrayDecodeError> {
  let prefix = match decompress_to_vec_zlib_with_limit(bytes, NPY_HEADER_PROBE) {
    Ok(inflated) => {
      if ArrayEncoding::sniff(&inflated) != Some(ArrayEncoding::Npy) {
        return Err(ArrayDecodeError::UnknownEncoding);
      }
      return Ok(inflated);
    }
    Err(e) if e.status == TINFLStatus::HasMoreOutput => e.output,
    Err(e) => return Err(ArrayDecodeError::Inflate(format!("{:?}", e.status))),
  };
  if ArrayEncoding::sniff(&prefix) != Some(ArrayEncoding::Npy) {
    return Err(ArrayDecodeError::UnknownEncoding);
  }

  // 多留一个字节，恰好填满上限的流仍能完整结束
  let limit = npy::stream_len(&prefix)?.saturating_add(1);
  decompress_to_vec_zlib_with_limit(bytes, limit).map_err(|e| {
    ArrayDecodeError::Inflate(format!("{:?}, 解压数据超过 {} 字节上限", e.status, limit - 1))
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mask_2x3() -> DecodedArray {
    DecodedArray::new(ArrayData::Uint8(vec![0, 1, 2, 3, 4, 5]), vec![2, 3]).unwrap()
  }

  #[test]
  fn decodes_compressed_payload() {
    let payload = encode_array(&mask_2x3(), ArrayEncoding::ZlibNpy);
    let decoded = decode_array(&payload).unwrap();
    assert_eq!(decoded.shape(), &[2, 3]);
    assert_eq!(decoded.data(), &ArrayData::Uint8(vec![0, 1, 2, 3, 4, 5]));
    assert_eq!(decoded.height_width(), Some((2, 3)));
  }

  #[test]
  fn decodes_uncompressed_payload() {
    let array = DecodedArray::new(ArrayData::Float32(vec![0.5, -1.0]), vec![1, 2]).unwrap();
    let payload = encode_array(&array, ArrayEncoding::Npy);
    assert_eq!(decode_array(&payload).unwrap(), array);
  }

  #[test]
  fn decoding_is_deterministic() {
    let payload = encode_array(&mask_2x3(), ArrayEncoding::ZlibNpy);
    let a = decode_array(&payload).unwrap();
    let b = decode_array(&payload).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn sniffs_encodings() {
    assert_eq!(ArrayEncoding::sniff(b"\x93NUMPY\x01\x00"), Some(ArrayEncoding::Npy));
    assert_eq!(ArrayEncoding::sniff(&[0x78, 0x9c, 0x00]), Some(ArrayEncoding::ZlibNpy));
    assert_eq!(ArrayEncoding::sniff(b"PNG"), None);
    assert_eq!(ArrayEncoding::sniff(&[]), None);
  }

  #[test]
  fn stops_inflating_past_declared_shape() {
    let mut npy = BASE64
      .decode(encode_array(&mask_2x3(), ArrayEncoding::Npy))
      .unwrap();
    npy.extend(std::iter::repeat_n(0u8, 8 * 1024 * 1024));
    let compressed = miniz_oxide::deflate::compress_to_vec_zlib(&npy, 6);
    assert!(compressed.len() < 64 * 1024);

    let err = decode_array(&BASE64.encode(compressed)).unwrap_err();
    assert!(matches!(err, ArrayDecodeError::Inflate(_)), "{err}");
  }

  #[test]
  fn inflates_payload_larger_than_header_probe() {
    let values: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    let array = DecodedArray::new(ArrayData::Uint8(values), vec![400, 512]).unwrap();
    let payload = encode_array(&array, ArrayEncoding::ZlibNpy);
    assert_eq!(decode_array(&payload).unwrap(), array);
  }

  #[test]
  fn rejects_unknown_bytes() {
    let payload = BASE64.encode(b"not an array");
    assert!(matches!(
      decode_array(&payload),
      Err(ArrayDecodeError::UnknownEncoding)
    ));
  }

  #[test]
  fn rejects_invalid_base64() {
    assert!(matches!(
      decode_array("***"),
      Err(ArrayDecodeError::Base64(_))
    ));
  }

  #[test]
  fn rejects_shape_mismatch() {
    let err = DecodedArray::new(ArrayData::Uint8(vec![1, 2, 3]), vec![2, 2]).unwrap_err();
    assert!(matches!(err, ArrayDecodeError::ShapeMismatch { len: 3, .. }));
  }

  #[test]
  fn reads_elements_as_f64() {
    let data = ArrayData::Float16(vec![f16::from_f32(1.5)]);
    assert_eq!(data.get_f64(0), Some(1.5));
    assert_eq!(data.get_f64(1), None);
    assert_eq!(ArrayData::Bool(vec![true]).get_f64(0), Some(1.0));
  }
}
