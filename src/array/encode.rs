// 该文件是 Looker3d 项目的一部分。
// src/array/encode.rs - 数组编码（用于测试数据与回环校验）
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

use crate::array::{ArrayData, ArrayEncoding, DecodedArray, npy::NPY_MAGIC};

// numpy 将 magic + 头部 对齐到 64 字节
const NPY_HEADER_ALIGN: usize = 64;
const ZLIB_LEVEL: u8 = 6;

/// 将数组编码为 base64 文本，与解码器的输入格式一致
pub fn encode_array(array: &DecodedArray, encoding: ArrayEncoding) -> String {
  let npy = write_npy(array);
  match encoding {
    ArrayEncoding::Npy => BASE64.encode(npy),
    ArrayEncoding::ZlibNpy => {
      BASE64.encode(miniz_oxide::deflate::compress_to_vec_zlib(&npy, ZLIB_LEVEL))
    }
  }
}

fn write_npy(array: &DecodedArray) -> Vec<u8> {
  let shape = match array.shape() {
    [] => "()".to_string(),
    [d] => format!("({},)", d),
    dims => format!(
      "({})",
      dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
    ),
  };
  let dtype = array.dtype();
  let order = if dtype.item_size() == 1 { '|' } else { '<' };
  let mut header = format!(
    "{{'descr': '{}{}', 'fortran_order': False, 'shape': {}, }}",
    order,
    dtype.type_code(),
    shape
  );

  // 10 字节前导 + 头部 + '\n'
  let unpadded = 10 + header.len() + 1;
  let padding = (NPY_HEADER_ALIGN - unpadded % NPY_HEADER_ALIGN) % NPY_HEADER_ALIGN;
  header.push_str(&" ".repeat(padding));
  header.push('\n');

  let mut bytes = Vec::with_capacity(10 + header.len() + array.data().byte_len());
  bytes.extend_from_slice(NPY_MAGIC);
  bytes.extend_from_slice(&[1, 0]);
  bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
  bytes.extend_from_slice(header.as_bytes());

  match array.data() {
    ArrayData::Bool(values) => bytes.extend(values.iter().map(|v| u8::from(*v))),
    ArrayData::Int8(values) => bytes.extend(values.iter().map(|v| *v as u8)),
    ArrayData::Uint8(values) => bytes.extend_from_slice(values),
    ArrayData::Int16(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Uint16(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Int32(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Uint32(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Int64(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Uint64(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Float16(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Float32(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
    ArrayData::Float64(values) => values.iter().for_each(|v| bytes.extend(v.to_le_bytes())),
  }

  bytes
}
