// 该文件是 Looker3d 项目的一部分。
// src/array/npy.rs - NumPy .npy 格式解析
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

use half::f16;

use crate::array::{ArrayData, ArrayDecodeError, DType, DecodedArray};

macro_rules! map_data {
  ($value:expr, $data:ident => $body:expr) => {
    match $value {
      ArrayData::Bool($data) => ArrayData::Bool($body),
      ArrayData::Int8($data) => ArrayData::Int8($body),
      ArrayData::Uint8($data) => ArrayData::Uint8($body),
      ArrayData::Int16($data) => ArrayData::Int16($body),
      ArrayData::Uint16($data) => ArrayData::Uint16($body),
      ArrayData::Int32($data) => ArrayData::Int32($body),
      ArrayData::Uint32($data) => ArrayData::Uint32($body),
      ArrayData::Int64($data) => ArrayData::Int64($body),
      ArrayData::Uint64($data) => ArrayData::Uint64($body),
      ArrayData::Float16($data) => ArrayData::Float16($body),
      ArrayData::Float32($data) => ArrayData::Float32($body),
      ArrayData::Float64($data) => ArrayData::Float64($body),
    }
  };
}

pub(crate) const NPY_MAGIC: &[u8] = b"\x93NUMPY";

// magic(6) + 版本(2) + 头长度(2 或 4)
const NPY_V1_PREAMBLE: usize = 10;
const NPY_V2_PREAMBLE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteOrder {
  Little,
  Big,
}

impl ByteOrder {
  fn native() -> Self {
    if cfg!(target_endian = "big") {
      ByteOrder::Big
    } else {
      ByteOrder::Little
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NpyHeader {
  pub dtype: DType,
  pub order: ByteOrder,
  pub fortran_order: bool,
  pub shape: Vec<usize>,
}

impl NpyHeader {
  fn element_count(&self) -> Result<usize, ArrayDecodeError> {
    self
      .shape
      .iter()
      .try_fold(1usize, |acc, d| acc.checked_mul(*d))
      .ok_or_else(|| ArrayDecodeError::header("形状元素数量溢出"))
  }
}

/// 读取完整的 .npy 流
pub(crate) fn read(bytes: &[u8]) -> Result<DecodedArray, ArrayDecodeError> {
  let (header, payload) = split_header(bytes)?;

  let count = header.element_count()?;
  let expected = count
    .checked_mul(header.dtype.item_size())
    .ok_or_else(|| ArrayDecodeError::header("数据字节数溢出"))?;
  if payload.len() != expected {
    return Err(ArrayDecodeError::LengthMismatch {
      expected,
      actual: payload.len(),
    });
  }

  let mut data = read_data(header.dtype, header.order, payload);
  if header.fortran_order && header.shape.len() > 1 {
    data = map_data!(data, values => fortran_to_c(values, &header.shape));
  }

  DecodedArray::new(data, header.shape)
}

/// 由流开头的若干字节推算整个 .npy 流应有的字节数
pub(crate) fn stream_len(prefix: &[u8]) -> Result<usize, ArrayDecodeError> {
  let (header, header_end) = locate_header(prefix)?;
  header
    .element_count()?
    .checked_mul(header.dtype.item_size())
    .and_then(|n| n.checked_add(header_end))
    .ok_or_else(|| ArrayDecodeError::header("数据字节数溢出"))
}

fn split_header(bytes: &[u8]) -> Result<(NpyHeader, &[u8]), ArrayDecodeError> {
  let (header, header_end) = locate_header(bytes)?;
  Ok((header, &bytes[header_end..]))
}

fn locate_header(bytes: &[u8]) -> Result<(NpyHeader, usize), ArrayDecodeError> {
  if !bytes.starts_with(NPY_MAGIC) || bytes.len() < NPY_V1_PREAMBLE {
    return Err(ArrayDecodeError::header("缺少 npy 魔数"));
  }

  let (major, minor) = (bytes[6], bytes[7]);
  let (header_start, header_len) = match major {
    1 => (
      NPY_V1_PREAMBLE,
      usize::from(u16::from_le_bytes([bytes[8], bytes[9]])),
    ),
    2 | 3 => {
      if bytes.len() < NPY_V2_PREAMBLE {
        return Err(ArrayDecodeError::header("npy 头部被截断"));
      }
      let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
      let len = usize::try_from(len).map_err(|_| ArrayDecodeError::header("npy 头部过长"))?;
      (NPY_V2_PREAMBLE, len)
    }
    _ => return Err(ArrayDecodeError::UnsupportedVersion(major, minor)),
  };

  let header_end = header_start
    .checked_add(header_len)
    .filter(|end| *end <= bytes.len())
    .ok_or_else(|| ArrayDecodeError::header("npy 头部被截断"))?;
  let text = std::str::from_utf8(&bytes[header_start..header_end])
    .map_err(|_| ArrayDecodeError::header("npy 头部不是有效文本"))?;

  Ok((parse_header(text)?, header_end))
}

/// 解析形如 `{'descr': '<u1', 'fortran_order': False, 'shape': (2, 3), }` 的头部
pub(crate) fn parse_header(text: &str) -> Result<NpyHeader, ArrayDecodeError> {
  let mut parser = DictParser::new(text);
  let mut descr = None;
  let mut fortran_order = None;
  let mut shape = None;

  for (key, value) in parser.parse_dict()? {
    match (key.as_str(), value) {
      ("descr", PyValue::Str(s)) => descr = Some(s),
      ("descr", PyValue::List) => {
        return Err(ArrayDecodeError::UnsupportedDType("结构化类型".to_string()));
      }
      ("fortran_order", PyValue::Bool(b)) => fortran_order = Some(b),
      ("shape", PyValue::Tuple(dims)) => shape = Some(dims),
      (other, _) => {
        return Err(ArrayDecodeError::header(format!("头部字段 '{}' 无效", other)));
      }
    }
  }

  let descr = descr.ok_or_else(|| ArrayDecodeError::header("缺少 descr"))?;
  let (dtype, order) = parse_descr(&descr)?;

  Ok(NpyHeader {
    dtype,
    order,
    fortran_order: fortran_order.ok_or_else(|| ArrayDecodeError::header("缺少 fortran_order"))?,
    shape: shape.ok_or_else(|| ArrayDecodeError::header("缺少 shape"))?,
  })
}

fn parse_descr(descr: &str) -> Result<(DType, ByteOrder), ArrayDecodeError> {
  let (order, code) = match descr.as_bytes().first() {
    Some(b'<') => (ByteOrder::Little, &descr[1..]),
    Some(b'>') => (ByteOrder::Big, &descr[1..]),
    Some(b'|') | Some(b'=') => (ByteOrder::native(), &descr[1..]),
    _ => (ByteOrder::native(), descr),
  };

  let dtype = match code {
    "b1" | "?" => DType::Bool,
    "i1" => DType::Int8,
    "u1" => DType::Uint8,
    "i2" => DType::Int16,
    "u2" => DType::Uint16,
    "i4" => DType::Int32,
    "u4" => DType::Uint32,
    "i8" => DType::Int64,
    "u8" => DType::Uint64,
    "f2" => DType::Float16,
    "f4" => DType::Float32,
    "f8" => DType::Float64,
    _ => return Err(ArrayDecodeError::UnsupportedDType(descr.to_string())),
  };

  Ok((dtype, order))
}

fn read_data(dtype: DType, order: ByteOrder, payload: &[u8]) -> ArrayData {
  let big = order == ByteOrder::Big;
  match dtype {
    DType::Bool => ArrayData::Bool(payload.iter().map(|b| *b != 0).collect()),
    DType::Int8 => ArrayData::Int8(payload.iter().map(|b| *b as i8).collect()),
    DType::Uint8 => ArrayData::Uint8(payload.to_vec()),
    DType::Int16 => {
      ArrayData::Int16(read_elements(payload, big, i16::from_le_bytes, i16::from_be_bytes))
    }
    DType::Uint16 => {
      ArrayData::Uint16(read_elements(payload, big, u16::from_le_bytes, u16::from_be_bytes))
    }
    DType::Int32 => {
      ArrayData::Int32(read_elements(payload, big, i32::from_le_bytes, i32::from_be_bytes))
    }
    DType::Uint32 => {
      ArrayData::Uint32(read_elements(payload, big, u32::from_le_bytes, u32::from_be_bytes))
    }
    DType::Int64 => {
      ArrayData::Int64(read_elements(payload, big, i64::from_le_bytes, i64::from_be_bytes))
    }
    DType::Uint64 => {
      ArrayData::Uint64(read_elements(payload, big, u64::from_le_bytes, u64::from_be_bytes))
    }
    DType::Float16 => ArrayData::Float16(read_elements(
      payload,
      big,
      |b: [u8; 2]| f16::from_bits(u16::from_le_bytes(b)),
      |b: [u8; 2]| f16::from_bits(u16::from_be_bytes(b)),
    )),
    DType::Float32 => {
      ArrayData::Float32(read_elements(payload, big, f32::from_le_bytes, f32::from_be_bytes))
    }
    DType::Float64 => {
      ArrayData::Float64(read_elements(payload, big, f64::from_le_bytes, f64::from_be_bytes))
    }
  }
}

fn read_elements<T, const N: usize>(
  payload: &[u8],
  big_endian: bool,
  from_le: fn([u8; N]) -> T,
  from_be: fn([u8; N]) -> T,
) -> Vec<T> {
  payload
    .chunks_exact(N)
    .map(|chunk| {
      let mut raw = [0u8; N];
      raw.copy_from_slice(chunk);
      if big_endian { from_be(raw) } else { from_le(raw) }
    })
    .collect()
}

/// 列优先数据重排为行优先
fn fortran_to_c<T: Copy>(values: Vec<T>, shape: &[usize]) -> Vec<T> {
  let mut strides = vec![1usize; shape.len()];
  for axis in 1..shape.len() {
    strides[axis] = strides[axis - 1] * shape[axis - 1];
  }

  let mut out = Vec::with_capacity(values.len());
  let mut index = vec![0usize; shape.len()];
  for _ in 0..values.len() {
    let source: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
    out.push(values[source]);
    for axis in (0..shape.len()).rev() {
      index[axis] += 1;
      if index[axis] < shape[axis] {
        break;
      }
      index[axis] = 0;
    }
  }
  out
}

#[derive(Debug, PartialEq)]
enum PyValue {
  Str(String),
  Bool(bool),
  Tuple(Vec<usize>),
  List,
}

struct DictParser<'a> {
  text: &'a [u8],
  pos: usize,
}

impl<'a> DictParser<'a> {
  fn new(text: &'a str) -> Self {
    Self {
      text: text.as_bytes(),
      pos: 0,
    }
  }

  fn peek(&self) -> Option<u8> {
    self.text.get(self.pos).copied()
  }

  fn skip_ws(&mut self) {
    while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
      self.pos += 1;
    }
  }

  fn expect(&mut self, c: u8) -> Result<(), ArrayDecodeError> {
    self.skip_ws();
    if self.peek() == Some(c) {
      self.pos += 1;
      Ok(())
    } else {
      Err(ArrayDecodeError::header(format!(
        "位置 {} 处期望 '{}'",
        self.pos, c as char
      )))
    }
  }

  fn parse_dict(&mut self) -> Result<Vec<(String, PyValue)>, ArrayDecodeError> {
    self.expect(b'{')?;
    let mut entries = Vec::new();
    loop {
      self.skip_ws();
      if self.peek() == Some(b'}') {
        self.pos += 1;
        return Ok(entries);
      }
      let key = self.parse_str()?;
      self.expect(b':')?;
      let value = self.parse_value()?;
      entries.push((key, value));
      self.skip_ws();
      if self.peek() == Some(b',') {
        self.pos += 1;
      }
    }
  }

  fn parse_value(&mut self) -> Result<PyValue, ArrayDecodeError> {
    self.skip_ws();
    match self.peek() {
      Some(b'\'' | b'"') => Ok(PyValue::Str(self.parse_str()?)),
      Some(b'(') => Ok(PyValue::Tuple(self.parse_tuple()?)),
      Some(b'[') => {
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
          self.pos += 1;
          match c {
            b'[' => depth += 1,
            b']' => {
              depth -= 1;
              if depth == 0 {
                return Ok(PyValue::List);
              }
            }
            _ => {}
          }
        }
        Err(ArrayDecodeError::header("列表未闭合"))
      }
      Some(_) if self.text[self.pos..].starts_with(b"True") => {
        self.pos += 4;
        Ok(PyValue::Bool(true))
      }
      Some(_) if self.text[self.pos..].starts_with(b"False") => {
        self.pos += 5;
        Ok(PyValue::Bool(false))
      }
      _ => Err(ArrayDecodeError::header(format!("位置 {} 处值无效", self.pos))),
    }
  }

  fn parse_str(&mut self) -> Result<String, ArrayDecodeError> {
    self.skip_ws();
    let quote = match self.peek() {
      Some(q @ (b'\'' | b'"')) => q,
      _ => return Err(ArrayDecodeError::header(format!("位置 {} 处期望字符串", self.pos))),
    };
    self.pos += 1;
    let start = self.pos;
    while let Some(c) = self.peek() {
      if c == quote {
        let s = String::from_utf8_lossy(&self.text[start..self.pos]).into_owned();
        self.pos += 1;
        return Ok(s);
      }
      self.pos += 1;
    }
    Err(ArrayDecodeError::header("字符串未闭合"))
  }

  fn parse_tuple(&mut self) -> Result<Vec<usize>, ArrayDecodeError> {
    self.expect(b'(')?;
    let mut dims = Vec::new();
    loop {
      self.skip_ws();
      match self.peek() {
        Some(b')') => {
          self.pos += 1;
          return Ok(dims);
        }
        Some(b',') => self.pos += 1,
        Some(c) if c.is_ascii_digit() => {
          let start = self.pos;
          while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
          }
          let digits = std::str::from_utf8(&self.text[start..self.pos])
            .map_err(|_| ArrayDecodeError::header("形状无效"))?;
          let dim = digits
            .parse::<usize>()
            .map_err(|_| ArrayDecodeError::header(format!("形状维度 '{}' 无效", digits)))?;
          // python 2 写出的长整型后缀
          if self.peek() == Some(b'L') {
            self.pos += 1;
          }
          dims.push(dim);
        }
        _ => return Err(ArrayDecodeError::header(format!("位置 {} 处形状无效", self.pos))),
      }
    }
  }
}
