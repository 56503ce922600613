// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 加速器张量描述与反量化
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

use std::sync::Arc;

use half::f16;
use serde::Deserialize;
use thiserror::Error;

/// 加速器原生元素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementFormat {
  Int8,
  UInt8,
  Int16,
  UInt16,
  Int32,
  UInt32,
  Int64,
  UInt64,
  Fp16,
  BFp16,
  Fp32,
  Fp64,
}

impl ElementFormat {
  pub fn byte_width(self) -> usize {
    match self {
      ElementFormat::Int8 | ElementFormat::UInt8 => 1,
      ElementFormat::Int16 | ElementFormat::UInt16 => 2,
      ElementFormat::Fp16 | ElementFormat::BFp16 => 2,
      ElementFormat::Int32 | ElementFormat::UInt32 | ElementFormat::Fp32 => 4,
      ElementFormat::Int64 | ElementFormat::UInt64 | ElementFormat::Fp64 => 8,
    }
  }

  /// [`TensorDecoder`] 能否解码该格式
  pub fn is_decodable(self) -> bool {
    matches!(
      self,
      ElementFormat::Int8
        | ElementFormat::UInt8
        | ElementFormat::Int16
        | ElementFormat::UInt16
        | ElementFormat::Fp16
        | ElementFormat::Fp32
    )
  }

  pub fn is_float(self) -> bool {
    matches!(
      self,
      ElementFormat::Fp16 | ElementFormat::BFp16 | ElementFormat::Fp32 | ElementFormat::Fp64
    )
  }
}

/// 每个张量的量化参数，创建加速器时确定，之后只读
///
/// 浮点格式的张量忽略量化参数。
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuantizationSpec {
  #[default]
  None,
  /// 二进制小数点位移：`raw * 2^-shift`
  FixedPoint { shift: i8 },
  /// `(raw - zero_point) * scale`
  Affine { scale: f32, zero_point: i32 },
}

impl QuantizationSpec {
  /// 原始整数 → 实数
  pub fn dequantize(self, raw: i64) -> f32 {
    match self {
      QuantizationSpec::None => raw as f32,
      QuantizationSpec::FixedPoint { shift } => raw as f32 * fixed_point_factor(shift),
      QuantizationSpec::Affine { scale, zero_point } => {
        (raw - i64::from(zero_point)) as f32 * scale
      }
    }
  }

  /// 实数 → 未取整的原始值，取整与截断由调用方按元素格式完成
  pub fn quantize(self, value: f32) -> f32 {
    match self {
      QuantizationSpec::None => value,
      QuantizationSpec::FixedPoint { shift } => value / fixed_point_factor(shift),
      QuantizationSpec::Affine { scale, zero_point } => value / scale + zero_point as f32,
    }
  }
}

// shift > 0 时为 2^-shift，否则为 2^|shift|，两种情况都是精确的二次幂
fn fixed_point_factor(shift: i8) -> f32 {
  2f32.powi(-i32::from(shift))
}

/// 张量描述：格式、维度与量化参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TensorDesc {
  pub format: ElementFormat,
  pub dims: Vec<usize>,
  #[serde(default)]
  pub quantization: QuantizationSpec,
}

impl TensorDesc {
  pub fn new(format: ElementFormat, dims: Vec<usize>, quantization: QuantizationSpec) -> Self {
    Self {
      format,
      dims,
      quantization,
    }
  }

  pub fn element_count(&self) -> usize {
    self.dims.iter().product()
  }

  pub fn byte_len(&self) -> usize {
    self.element_count() * self.format.byte_width()
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("不支持的元素格式: {0:?}")]
  UnsupportedFormat(ElementFormat),
  #[error("张量字节数不匹配: 期望 {expected}, 实际 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 从加速器输出缓冲区复制出来的原始字节
///
/// 持有自己的数据，因此下一次推理复用加速器缓冲区时不受影响。
#[derive(Debug, Clone)]
pub struct RawTensorBuffer {
  desc: Arc<TensorDesc>,
  data: Box<[u8]>,
}

impl RawTensorBuffer {
  pub fn new(desc: Arc<TensorDesc>, data: impl Into<Box<[u8]>>) -> Result<Self, DecodeError> {
    let data = data.into();
    let expected = desc.byte_len();
    if data.len() != expected {
      return Err(DecodeError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { desc, data })
  }

  pub fn desc(&self) -> &TensorDesc {
    &self.desc
  }

  pub fn format(&self) -> ElementFormat {
    self.desc.format
  }

  pub fn quantization(&self) -> QuantizationSpec {
    self.desc.quantization
  }

  pub fn element_count(&self) -> usize {
    self.desc.element_count()
  }

  pub fn element_width(&self) -> usize {
    self.desc.format.byte_width()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }
}

/// 解码后的稠密 `f32` 张量，生成后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTensor {
  values: Box<[f32]>,
  dims: Vec<usize>,
}

impl DecodedTensor {
  pub fn new(values: impl Into<Box<[f32]>>, dims: Vec<usize>) -> Result<Self, DecodeError> {
    let values = values.into();
    let expected: usize = dims.iter().product();
    if values.len() != expected {
      return Err(DecodeError::LengthMismatch {
        expected,
        actual: values.len(),
      });
    }
    Ok(Self { values, dims })
  }

  pub fn values(&self) -> &[f32] {
    &self.values
  }

  pub fn dims(&self) -> &[usize] {
    &self.dims
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

/// 原始张量 → `f32` 张量
///
/// 整数格式按小端读取，再按 [`QuantizationSpec`] 换算；`fp16` 经 [`half::f16`]
/// 逐位精确地展宽，`fp32` 直接读取。解码要么整体成功，要么整体失败。
#[derive(Debug, Clone, Copy, Default)]
pub struct TensorDecoder;

impl TensorDecoder {
  pub fn decode(&self, raw: &RawTensorBuffer) -> Result<DecodedTensor, DecodeError> {
    let bytes = raw.as_bytes();
    let quant = raw.quantization();

    let values: Vec<f32> = match raw.format() {
      ElementFormat::Int8 => bytes
        .iter()
        .map(|&b| quant.dequantize(i64::from(b as i8)))
        .collect(),
      ElementFormat::UInt8 => bytes
        .iter()
        .map(|&b| quant.dequantize(i64::from(b)))
        .collect(),
      ElementFormat::Int16 => bytes
        .chunks_exact(2)
        .map(|c| quant.dequantize(i64::from(i16::from_le_bytes([c[0], c[1]]))))
        .collect(),
      ElementFormat::UInt16 => bytes
        .chunks_exact(2)
        .map(|c| quant.dequantize(i64::from(u16::from_le_bytes([c[0], c[1]]))))
        .collect(),
      ElementFormat::Fp16 => bytes
        .chunks_exact(2)
        .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
        .collect(),
      ElementFormat::Fp32 => bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect(),
      other => return Err(DecodeError::UnsupportedFormat(other)),
    };

    DecodedTensor::new(values, raw.desc().dims.clone())
  }
}

/// 实数 → 加速器原生编码，是 [`TensorDecoder`] 的逆过程
#[derive(Debug, Clone, Copy, Default)]
pub struct TensorEncoder;

impl TensorEncoder {
  pub fn encode_into(
    &self,
    desc: &TensorDesc,
    values: &[f32],
    out: &mut [u8],
  ) -> Result<(), DecodeError> {
    if !desc.format.is_decodable() {
      return Err(DecodeError::UnsupportedFormat(desc.format));
    }
    if values.len() != desc.element_count() {
      return Err(DecodeError::LengthMismatch {
        expected: desc.element_count(),
        actual: values.len(),
      });
    }
    if out.len() != desc.byte_len() {
      return Err(DecodeError::LengthMismatch {
        expected: desc.byte_len(),
        actual: out.len(),
      });
    }

    let width = desc.format.byte_width();
    for (value, slot) in values.iter().zip(out.chunks_exact_mut(width)) {
      let raw = if desc.format.is_float() {
        *value
      } else {
        desc.quantization.quantize(*value)
      };
      store_element(desc.format, raw, slot)?;
    }
    Ok(())
  }

  pub fn encode(&self, desc: Arc<TensorDesc>, values: &[f32]) -> Result<RawTensorBuffer, DecodeError> {
    let mut data = vec![0u8; desc.byte_len()];
    self.encode_into(&desc, values, &mut data)?;
    RawTensorBuffer::new(desc, data)
  }
}

/// 写一个元素：整数格式就近取整并截断到取值范围，浮点格式直接编码
///
/// `slot` 的长度必须等于格式宽度。
pub fn store_element(format: ElementFormat, value: f32, slot: &mut [u8]) -> Result<(), DecodeError> {
  fn saturate(value: f32, min: f32, max: f32) -> f32 {
    value.round().clamp(min, max)
  }

  if slot.len() != format.byte_width() {
    return Err(DecodeError::LengthMismatch {
      expected: format.byte_width(),
      actual: slot.len(),
    });
  }

  match format {
    ElementFormat::Int8 => {
      slot[0] = (saturate(value, i8::MIN.into(), i8::MAX.into()) as i8) as u8;
    }
    ElementFormat::UInt8 => {
      slot[0] = saturate(value, 0.0, u8::MAX.into()) as u8;
    }
    ElementFormat::Int16 => {
      let v = saturate(value, i16::MIN.into(), i16::MAX.into()) as i16;
      slot.copy_from_slice(&v.to_le_bytes());
    }
    ElementFormat::UInt16 => {
      let v = saturate(value, 0.0, u16::MAX.into()) as u16;
      slot.copy_from_slice(&v.to_le_bytes());
    }
    ElementFormat::Fp16 => slot.copy_from_slice(&f16::from_f32(value).to_bits().to_le_bytes()),
    ElementFormat::Fp32 => slot.copy_from_slice(&value.to_le_bytes()),
    other => return Err(DecodeError::UnsupportedFormat(other)),
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn raw(format: ElementFormat, quantization: QuantizationSpec, data: Vec<u8>) -> RawTensorBuffer {
    let count = data.len() / format.byte_width();
    let desc = Arc::new(TensorDesc::new(format, vec![count], quantization));
    RawTensorBuffer::new(desc, data).unwrap()
  }

  fn decode(raw: &RawTensorBuffer) -> Vec<f32> {
    TensorDecoder.decode(raw).unwrap().values().to_vec()
  }

  #[test]
  fn none_reinterprets_integers() {
    let t = raw(ElementFormat::Int8, QuantizationSpec::None, vec![0x80, 0x7f, 0xff]);
    assert_eq!(decode(&t), vec![-128.0, 127.0, -1.0]);

    let t = raw(ElementFormat::UInt8, QuantizationSpec::None, vec![0x80, 0xff]);
    assert_eq!(decode(&t), vec![128.0, 255.0]);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(-300i16).to_le_bytes());
    bytes.extend_from_slice(&(40000u16).to_le_bytes());
    let t = raw(ElementFormat::Int16, QuantizationSpec::None, bytes[..2].to_vec());
    assert_eq!(decode(&t), vec![-300.0]);
    let t = raw(ElementFormat::UInt16, QuantizationSpec::None, bytes[2..].to_vec());
    assert_eq!(decode(&t), vec![40000.0]);
  }

  #[test]
  fn affine_zero_point_and_one_step() {
    for (scale, zero_point) in [(0.5f32, 0i32), (0.0039215686, -128), (3.75, 17), (1e-3, 100)] {
      let quant = QuantizationSpec::Affine { scale, zero_point };
      let bytes = vec![zero_point as i8 as u8, (zero_point + 1) as i8 as u8];
      let values = decode(&raw(ElementFormat::Int8, quant, bytes));
      assert_eq!(values[0], 0.0);
      assert_eq!(values[1], scale);
    }
  }

  #[test]
  fn fixed_point_shift_both_directions() {
    for shift in 1i8..=14 {
      let quant = QuantizationSpec::FixedPoint { shift };
      let mut bytes = Vec::new();
      bytes.extend_from_slice(&(1i16 << shift).to_le_bytes());
      bytes.extend_from_slice(&1i16.to_le_bytes());
      bytes.extend_from_slice(&(-1i16).to_le_bytes());
      let values = decode(&raw(ElementFormat::Int16, quant, bytes));
      assert_eq!(values[0], 1.0);
      assert_eq!(values[1], 2f32.powi(-i32::from(shift)));
      assert_eq!(values[2], -(2f32.powi(-i32::from(shift))));
    }

    // 负位移表示放大
    let quant = QuantizationSpec::FixedPoint { shift: -3 };
    let values = decode(&raw(ElementFormat::Int8, quant, vec![1, 0xfe]));
    assert_eq!(values, vec![8.0, -16.0]);

    let quant = QuantizationSpec::FixedPoint { shift: 0 };
    let values = decode(&raw(ElementFormat::Int8, quant, vec![5]));
    assert_eq!(values, vec![5.0]);
  }

  #[test]
  fn float_formats_decode_directly() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x3c00u16.to_le_bytes());
    bytes.extend_from_slice(&0x7bffu16.to_le_bytes());
    let values = decode(&raw(ElementFormat::Fp16, QuantizationSpec::None, bytes));
    assert_eq!(values, vec![1.0, 65504.0]);

    let bytes = [0.25f32, -7.5].iter().flat_map(|v| v.to_le_bytes()).collect();
    let values = decode(&raw(ElementFormat::Fp32, QuantizationSpec::None, bytes));
    assert_eq!(values, vec![0.25, -7.5]);
  }

  fn fp16_bits(bits: &[u16]) -> RawTensorBuffer {
    let bytes = bits.iter().flat_map(|b| b.to_le_bytes()).collect();
    raw(ElementFormat::Fp16, QuantizationSpec::None, bytes)
  }

  #[test]
  fn fp16_boundary_values_widen_exactly() {
    let values = decode(&fp16_bits(&[
      0x0000, 0x8000, 0x3c00, 0x7bff, 0x0001, 0x0400, 0x7c00, 0xfc00, 0x7e00,
    ]));
    assert_eq!(values[0].to_bits(), 0.0f32.to_bits());
    assert_eq!(values[1].to_bits(), (-0.0f32).to_bits());
    assert_eq!(values[2], 1.0);
    assert_eq!(values[3], 65504.0);
    assert_eq!(values[4], 2.0f32.powi(-24));
    assert_eq!(values[5], 2.0f32.powi(-14));
    assert_eq!(values[6], f32::INFINITY);
    assert_eq!(values[7], f32::NEG_INFINITY);
    assert!(values[8].is_nan());
  }

  #[test]
  fn fp16_store_rounds_to_nearest_even() {
    let mut slot = [0u8; 2];
    let mut store = |value: f32| {
      store_element(ElementFormat::Fp16, value, &mut slot).unwrap();
      u16::from_le_bytes(slot)
    };
    assert_eq!(store(1.0), 0x3c00);
    assert_eq!(store(65504.0), 0x7bff);
    assert_eq!(store(1.0e9), 0x7c00);
    assert_eq!(store(2.0f32.powi(-24)), 0x0001);
    // 1 + 2^-11 正好在两个半精度数中间，舍入到偶数
    assert_eq!(store(1.0 + 2.0f32.powi(-11)), 0x3c00);
    assert_eq!(store(f32::NAN) & 0x7c00, 0x7c00);
  }

  #[test]
  fn every_finite_fp16_survives_decode_and_store() {
    let bits: Vec<u16> = (0u16..=u16::MAX).filter(|b| b & 0x7c00 != 0x7c00).collect();
    let values = decode(&fp16_bits(&bits));

    let desc = TensorDesc::new(ElementFormat::Fp16, vec![values.len()], QuantizationSpec::None);
    let mut out = vec![0u8; desc.byte_len()];
    TensorEncoder.encode_into(&desc, &values, &mut out).unwrap();
    for (expected, chunk) in bits.iter().zip(out.chunks_exact(2)) {
      assert_eq!(u16::from_le_bytes([chunk[0], chunk[1]]), *expected, "bits = {expected:#06x}");
    }
  }

  #[test]
  fn unsupported_formats_are_rejected() {
    for format in [
      ElementFormat::Int32,
      ElementFormat::UInt32,
      ElementFormat::Int64,
      ElementFormat::UInt64,
      ElementFormat::BFp16,
      ElementFormat::Fp64,
    ] {
      let t = raw(format, QuantizationSpec::None, vec![0; format.byte_width() * 2]);
      assert_eq!(
        TensorDecoder.decode(&t),
        Err(DecodeError::UnsupportedFormat(format))
      );
    }
  }

  #[test]
  fn buffer_length_must_match_desc() {
    let desc = Arc::new(TensorDesc::new(
      ElementFormat::Int16,
      vec![2, 3],
      QuantizationSpec::None,
    ));
    assert_eq!(desc.byte_len(), 12);
    assert_eq!(
      RawTensorBuffer::new(desc, vec![0u8; 11]).unwrap_err(),
      DecodeError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    );
  }

  #[test]
  fn decoded_tensor_keeps_dims() {
    let desc = Arc::new(TensorDesc::new(
      ElementFormat::UInt8,
      vec![2, 2],
      QuantizationSpec::None,
    ));
    let t = RawTensorBuffer::new(desc, vec![1, 2, 3, 4]).unwrap();
    let decoded = TensorDecoder.decode(&t).unwrap();
    assert_eq!(decoded.dims(), &[2, 2]);
    assert_eq!(decoded.len(), 4);
  }

  #[test]
  fn store_element_saturates() {
    let mut slot = [0u8; 1];
    store_element(ElementFormat::Int8, 300.0, &mut slot).unwrap();
    assert_eq!(slot[0] as i8, 127);
    store_element(ElementFormat::UInt8, -4.0, &mut slot).unwrap();
    assert_eq!(slot[0], 0);
    assert!(store_element(ElementFormat::Int16, 1.0, &mut slot).is_err());
  }

  #[test]
  fn quantization_spec_from_json() {
    let desc: TensorDesc = serde_json::from_str(
      r#"{"format":"int8","dims":[1,84,8400],"quantization":{"type":"affine","scale":0.5,"zero_point":-128}}"#,
    )
    .unwrap();
    assert_eq!(desc.format, ElementFormat::Int8);
    assert_eq!(
      desc.quantization,
      QuantizationSpec::Affine {
        scale: 0.5,
        zero_point: -128
      }
    );

    let desc: TensorDesc = serde_json::from_str(r#"{"format":"fp16","dims":[4]}"#).unwrap();
    assert_eq!(desc.quantization, QuantizationSpec::None);
  }

  fn quantization_strategy() -> impl Strategy<Value = QuantizationSpec> {
    prop_oneof![
      Just(QuantizationSpec::None),
      (-4i8..=6).prop_map(|shift| QuantizationSpec::FixedPoint { shift }),
      (0.001f32..2.0, -20i32..20)
        .prop_map(|(scale, zero_point)| QuantizationSpec::Affine { scale, zero_point }),
    ]
  }

  fn step(quant: QuantizationSpec) -> f32 {
    match quant {
      QuantizationSpec::None => 1.0,
      QuantizationSpec::FixedPoint { shift } => fixed_point_factor(shift),
      QuantizationSpec::Affine { scale, .. } => scale,
    }
  }

  proptest! {
    #[test]
    fn encode_decode_requantize(
      quant in quantization_strategy(),
      units in proptest::collection::vec(-100.0f32..100.0, 1..32),
    ) {
      // 取值范围在 int16 内，避免截断
      let values: Vec<f32> = units.iter().map(|u| u * step(quant)).collect();
      let desc = Arc::new(TensorDesc::new(ElementFormat::Int16, vec![values.len()], quant));
      let encoded = TensorEncoder.encode(desc.clone(), &values).unwrap();
      let decoded = TensorDecoder.decode(&encoded).unwrap();
      for (orig, back) in values.iter().zip(decoded.values()) {
        prop_assert!((orig - back).abs() <= step(quant) * 0.5 + 1e-3);
      }

      let requantized = TensorEncoder.encode(desc, decoded.values()).unwrap();
      prop_assert_eq!(requantized.as_bytes(), encoded.as_bytes());
    }
  }
}
