// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - BGR 帧定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use thiserror::Error;

use crate::tensor::{DecodeError, ElementFormat, store_element};

pub const BGR_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
  #[error("空帧")]
  Empty,
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("输入缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSize { expected: usize, actual: usize },
  #[error(transparent)]
  Format(#[from] DecodeError),
}

/// 模型输入的通道排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ChannelOrder {
  /// R、G、B 三个平面
  #[default]
  Rgb,
  /// B、G、R 三个平面
  Bgr,
}

impl ChannelOrder {
  /// 第 `plane` 个平面取自 BGR 像素的哪个分量
  fn source_channel(self, plane: usize) -> usize {
    match self {
      ChannelOrder::Rgb => 2 - plane,
      ChannelOrder::Bgr => plane,
    }
  }
}

/// 独占的 BGR 交错像素缓冲区
///
/// 在阶段之间按值移动，不会被两个阶段同时修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl Frame {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::Empty);
    }
    let expected = BGR_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 纯色帧，`bgr` 按 B、G、R 顺序
  pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Result<Self, FrameError> {
    let data = bgr
      .iter()
      .copied()
      .cycle()
      .take(BGR_CHANNELS * width as usize * height as usize)
      .collect();
    Self::new(width, height, data)
  }

  pub fn from_rgb_image(image: &RgbImage) -> Result<Self, FrameError> {
    let mut data = image.as_raw().clone();
    for pixel in data.chunks_exact_mut(BGR_CHANNELS) {
      pixel.swap(0, 2);
    }
    Self::new(image.width(), image.height(), data)
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    let mut image = RgbImage::new(self.width, self.height);
    for (dst, src) in image
      .chunks_exact_mut(BGR_CHANNELS)
      .zip(self.data.chunks_exact(BGR_CHANNELS))
    {
      dst.copy_from_slice(&[src[2], src[1], src[0]]);
    }
    image
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn as_bytes_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  pub fn into_bytes(self) -> Box<[u8]> {
    self.data
  }

  /// `(x, y)` 处的 BGR 像素
  pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let offset = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
    Some([
      self.data[offset],
      self.data[offset + 1],
      self.data[offset + 2],
    ])
  }

  /// 以 `image` 视图借用像素，通道仍是 B、G、R
  pub fn as_image(&self) -> Result<ImageBuffer<Rgb<u8>, &[u8]>, FrameError> {
    let expected = self.data.len();
    ImageBuffer::from_raw(self.width, self.height, &self.data[..])
      .ok_or(FrameError::LengthMismatch { expected, actual: expected })
  }

  /// 可变的 `image` 视图，供 `imageproc` 直接在帧上绘制；颜色需按 B、G、R 给出
  pub fn as_image_mut(&mut self) -> Result<ImageBuffer<Rgb<u8>, &mut [u8]>, FrameError> {
    let expected = self.data.len();
    ImageBuffer::from_raw(self.width, self.height, &mut self.data[..])
      .ok_or(FrameError::LengthMismatch { expected, actual: expected })
  }

  /// 交错 BGR → 按通道排列的平面，写成加速器输入的元素格式
  ///
  /// `uint8` 原样复制，`int8` 减去 128，其余支持的格式按 0..255 的数值写入。
  pub fn fill_planar(
    &self,
    order: ChannelOrder,
    format: ElementFormat,
    out: &mut [u8],
  ) -> Result<(), FrameError> {
    if !format.is_decodable() {
      return Err(DecodeError::UnsupportedFormat(format).into());
    }

    let plane_len = self.width as usize * self.height as usize;
    if plane_len == 0 {
      return Err(FrameError::Empty);
    }
    let width = format.byte_width();
    let expected = BGR_CHANNELS * plane_len * width;
    if out.len() != expected {
      return Err(FrameError::BufferSize {
        expected,
        actual: out.len(),
      });
    }

    for (plane, dst) in out.chunks_exact_mut(plane_len * width).enumerate() {
      let source = order.source_channel(plane);
      let values = self.data.iter().skip(source).step_by(BGR_CHANNELS);
      match format {
        ElementFormat::UInt8 => {
          for (d, &v) in dst.iter_mut().zip(values) {
            *d = v;
          }
        }
        ElementFormat::Int8 => {
          for (d, &v) in dst.iter_mut().zip(values) {
            *d = v ^ 0x80;
          }
        }
        _ => {
          for (slot, &v) in dst.chunks_exact_mut(width).zip(values) {
            store_element(format, f32::from(v), slot)?;
          }
        }
      }
    }
    Ok(())
  }
}
