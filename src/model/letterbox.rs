// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/letterbox.rs - 保持比例的缩放与填充
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

use image::{Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;

use super::BoundingBox;
use crate::frame::{Frame, FrameError};

/// 默认填充值（灰色）
pub const DEFAULT_PAD_VALUE: u8 = 114;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LetterboxError {
  #[error("目标尺寸无效: {0}x{1}")]
  InvalidTarget(u32, u32),
  #[error("帧尺寸 {actual:?} 与计算时的尺寸 {expected:?} 不一致")]
  SourceMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error(transparent)]
  Frame(#[from] FrameError),
}

/// 一次 letterbox 变换的几何参数
///
/// 只缩小不放大：`scale = min(1, th/h, tw/w)`，缩放后的尺寸四舍五入，
/// 剩余部分平分到两侧，奇数时前侧（上、左）少一个像素。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub source_width: u32,
  pub source_height: u32,
  pub target_width: u32,
  pub target_height: u32,
  pub scale: f32,
  pub resized_width: u32,
  pub resized_height: u32,
  pub pad_top: u32,
  pub pad_bottom: u32,
  pub pad_left: u32,
  pub pad_right: u32,
}

impl Letterbox {
  pub fn compute(
    source_width: u32,
    source_height: u32,
    target_width: u32,
    target_height: u32,
  ) -> Result<Self, LetterboxError> {
    if target_width == 0 || target_height == 0 {
      return Err(LetterboxError::InvalidTarget(target_width, target_height));
    }
    if source_width == 0 || source_height == 0 {
      return Err(FrameError::Empty.into());
    }

    let scale = (target_height as f32 / source_height as f32)
      .min(target_width as f32 / source_width as f32)
      .min(1.0);

    let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, target_width);
    let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, target_height);

    let (pad_left, pad_right) = split_padding(target_width - resized_width);
    let (pad_top, pad_bottom) = split_padding(target_height - resized_height);

    Ok(Self {
      source_width,
      source_height,
      target_width,
      target_height,
      scale,
      resized_width,
      resized_height,
      pad_top,
      pad_bottom,
      pad_left,
      pad_right,
    })
  }

  pub fn is_identity(&self) -> bool {
    self.source_width == self.target_width && self.source_height == self.target_height
  }

  /// 缩放并填充一帧，尺寸必须与计算时一致
  pub fn apply(&self, frame: &Frame, pad_value: u8) -> Result<Frame, LetterboxError> {
    let actual = (frame.width(), frame.height());
    let expected = (self.source_width, self.source_height);
    if actual != expected {
      return Err(LetterboxError::SourceMismatch { expected, actual });
    }
    if self.is_identity() {
      return Ok(frame.clone());
    }

    let source = frame.as_image()?;
    let resized = if self.scale < 1.0 {
      image::imageops::resize(
        &source,
        self.resized_width,
        self.resized_height,
        FilterType::Triangle,
      )
    } else {
      RgbImage::from_raw(frame.width(), frame.height(), frame.as_bytes().to_vec())
        .ok_or(FrameError::Empty)?
    };

    let mut canvas = RgbImage::from_pixel(
      self.target_width,
      self.target_height,
      Rgb([pad_value; 3]),
    );
    image::imageops::replace(
      &mut canvas,
      &resized,
      i64::from(self.pad_left),
      i64::from(self.pad_top),
    );

    // canvas 里仍是 B、G、R 顺序
    Ok(Frame::new(
      self.target_width,
      self.target_height,
      canvas.into_raw(),
    )?)
  }

  /// 模型输入坐标 → 原始帧坐标
  ///
  /// 减去一半的总填充再除以缩放比，只在最后取整一次。
  pub fn unmap(&self, bbox: &BoundingBox) -> BoundingBox {
    let half_pad_x = (self.target_width - self.resized_width) as f32 * 0.5;
    let half_pad_y = (self.target_height - self.resized_height) as f32 * 0.5;

    let x1 = ((bbox.x - half_pad_x) / self.scale).round();
    let y1 = ((bbox.y - half_pad_y) / self.scale).round();
    let x2 = ((bbox.x + bbox.w - half_pad_x) / self.scale).round();
    let y2 = ((bbox.y + bbox.h - half_pad_y) / self.scale).round();

    BoundingBox {
      x: x1,
      y: y1,
      w: x2 - x1,
      h: y2 - y1,
    }
  }
}

// 总填充平分：round(delta - 0.1) 与 round(delta + 0.1)
fn split_padding(total: u32) -> (u32, u32) {
  let delta = total as f32 * 0.5;
  let before = (delta - 0.1).round() as u32;
  let after = (delta + 0.1).round() as u32;
  (before, after)
}

/// 已经变换到模型输入尺寸的帧，以及把结果映射回去所需的几何参数
#[derive(Debug, Clone)]
pub struct LetterboxedFrame {
  pub frame: Frame,
  pub letterbox: Letterbox,
}
