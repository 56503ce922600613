// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::{
  frame::{Frame, FrameError},
  model::{DetectResult, Labels},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Error, Debug)]
pub enum OverlayError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("无法加载字体: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
  #[error("帧格式错误: {0}")]
  Frame(#[from] FrameError),
}

/// 把检测框画回原始帧
///
/// 检测框先经 letterbox 反变换到帧坐标，再按类别着色、加粗 2 像素。
/// 配置了字体时在框上方写出类别和置信度。
pub struct Overlay {
  labels: Labels,
  font: Option<FontVec>,
  font_size: f32,
}

impl Default for Overlay {
  fn default() -> Self {
    Self::new(Labels::default())
  }
}

impl Overlay {
  pub fn new(labels: Labels) -> Self {
    Self {
      labels,
      font: None,
      font_size: LABEL_FONT_SIZE,
    }
  }

  pub fn with_font(mut self, font: FontVec) -> Self {
    self.font = Some(font);
    self
  }

  /// 读取 TrueType 字体文件
  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, OverlayError> {
    let path = path.as_ref();
    let font = FontVec::try_from_vec(std::fs::read(path)?)?;
    info!("加载标签字体: {}", path.display());
    Ok(self.with_font(font))
  }

  pub fn labels(&self) -> &Labels {
    &self.labels
  }

  /// 每个类别固定的颜色（B、G、R）
  pub fn color(class_id: usize) -> [u8; 3] {
    // 色相按黄金角步进，相邻类别颜色差别明显
    let hue = (class_id as f32 * 137.508) % 360.0;
    hsv_to_bgr(hue, 0.85, 0.95)
  }

  pub fn draw(&self, frame: &mut Frame, result: &DetectResult) -> Result<(), OverlayError> {
    let (width, height) = (frame.width() as i32, frame.height() as i32);
    let mut image = frame.as_image_mut()?;

    for item in result.items.iter() {
      let bbox = result.letterbox.unmap(&item.bbox);

      let x_min = (bbox.x as i32).clamp(0, width - 1);
      let y_min = (bbox.y as i32).clamp(0, height - 1);
      let x_max = ((bbox.x + bbox.w) as i32).clamp(0, width - 1);
      let y_max = ((bbox.y + bbox.h) as i32).clamp(0, height - 1);
      if x_min >= x_max || y_min >= y_max {
        continue;
      }

      let color = Rgb(Self::color(item.class_id));
      for inset in 0..BOX_THICKNESS {
        let w = x_max - x_min - 2 * inset;
        let h = y_max - y_min - 2 * inset;
        if w <= 0 || h <= 0 {
          break;
        }
        let rect = Rect::at(x_min + inset, y_min + inset).of_size(w as u32 + 1, h as u32 + 1);
        draw_hollow_rect_mut(&mut image, rect, color);
      }

      let Some(font) = &self.font else {
        continue;
      };

      let label = format!("{} {:.2}", self.labels.name(item.class_id), item.confidence);
      let scale = PxScale::from(self.font_size);
      let (text_width, text_height) = text_size(scale, font, &label);
      let label_height = text_height as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;
      let label_x = x_min;
      let label_y = (y_min - label_height).max(0);
      let label_width = (text_width as i32).min(width - label_x);

      if label_width > 0 && label_height > 0 {
        let rect = Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
        draw_filled_rect_mut(&mut image, rect, color);
        draw_text_mut(
          &mut image,
          Rgb(TEXT_COLOR),
          label_x,
          label_y + LABEL_TEXT_VERTICAL_PADDING,
          scale,
          font,
          &label,
        );
      }
    }

    Ok(())
  }
}

fn hsv_to_bgr(hue: f32, saturation: f32, value: f32) -> [u8; 3] {
  let c = value * saturation;
  let h = hue / 60.0;
  let x = c * (1.0 - (h % 2.0 - 1.0).abs());
  let (r, g, b) = match h as u32 {
    0 => (c, x, 0.0),
    1 => (x, c, 0.0),
    2 => (0.0, c, x),
    3 => (0.0, x, c),
    4 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };
  let m = value - c;
  let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
  [to_u8(b), to_u8(g), to_u8(r)]
}
