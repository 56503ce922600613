// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 静态图像输入
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

use std::{
  thread,
  time::{Duration, Instant},
};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use super::{Capture, CaptureError};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError},
};

const DEFAULT_FPS: f32 = 30.0;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("无效的帧率: {0}")]
  InvalidFps(String),
  #[error(transparent)]
  Frame(#[from] FrameError),
}

/// 把一张图片当作摄像头：每次 `grab` 返回同一帧，按帧率节流
pub struct ImageFileInput {
  frame: Frame,
  interval: Duration,
  last: Option<Instant>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let mut fps = DEFAULT_FPS;
    for (key, value) in url.query_pairs() {
      if key == "fps" {
        fps = value
          .parse::<f32>()
          .ok()
          .filter(|fps| fps.is_finite() && *fps > 0.0)
          .ok_or_else(|| ImageFileInputError::InvalidFps(value.to_string()))?;
      }
    }

    let path = url.path();
    info!("读取图像文件: {}", path);
    let image = ImageReader::open(path)?.decode()?;
    Self::from_image(&image.into_rgb8(), fps)
  }
}

impl ImageFileInput {
  pub fn from_image(image: &RgbImage, fps: f32) -> Result<Self, ImageFileInputError> {
    if !(fps.is_finite() && fps > 0.0) {
      return Err(ImageFileInputError::InvalidFps(fps.to_string()));
    }
    // 帧率过小时帧间隔超出 Duration 的范围
    let interval = Duration::try_from_secs_f64(1.0 / f64::from(fps))
      .map_err(|_| ImageFileInputError::InvalidFps(fps.to_string()))?;
    Ok(Self {
      frame: Frame::from_rgb_image(image)?,
      interval,
      last: None,
    })
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }
}

impl Capture for ImageFileInput {
  fn grab(&mut self) -> Result<Frame, CaptureError> {
    if let Some(last) = self.last {
      let elapsed = last.elapsed();
      if elapsed < self.interval {
        thread::sleep(self.interval - elapsed);
      }
    }
    self.last = Some(Instant::now());
    Ok(self.frame.clone())
  }
}
