// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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

use image::ImageFormat;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::Capture as _,
};

use super::{Capture, CaptureError};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{BGR_CHANNELS, Frame},
};

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("无效的参数 {0}={1}")]
  InvalidQuery(String, String),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
  #[error("帧数据长度 {actual} 小于期望 {expected}")]
  ShortBuffer { expected: usize, actual: usize },
  #[error("MJPG 解码错误: {0}")]
  Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Yuyv,
  Mjpg,
  Bgr3,
}

impl PixelFormat {
  const PREFERRED: [PixelFormat; 3] = [PixelFormat::Yuyv, PixelFormat::Mjpg, PixelFormat::Bgr3];

  fn fourcc(self) -> FourCC {
    match self {
      PixelFormat::Yuyv => FourCC::new(b"YUYV"),
      PixelFormat::Mjpg => FourCC::new(b"MJPG"),
      PixelFormat::Bgr3 => FourCC::new(b"BGR3"),
    }
  }

  fn from_fourcc(fourcc: FourCC) -> Option<Self> {
    Self::PREFERRED.into_iter().find(|f| f.fourcc() == fourcc)
  }
}

/// V4L2 摄像头
///
/// 依次尝试 YUYV、MJPG、BGR3，选中驱动接受的第一个，统一转换成 BGR。
pub struct V4lInput {
  // stream 必须先于 device 释放
  stream: Stream<'static>,
  _device: Device,
  format: PixelFormat,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    // v4l:///dev/video0?width=1280&height=720
    let device_path = if url.path().is_empty() || url.path() == "/" {
      DEFAULT_DEVICE.to_string()
    } else {
      url.path().to_string()
    };

    let mut width = DEFAULT_WIDTH;
    let mut height = DEFAULT_HEIGHT;
    for (key, value) in url.query_pairs() {
      let parsed = || {
        value
          .parse::<u32>()
          .ok()
          .filter(|v| *v > 0)
          .ok_or_else(|| V4lInputError::InvalidQuery(key.to_string(), value.to_string()))
      };
      match key.as_ref() {
        "width" => width = parsed()?,
        "height" => height = parsed()?,
        _ => {}
      }
    }

    Self::open(&device_path, width, height)
  }
}

impl V4lInput {
  pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, V4lInputError> {
    info!("打开摄像头: {} ({}x{})", device_path, width, height);
    let device = Device::with_path(device_path)?;

    let mut negotiated = None;
    for candidate in PixelFormat::PREFERRED {
      let mut format = device.format()?;
      format.width = width;
      format.height = height;
      format.fourcc = candidate.fourcc();
      let format = device.set_format(&format)?;
      if let Some(pixel) = PixelFormat::from_fourcc(format.fourcc) {
        negotiated = Some((pixel, format.width, format.height));
        break;
      }
    }

    let (format, width, height) = negotiated.ok_or_else(|| {
      let current = device
        .format()
        .map(|f| f.fourcc.to_string())
        .unwrap_or_default();
      V4lInputError::UnsupportedPixelFormat(current)
    })?;
    info!("摄像头格式: {:?} {}x{}", format, width, height);

    let stream = Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)?;

    Ok(Self {
      stream,
      _device: device,
      format,
      width,
      height,
    })
  }

  fn convert(&self, buffer: &[u8]) -> Result<Frame, V4lInputError> {
    let pixels = self.width as usize * self.height as usize;
    match self.format {
      PixelFormat::Yuyv => {
        let expected = pixels * 2;
        if buffer.len() < expected {
          return Err(V4lInputError::ShortBuffer {
            expected,
            actual: buffer.len(),
          });
        }
        let bgr = yuyv_to_bgr(&buffer[..expected]);
        Frame::new(self.width, self.height, bgr).map_err(|e| {
          V4lInputError::UnsupportedPixelFormat(format!("YUYV 转换失败: {}", e))
        })
      }
      PixelFormat::Mjpg => {
        let image = image::load_from_memory_with_format(buffer, ImageFormat::Jpeg)?.into_rgb8();
        Frame::from_rgb_image(&image).map_err(|e| {
          V4lInputError::UnsupportedPixelFormat(format!("MJPG 转换失败: {}", e))
        })
      }
      PixelFormat::Bgr3 => {
        let expected = pixels * BGR_CHANNELS;
        if buffer.len() < expected {
          return Err(V4lInputError::ShortBuffer {
            expected,
            actual: buffer.len(),
          });
        }
        Frame::new(self.width, self.height, buffer[..expected].to_vec()).map_err(|e| {
          V4lInputError::UnsupportedPixelFormat(format!("BGR3 转换失败: {}", e))
        })
      }
    }
  }
}

impl Capture for V4lInput {
  fn grab(&mut self) -> Result<Frame, CaptureError> {
    let (buffer, _meta) = CaptureStream::next(&mut self.stream).map_err(V4lInputError::from)?;
    let buffer = buffer.to_vec();
    Ok(self.convert(&buffer)?)
  }
}

/// BT.601 YUYV → BGR
fn yuyv_to_bgr(yuyv: &[u8]) -> Vec<u8> {
  let mut bgr = Vec::with_capacity(yuyv.len() / 2 * BGR_CHANNELS);

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;

    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      bgr.extend_from_slice(&[b, g, r]);
    }
  }

  bgr
}
