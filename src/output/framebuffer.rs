// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/framebuffer.rs - Linux 帧缓冲显示
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
  fs::{File, OpenOptions},
  io::{Seek, SeekFrom, Write},
  path::{Path, PathBuf},
};

use image::imageops::{self, FilterType};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Display, DisplayError};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{BGR_CHANNELS, Frame, FrameError},
};

const DEFAULT_DEVICE: &str = "/dev/fb0";
const SYSFS_GRAPHICS: &str = "/sys/class/graphics";

#[derive(Error, Debug)]
pub enum FramebufferError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("无法解析 {path}: {content:?}")]
  InvalidSysfs { path: PathBuf, content: String },
  #[error("不支持的像素深度: {0} bpp")]
  UnsupportedDepth(u32),
  #[error("帧格式错误: {0}")]
  Frame(#[from] FrameError),
}

/// 帧缓冲的像素编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
  /// 16 bpp，5-6-5，红色在高位
  Bgr565,
  /// 32 bpp，字节顺序 B、G、R、A
  Bgra8888,
}

impl PixelLayout {
  pub fn from_bits_per_pixel(bits: u32) -> Result<Self, FramebufferError> {
    match bits {
      16 => Ok(PixelLayout::Bgr565),
      32 => Ok(PixelLayout::Bgra8888),
      other => Err(FramebufferError::UnsupportedDepth(other)),
    }
  }

  pub fn bytes_per_pixel(self) -> usize {
    match self {
      PixelLayout::Bgr565 => 2,
      PixelLayout::Bgra8888 => 4,
    }
  }

  /// 交错 BGR → 设备编码（小端）
  pub fn encode(self, bgr: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(bgr.len() / BGR_CHANNELS * self.bytes_per_pixel());
    for pixel in bgr.chunks_exact(BGR_CHANNELS) {
      let (b, g, r) = (pixel[0], pixel[1], pixel[2]);
      match self {
        PixelLayout::Bgr565 => {
          let value = (u16::from(b) >> 3) | ((u16::from(g) >> 2) << 5) | ((u16::from(r) >> 3) << 11);
          out.extend_from_slice(&value.to_le_bytes());
        }
        PixelLayout::Bgra8888 => out.extend_from_slice(&[b, g, r, 0xff]),
      }
    }
  }
}

/// 从 `/sys/class/graphics/fbN` 读到的屏幕参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenInfo {
  /// 可见区域，双缓冲时小于 `virtual_size`
  pub width: u32,
  pub height: u32,
  /// 每行字节数
  pub stride: usize,
  pub layout: PixelLayout,
}

impl ScreenInfo {
  /// 可见分辨率取自 `mode`（或 `modes` 的第一行），都没有时退回 `virtual_size`
  pub fn from_sysfs(dir: &Path) -> Result<Self, FramebufferError> {
    let bits = read_sysfs(&dir.join("bits_per_pixel"), |s| s.trim().parse::<u32>().ok())?;
    let layout = PixelLayout::from_bits_per_pixel(bits)?;

    let mode = ["mode", "modes"]
      .iter()
      .filter_map(|name| std::fs::read_to_string(dir.join(name)).ok())
      .find_map(|content| content.lines().find_map(parse_mode));
    let (width, height) = match mode {
      Some(size) => size,
      None => {
        warn!("{} 没有可用的显示模式，使用 virtual_size", dir.display());
        read_sysfs(&dir.join("virtual_size"), parse_virtual_size)?
      }
    };

    let min_stride = width as usize * layout.bytes_per_pixel();
    let stride = std::fs::read_to_string(dir.join("stride"))
      .ok()
      .and_then(|s| s.trim().parse::<usize>().ok())
      .filter(|&stride| stride >= min_stride)
      .unwrap_or(min_stride);

    Ok(Self {
      width,
      height,
      stride,
      layout,
    })
  }
}

/// `/dev/fbN` 显示
///
/// 每一帧先缩放到可见区域大小，再转换编码，从偏移 0 按行跨度写入可见的 `height` 行。
pub struct FramebufferOutput {
  device: File,
  screen: ScreenInfo,
  scratch: Vec<u8>,
}

impl FromUrlWithScheme for FramebufferOutput {
  const SCHEME: &'static str = "fb";
}

impl FromUrl for FramebufferOutput {
  type Error = FramebufferError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(FramebufferError::SchemaMismatch);
    }

    let device = if url.path().is_empty() || url.path() == "/" {
      DEFAULT_DEVICE
    } else {
      url.path()
    };
    Self::open(device)
  }
}

impl FramebufferOutput {
  pub fn open(device_path: impl AsRef<Path>) -> Result<Self, FramebufferError> {
    let device_path = device_path.as_ref();
    let name = device_path
      .file_name()
      .and_then(|name| name.to_str())
      .unwrap_or("fb0");
    let screen = ScreenInfo::from_sysfs(&Path::new(SYSFS_GRAPHICS).join(name))?;
    info!(
      "帧缓冲 {}: {}x{}, 行跨度 {} 字节, {:?}",
      device_path.display(),
      screen.width,
      screen.height,
      screen.stride,
      screen.layout
    );

    let device = OpenOptions::new().write(true).open(device_path)?;
    Ok(Self::with_device(device, screen))
  }

  /// 用已打开的设备（或普通文件）和已知的屏幕参数创建
  pub fn with_device(device: File, screen: ScreenInfo) -> Self {
    Self {
      device,
      screen,
      scratch: Vec::new(),
    }
  }

  pub fn screen(&self) -> ScreenInfo {
    self.screen
  }

  fn write_frame(&mut self, frame: &Frame) -> Result<(), FramebufferError> {
    let ScreenInfo {
      width,
      height,
      stride,
      layout,
    } = self.screen;

    if (frame.width(), frame.height()) == (width, height) {
      layout.encode(frame.as_bytes(), &mut self.scratch);
    } else {
      let resized = imageops::resize(&frame.as_image()?, width, height, FilterType::Triangle);
      layout.encode(resized.as_raw(), &mut self.scratch);
    }

    // 行尾有填充时逐行展开
    let row = width as usize * layout.bytes_per_pixel();
    if stride > row {
      let mut padded = vec![0u8; stride * height as usize];
      for (dst, src) in padded.chunks_exact_mut(stride).zip(self.scratch.chunks_exact(row)) {
        dst[..row].copy_from_slice(src);
      }
      self.scratch = padded;
    }

    self.device.seek(SeekFrom::Start(0))?;
    self.device.write_all(&self.scratch)?;
    debug!("写入帧缓冲 {} 字节", self.scratch.len());
    Ok(())
  }
}

impl Display for FramebufferOutput {
  fn show(&mut self, frame: &Frame) -> Result<(), DisplayError> {
    Ok(self.write_frame(frame)?)
  }
}

fn read_sysfs<T>(
  path: &Path,
  parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, FramebufferError> {
  let content = std::fs::read_to_string(path)?;
  parse(&content).ok_or_else(|| FramebufferError::InvalidSysfs {
    path: path.to_path_buf(),
    content,
  })
}

/// 显示模式形如 `U:800x480p-0`，取其中的宽高
pub fn parse_mode(line: &str) -> Option<(u32, u32)> {
  let line = line.trim();
  let mode = line.split_once(':').map_or(line, |(_, mode)| mode);
  let (width, rest) = mode.split_once('x')?;
  let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
  let width = width.parse::<u32>().ok()?;
  let height = rest[..digits].parse::<u32>().ok()?;
  (width > 0 && height > 0).then_some((width, height))
}

/// `virtual_size` 的内容形如 `1920,1080`
pub fn parse_virtual_size(content: &str) -> Option<(u32, u32)> {
  let (width, height) = content.trim().split_once(',')?;
  let width = width.trim().parse::<u32>().ok()?;
  let height = height.trim().parse::<u32>().ok()?;
  (width > 0 && height > 0).then_some((width, height))
}
