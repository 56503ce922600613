// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 显示输出
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

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl,
  frame::{Frame, FrameError},
};

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "framebuffer_output")]
mod framebuffer;
#[cfg(feature = "framebuffer_output")]
pub use self::framebuffer::{FramebufferError, FramebufferOutput, PixelLayout, ScreenInfo};

#[derive(Error, Debug)]
pub enum DisplayError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFile(#[from] SaveImageFileError),
  #[cfg(feature = "framebuffer_output")]
  #[error("帧缓冲输出错误: {0}")]
  Framebuffer(#[from] FramebufferError),
  #[error("不支持的输出方案: {0}")]
  SchemeMismatch(String),
  #[error("帧格式错误: {0}")]
  Frame(#[from] FrameError),
}

/// 显示设备：接收叠加好检测框的 BGR 帧
pub trait Display: Send {
  fn show(&mut self, frame: &Frame) -> Result<(), DisplayError>;
}

impl<D: Display + ?Sized> Display for Box<D> {
  fn show(&mut self, frame: &Frame) -> Result<(), DisplayError> {
    (**self).show(frame)
  }
}

/// 按 URL 方案选择的显示设备
pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFile(SaveImageFileOutput),
  #[cfg(feature = "framebuffer_output")]
  Framebuffer(FramebufferOutput),
}

impl FromUrl for OutputWrapper {
  type Error = DisplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "save_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == SaveImageFileOutput::SCHEME {
        return Ok(OutputWrapper::SaveImageFile(SaveImageFileOutput::from_url(
          url,
        )?));
      }
    }
    #[cfg(feature = "framebuffer_output")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == FramebufferOutput::SCHEME {
        return Ok(OutputWrapper::Framebuffer(FramebufferOutput::from_url(url)?));
      }
    }
    Err(DisplayError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl Display for OutputWrapper {
  fn show(&mut self, frame: &Frame) -> Result<(), DisplayError> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFile(output) => output.show(frame),
      #[cfg(feature = "framebuffer_output")]
      OutputWrapper::Framebuffer(output) => output.show(frame),
      #[allow(unreachable_patterns)]
      _ => Err(DisplayError::SchemeMismatch("none".to_string())),
    }
  }
}
