// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 视频/图像采集
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

use crate::{
  FromUrl,
  frame::{Frame, FrameError},
};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[derive(Error, Debug)]
pub enum CaptureError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFile(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L 输入错误: {0}")]
  V4l(#[from] V4lInputError),
  #[error("不支持的输入方案: {0}")]
  SchemeMismatch(String),
  #[error("帧格式错误: {0}")]
  Frame(#[from] FrameError),
  /// 输入源没有更多帧，流水线按正常结束处理
  #[error("输入结束")]
  Exhausted,
}

/// 采集设备：每次调用给出一帧 BGR 图像
pub trait Capture: Send {
  fn grab(&mut self) -> Result<Frame, CaptureError>;
}

impl<C: Capture + ?Sized> Capture for Box<C> {
  fn grab(&mut self) -> Result<Frame, CaptureError> {
    (**self).grab()
  }
}

/// 按 URL 方案选择的采集设备
pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput),
}

impl FromUrl for InputWrapper {
  type Error = CaptureError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        return Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lInput::SCHEME {
        return Ok(InputWrapper::V4l(V4lInput::from_url(url)?));
      }
    }
    Err(CaptureError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl Capture for InputWrapper {
  fn grab(&mut self) -> Result<Frame, CaptureError> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.grab(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.grab(),
      #[allow(unreachable_patterns)]
      _ => Err(CaptureError::Exhausted),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(CaptureError::SchemeMismatch(scheme)) if scheme == "rtsp"
    ));
  }
}
