// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

/// 检测模型的三个步骤，流水线的预处理、推理、后处理阶段各调用一个
pub trait Model {
  type Input;
  type Prepared;
  type Raw;
  type Output;
  type Error;

  fn preprocess(&self, input: &Self::Input) -> Result<Self::Prepared, Self::Error>;
  fn infer(&self, input: &Self::Prepared) -> Result<Self::Raw, Self::Error>;
  fn postprocess(&self, raw: Self::Raw) -> Result<Self::Output, Self::Error>;

  /// 单线程地依次执行三个步骤
  fn detect(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let prepared = self.preprocess(input)?;
    let raw = self.infer(&prepared)?;
    self.postprocess(raw)
  }
}

/// 左上角 + 宽高形式的边界框
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl BoundingBox {
  /// 中心形式 → 左上角形式
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self {
      x: cx - 0.5 * w,
      y: cy - 0.5 * h,
      w,
      h,
    }
  }

  pub fn area(&self) -> f32 {
    self.w * self.h
  }

  /// 计算两个边界框的 IoU
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = (self.x + self.w).min(other.x + other.w);
    let y2 = (self.y + self.h).min(other.y + other.h);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 检测结果，坐标为模型输入像素
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_id: usize,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

/// 一次推理的全部检测，附带映射回原始帧所需的几何参数
#[derive(Debug, Clone)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
  pub letterbox: Letterbox,
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 类别名称表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
  names: Vec<String>,
}

impl Default for Labels {
  fn default() -> Self {
    Self::coco()
  }
}

impl Labels {
  pub fn coco() -> Self {
    Self {
      names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
    }
  }

  /// 每行一个类别，忽略空行
  pub fn parse(text: &str) -> Self {
    Self {
      names: text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect(),
    }
  }

  pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
    let labels = Self::parse(&std::fs::read_to_string(path)?);
    if labels.is_empty() {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "类别文件为空",
      ));
    }
    Ok(labels)
  }

  pub fn name(&self, class_id: usize) -> &str {
    self
      .names
      .get(class_id)
      .map(String::as_str)
      .unwrap_or("unknown")
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

mod letterbox;
mod nms;
mod yolov8;

pub use self::letterbox::{DEFAULT_PAD_VALUE, Letterbox, LetterboxError, LetterboxedFrame};
pub use self::nms::{DEFAULT_NMS_ETA, GreedyNms, Suppressor};
pub use self::yolov8::{
  DetectionDecoder, DetectionError, FEATURE_STRIDES, RawDetections, Yolov8, Yolov8Error,
  stride_count,
};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_of_overlapping_boxes() {
    let a = BoundingBox {
      x: 0.0,
      y: 0.0,
      w: 10.0,
      h: 10.0,
    };
    let b = BoundingBox {
      x: 5.0,
      y: 0.0,
      w: 10.0,
      h: 10.0,
    };
    assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    assert_eq!(a.iou(&a), 1.0);
    assert_eq!(a.iou(&BoundingBox::default()), 0.0);
  }

  #[test]
  fn center_form_conversion() {
    let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
    assert_eq!((b.x, b.y, b.w, b.h), (40.0, 35.0, 20.0, 10.0));
  }

  #[test]
  fn labels_from_text() {
    let labels = Labels::parse("cat\n\n  dog  \r\nbird\n");
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.name(1), "dog");
    assert_eq!(labels.name(7), "unknown");
    assert_eq!(Labels::default().len(), 80);
    assert_eq!(Labels::coco().name(0), "person");
  }

  #[test]
  fn empty_label_file_is_rejected() {
    let file = tempfile::NamedTempFile::new().unwrap();
    assert!(Labels::from_file(file.path()).is_err());
  }
}
