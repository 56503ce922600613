// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 检测头解码与模型
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

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;
use tracing::{debug, error, info};

use super::{
  BoundingBox, DetectResult, Detection, GreedyNms, Letterbox, LetterboxError, LetterboxedFrame,
  Model, Suppressor,
};
use crate::{
  accelerator::{Accelerator, AcceleratorInitError, AcceleratorRunError, InferenceAccessor},
  frame::{BGR_CHANNELS, ChannelOrder, Frame, FrameError},
  pipeline::PipelineConfig,
  tensor::{DecodeError, DecodedTensor, ElementFormat, RawTensorBuffer, TensorDecoder},
};

/// 三个检测头的下采样倍数
pub const FEATURE_STRIDES: [u32; 3] = [8, 16, 32];

/// 每行前 4 列是框，其余是类别分数
const BOX_COLUMNS: usize = 4;

/// 候选框数量：各检测头特征图大小之和
pub fn stride_count(input_width: u32, input_height: u32) -> usize {
  FEATURE_STRIDES
    .iter()
    .map(|s| (input_width / s) as usize * (input_height / s) as usize)
    .sum()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
  #[error("输出张量元素数 {actual} 与期望 {expected}（{rows} x {stride}）不一致")]
  ShapeMismatch {
    expected: usize,
    actual: usize,
    rows: usize,
    stride: usize,
  },
}

/// 把 `(4 + 类别数) × stride` 的输出张量解码成检测框
///
/// 逐列（每个候选）读取，相当于先转置成 `stride × (4 + 类别数)` 再逐行处理。
/// 候选交给 [`Suppressor`] 做 NMS，输出顺序即 NMS 的保留顺序。
#[derive(Debug, Clone)]
pub struct DetectionDecoder<S = GreedyNms> {
  stride: usize,
  num_classes: usize,
  score_threshold: f32,
  iou_threshold: f32,
  suppressor: S,
}

impl DetectionDecoder<GreedyNms> {
  pub fn new(input_width: u32, input_height: u32, num_classes: usize) -> Self {
    Self {
      stride: stride_count(input_width, input_height),
      num_classes,
      score_threshold: 0.25,
      iou_threshold: 0.45,
      suppressor: GreedyNms::default(),
    }
  }
}

impl<S: Suppressor> DetectionDecoder<S> {
  pub fn with_suppressor<T: Suppressor>(self, suppressor: T) -> DetectionDecoder<T> {
    DetectionDecoder {
      stride: self.stride,
      num_classes: self.num_classes,
      score_threshold: self.score_threshold,
      iou_threshold: self.iou_threshold,
      suppressor,
    }
  }

  pub fn with_score_threshold(mut self, threshold: f32) -> Self {
    self.score_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn rows(&self) -> usize {
    BOX_COLUMNS + self.num_classes
  }

  /// 输出张量应有的元素数
  pub fn expected_len(&self) -> usize {
    self.rows() * self.stride
  }

  /// 阈值过滤后的候选，按候选下标顺序
  pub fn candidates(&self, tensor: &DecodedTensor) -> Result<Vec<Detection>, DetectionError> {
    let values = tensor.values();
    if values.len() != self.expected_len() {
      return Err(DetectionError::ShapeMismatch {
        expected: self.expected_len(),
        actual: values.len(),
        rows: self.rows(),
        stride: self.stride,
      });
    }

    let stride = self.stride;
    let at = |column: usize, row: usize| values[column * stride + row];

    let mut candidates = Vec::new();
    for i in 0..stride {
      let mut confidence = f32::MIN;
      let mut class_id = 0usize;
      for c in 0..self.num_classes {
        let score = at(BOX_COLUMNS + c, i);
        if score > confidence {
          confidence = score;
          class_id = c;
        }
      }

      if confidence > self.score_threshold {
        candidates.push(Detection {
          class_id,
          confidence,
          bbox: BoundingBox::from_center(at(0, i), at(1, i), at(2, i), at(3, i)),
        });
      }
    }
    Ok(candidates)
  }

  /// 候选 + NMS
  pub fn decode(&self, tensor: &DecodedTensor) -> Result<Vec<Detection>, DetectionError> {
    let candidates = self.candidates(tensor)?;
    let boxes: Vec<BoundingBox> = candidates.iter().map(|d| d.bbox).collect();
    let scores: Vec<f32> = candidates.iter().map(|d| d.confidence).collect();

    let kept = self
      .suppressor
      .suppress(&boxes, &scores, self.score_threshold, self.iou_threshold);
    debug!("候选 {} 个，NMS 后保留 {} 个", candidates.len(), kept.len());

    Ok(
      kept
        .into_iter()
        .filter_map(|index| candidates.get(index).cloned())
        .collect(),
    )
  }
}

#[derive(Error, Debug)]
pub enum Yolov8Error {
  #[error("模型初始化失败: {0}")]
  Init(#[from] AcceleratorInitError),
  #[error("模型与配置不匹配: {0}")]
  ModelMismatch(String),
  #[error("预处理失败: {0}")]
  Letterbox(#[from] LetterboxError),
  #[error("推理失败: {0}")]
  Run(#[from] AcceleratorRunError),
  #[error("模型没有输出")]
  NoOutput,
  #[error("张量解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("检测解码失败: {0}")]
  Detection(#[from] DetectionError),
}

/// 推理阶段交给后处理阶段的原始输出
#[derive(Debug, Clone)]
pub struct RawDetections {
  pub output: RawTensorBuffer,
  pub letterbox: Letterbox,
}

/// YOLOv8 检测模型：letterbox 预处理、单输入推理、单输出检测头解码
pub struct Yolov8<A: Accelerator> {
  accessor: Arc<InferenceAccessor<A>>,
  decoder: DetectionDecoder,
  model_path: PathBuf,
  workspace_size: usize,
  input_width: u32,
  input_height: u32,
  channel_order: ChannelOrder,
  pad_value: u8,
}

impl<A: Accelerator> Yolov8<A> {
  pub fn new(accessor: Arc<InferenceAccessor<A>>, config: &PipelineConfig) -> Self {
    let decoder = DetectionDecoder::new(config.input_width, config.input_height, config.num_classes)
      .with_suppressor(GreedyNms { eta: config.nms_eta })
      .with_score_threshold(config.score_threshold)
      .with_iou_threshold(config.iou_threshold);

    Self {
      accessor,
      decoder,
      model_path: config.model_path.clone(),
      workspace_size: config.workspace_size,
      input_width: config.input_width,
      input_height: config.input_height,
      channel_order: config.channel_order,
      pad_value: config.pad_value,
    }
  }

  pub fn accessor(&self) -> &Arc<InferenceAccessor<A>> {
    &self.accessor
  }

  pub fn decoder(&self) -> &DetectionDecoder {
    &self.decoder
  }

  /// 创建加速器并检查输入输出与配置一致，可重复调用
  pub fn initialize(&self) -> Result<(), Yolov8Error> {
    self.accessor.initialize(&self.model_path, self.workspace_size)?;

    let inputs = self.accessor.input_descs()?;
    let input = inputs
      .first()
      .ok_or_else(|| Yolov8Error::ModelMismatch("模型没有输入".to_string()))?;
    let expected_input = BGR_CHANNELS * self.input_width as usize * self.input_height as usize;
    if input.element_count() != expected_input {
      error!(
        "模型输入元素数 {} 与 {}x{}x3 不一致",
        input.element_count(),
        self.input_width,
        self.input_height
      );
      return Err(Yolov8Error::ModelMismatch(format!(
        "输入元素数 {}，期望 {}",
        input.element_count(),
        expected_input
      )));
    }

    let outputs = self.accessor.output_descs()?;
    let output = outputs.first().ok_or(Yolov8Error::NoOutput)?;
    if output.element_count() != self.decoder.expected_len() {
      error!(
        "模型输出元素数 {} 与 {} x {} 不一致",
        output.element_count(),
        self.decoder.rows(),
        self.decoder.stride()
      );
      return Err(Yolov8Error::ModelMismatch(format!(
        "输出元素数 {}，期望 {}",
        output.element_count(),
        self.decoder.expected_len()
      )));
    }

    info!(
      "YOLOv8 模型就绪: 输入 {}x{}, {} 个类别, {} 个候选",
      self.input_width,
      self.input_height,
      self.decoder.num_classes(),
      self.decoder.stride()
    );
    Ok(())
  }

  /// 推理回调：把 letterbox 后的帧写进输入槽 0
  fn fill_input(
    &self,
    frame: &Frame,
    index: usize,
    buffer: &mut [u8],
    format: ElementFormat,
  ) -> Result<(), AcceleratorRunError> {
    if index != 0 {
      return Err(AcceleratorRunError::InvalidInput(index));
    }
    frame
      .fill_planar(self.channel_order, format, buffer)
      .map_err(|e| match e {
        FrameError::Format(e) => AcceleratorRunError::Decode(e),
        other => AcceleratorRunError::InputFill(other.to_string()),
      })
  }
}

impl<A: Accelerator> Model for Yolov8<A> {
  type Input = Frame;
  type Prepared = LetterboxedFrame;
  type Raw = RawDetections;
  type Output = DetectResult;
  type Error = Yolov8Error;

  fn preprocess(&self, input: &Frame) -> Result<LetterboxedFrame, Yolov8Error> {
    let letterbox = Letterbox::compute(
      input.width(),
      input.height(),
      self.input_width,
      self.input_height,
    )?;
    let frame = letterbox.apply(input, self.pad_value)?;
    Ok(LetterboxedFrame { frame, letterbox })
  }

  fn infer(&self, input: &LetterboxedFrame) -> Result<RawDetections, Yolov8Error> {
    let outputs = self
      .accessor
      .run(|index, buffer, format| self.fill_input(&input.frame, index, buffer, format))?;
    let output = outputs.into_iter().next().ok_or(Yolov8Error::NoOutput)?;
    Ok(RawDetections {
      output,
      letterbox: input.letterbox,
    })
  }

  fn postprocess(&self, raw: RawDetections) -> Result<DetectResult, Yolov8Error> {
    let tensor = TensorDecoder.decode(&raw.output)?;
    let items = self.decoder.decode(&tensor)?;
    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult {
      items: items.into_boxed_slice(),
      letterbox: raw.letterbox,
    })
  }
}
