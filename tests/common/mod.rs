// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/common/mod.rs - 集成测试用的模拟设备
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

#![allow(dead_code)]

use std::{
  io::Write,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use shanan_stream::{
  accelerator::{Accelerator, AcceleratorInitError, AcceleratorRunError},
  frame::{Frame, FrameError},
  input::{Capture, CaptureError},
  model::stride_count,
  output::{Display, DisplayError},
  pipeline::PipelineConfig,
  tensor::{ElementFormat, QuantizationSpec, TensorDesc},
};

/// 模型输入边长：32x32 → 21 个候选
pub const MODEL_SIZE: u32 = 32;
/// 唯一一个检测所在的候选行
pub const DETECTION_ROW: usize = 3;

pub fn model_file() -> tempfile::NamedTempFile {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  file.write_all(b"mock").unwrap();
  file
}

pub fn config(model: &tempfile::NamedTempFile) -> PipelineConfig {
  PipelineConfig::default()
    .with_model_path(model.path())
    .with_input_size(MODEL_SIZE, MODEL_SIZE)
    .with_num_classes(1)
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(2));
  }
  condition()
}

/// 测试从外部观察加速器
#[derive(Debug, Default)]
pub struct Probe {
  pub runs: AtomicU64,
  pub completed: AtomicU64,
  pub in_execute: AtomicBool,
  pub destroyed: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MockFlags {
  pub execute_delay: Duration,
  /// 第 n 次（从 1 开始）执行返回错误
  pub fail_at_run: Option<u64>,
  pub probe: Arc<Probe>,
}

/// 固定输出一个检测框：中心 (16, 16)，边长 8，类别 0，置信度 0.9
pub struct MockAccelerator {
  inputs: Vec<Arc<TensorDesc>>,
  outputs: Vec<Arc<TensorDesc>>,
  input: Vec<u8>,
  output: Vec<u8>,
  flags: MockFlags,
}

impl Accelerator for MockAccelerator {
  const SCHEME: &'static str = "mock";
  type Flags = MockFlags;

  fn create(
    _model: &[u8],
    _workspace_size: usize,
    flags: &MockFlags,
  ) -> Result<Self, AcceleratorInitError> {
    let stride = stride_count(MODEL_SIZE, MODEL_SIZE);
    let input = Arc::new(TensorDesc::new(
      ElementFormat::UInt8,
      vec![1, 3, MODEL_SIZE as usize, MODEL_SIZE as usize],
      QuantizationSpec::None,
    ));
    let output = Arc::new(TensorDesc::new(
      ElementFormat::Fp32,
      vec![1, 5, stride],
      QuantizationSpec::None,
    ));

    let mut values = vec![0.0f32; 5 * stride];
    for (column, value) in [16.0, 16.0, 8.0, 8.0, 0.9].into_iter().enumerate() {
      values[column * stride + DETECTION_ROW] = value;
    }
    let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    Ok(Self {
      input: vec![0; input.byte_len()],
      inputs: vec![input],
      outputs: vec![output],
      output: bytes,
      flags: flags.clone(),
    })
  }

  fn input_descs(&self) -> &[Arc<TensorDesc>] {
    &self.inputs
  }

  fn output_descs(&self) -> &[Arc<TensorDesc>] {
    &self.outputs
  }

  fn map_input(&mut self, index: usize) -> Result<&mut [u8], AcceleratorRunError> {
    match index {
      0 => Ok(&mut self.input),
      _ => Err(AcceleratorRunError::InvalidInput(index)),
    }
  }

  fn submit(&mut self) -> Result<(), AcceleratorRunError> {
    Ok(())
  }

  fn execute(&mut self) -> Result<(), AcceleratorRunError> {
    let probe = &self.flags.probe;
    let run = probe.runs.fetch_add(1, Ordering::SeqCst) + 1;
    probe.in_execute.store(true, Ordering::SeqCst);
    thread::sleep(self.flags.execute_delay);
    probe.in_execute.store(false, Ordering::SeqCst);

    if self.flags.fail_at_run == Some(run) {
      return Err(AcceleratorRunError::Execute(format!("第 {} 次执行失败", run)));
    }
    probe.completed.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn map_output(&self, index: usize) -> Result<&[u8], AcceleratorRunError> {
    match index {
      0 => Ok(&self.output),
      _ => Err(AcceleratorRunError::InvalidOutput(index)),
    }
  }

  fn destroy(&mut self) {
    self.flags.probe.destroyed.fetch_add(1, Ordering::SeqCst);
  }
}

/// 产生纯色帧的采集设备
pub struct MockCapture {
  pub width: u32,
  pub height: u32,
  pub interval: Duration,
  /// 产生这么多帧后报告输入结束
  pub limit: Option<u64>,
  /// 第 n 次（从 1 开始）采集返回空帧错误
  pub fail_at: Option<u64>,
  pub grabbed: Arc<AtomicU64>,
  pub token: Arc<()>,
}

impl MockCapture {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      interval: Duration::from_millis(2),
      limit: None,
      fail_at: None,
      grabbed: Arc::new(AtomicU64::new(0)),
      token: Arc::new(()),
    }
  }
}

impl Capture for MockCapture {
  fn grab(&mut self) -> Result<Frame, CaptureError> {
    thread::sleep(self.interval);
    let count = self.grabbed.fetch_add(1, Ordering::SeqCst) + 1;
    if self.fail_at == Some(count) {
      return Err(CaptureError::Frame(FrameError::Empty));
    }
    if self.limit.is_some_and(|limit| count > limit) {
      return Err(CaptureError::Exhausted);
    }
    Ok(Frame::filled(self.width, self.height, [40, 40, 40])?)
  }
}

/// 记录最后一帧的显示设备
#[derive(Clone, Default)]
pub struct RecordingDisplay {
  pub last: Arc<Mutex<Option<Frame>>>,
  pub shown: Arc<AtomicU64>,
  pub token: Arc<()>,
}

impl Display for RecordingDisplay {
  fn show(&mut self, frame: &Frame) -> Result<(), DisplayError> {
    *self.last.lock().unwrap() = Some(frame.clone());
    self.shown.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
