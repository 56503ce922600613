// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 四阶段检测流水线
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

//! 采集、预处理、推理、后处理四个阶段各占一个线程，
//! 相邻阶段之间是容量为 1 的 [`BoundedChannel`]，检测结果再回到采集线程叠加显示。
//!
//! 采集和后处理入队时队列满就丢弃，保证每个阶段处理的都是最新的数据；
//! 预处理和推理入队时阻塞等待。任一阶段出错都会让整条流水线停止，
//! 第一个错误由 [`PipelineScheduler::stop`] 返回。

use std::{
  fmt,
  panic::{self, AssertUnwindSafe},
  path::PathBuf,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{
  accelerator::{Accelerator, DEFAULT_WORKSPACE_SIZE, InferenceAccessor},
  channel::{BoundedChannel, PushPolicy, Shutdown},
  frame::{ChannelOrder, Frame},
  input::{Capture, CaptureError},
  model::{
    COCO_CLASSES, DEFAULT_NMS_ETA, DEFAULT_PAD_VALUE, DetectResult, LetterboxedFrame, Model,
    RawDetections, Yolov8, Yolov8Error,
  },
  output::{
    Display, DisplayError,
    draw::{Overlay, OverlayError},
  },
};

/// 流水线与模型的配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  pub model_path: PathBuf,
  /// 加速器工作区字节数
  pub workspace_size: usize,
  pub input_width: u32,
  pub input_height: u32,
  pub num_classes: usize,
  pub score_threshold: f32,
  pub iou_threshold: f32,
  pub nms_eta: f32,
  pub channel_order: ChannelOrder,
  pub pad_value: u8,
  pub channel_capacity: usize,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      model_path: PathBuf::new(),
      workspace_size: DEFAULT_WORKSPACE_SIZE,
      input_width: 640,
      input_height: 640,
      num_classes: COCO_CLASSES.len(),
      score_threshold: 0.25,
      iou_threshold: 0.45,
      nms_eta: DEFAULT_NMS_ETA,
      channel_order: ChannelOrder::default(),
      pad_value: DEFAULT_PAD_VALUE,
      channel_capacity: 1,
    }
  }
}

impl PipelineConfig {
  pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.model_path = path.into();
    self
  }

  pub fn with_workspace_size(mut self, bytes: usize) -> Self {
    self.workspace_size = bytes;
    self
  }

  pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }

  pub fn with_num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes;
    self
  }

  pub fn with_score_threshold(mut self, threshold: f32) -> Self {
    self.score_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn with_nms_eta(mut self, eta: f32) -> Self {
    self.nms_eta = eta;
    self
  }

  pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
    self.channel_order = order;
    self
  }

  pub fn with_pad_value(mut self, value: u8) -> Self {
    self.pad_value = value;
    self
  }

  pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
    self.channel_capacity = capacity;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Created,
  Running,
  Stopping,
  Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
  Capture,
  Preprocess,
  Inference,
  Postprocess,
}

impl Stage {
  fn thread_name(self) -> &'static str {
    match self {
      Stage::Capture => "shanan-capture",
      Stage::Preprocess => "shanan-preprocess",
      Stage::Inference => "shanan-inference",
      Stage::Postprocess => "shanan-postprocess",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Capture => "采集",
      Stage::Preprocess => "预处理",
      Stage::Inference => "推理",
      Stage::Postprocess => "后处理",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum StageError {
  #[error("采集失败: {0}")]
  Capture(#[from] CaptureError),
  #[error("显示失败: {0}")]
  Display(#[from] DisplayError),
  #[error("绘制失败: {0}")]
  Overlay(#[from] OverlayError),
  #[error(transparent)]
  Model(#[from] Yolov8Error),
  #[error("阶段线程 panic")]
  Panicked,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("流水线初始化失败: {0}")]
  Init(#[from] Yolov8Error),
  #[error("{stage}阶段失败: {source}")]
  Stage {
    stage: Stage,
    #[source]
    source: StageError,
  },
  #[error("无法创建阶段线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("流水线状态 {0:?} 下不能执行该操作")]
  InvalidState(PipelineState),
}

impl PipelineError {
  /// 出错的阶段（只有阶段错误才有）
  pub fn stage(&self) -> Option<Stage> {
    match self {
      PipelineError::Stage { stage, .. } => Some(*stage),
      _ => None,
    }
  }
}

/// 运行计数
#[derive(Debug, Default)]
pub struct PipelineStats {
  captured: AtomicU64,
  submitted: AtomicU64,
  dropped_frames: AtomicU64,
  inferences: AtomicU64,
  detections: AtomicU64,
  dropped_detections: AtomicU64,
  displayed: AtomicU64,
}

/// [`PipelineStats`] 某一时刻的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
  /// 采集到的帧
  pub captured: u64,
  /// 交给预处理的帧
  pub submitted: u64,
  /// 预处理忙时丢弃的帧
  pub dropped_frames: u64,
  pub inferences: u64,
  /// 交给采集线程的检测结果
  pub detections: u64,
  /// 采集线程还没取走上一份时丢弃的检测结果
  pub dropped_detections: u64,
  pub displayed: u64,
}

impl PipelineStats {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      captured: self.captured.load(Ordering::Relaxed),
      submitted: self.submitted.load(Ordering::Relaxed),
      dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
      inferences: self.inferences.load(Ordering::Relaxed),
      detections: self.detections.load(Ordering::Relaxed),
      dropped_detections: self.dropped_detections.load(Ordering::Relaxed),
      displayed: self.displayed.load(Ordering::Relaxed),
    }
  }
}

/// 请求停止流水线的句柄，可以交给信号处理函数
///
/// `request_stop` 只清除运行标志并触发停止信号，不会阻塞。
#[derive(Debug, Clone)]
pub struct StopHandle {
  running: Arc<AtomicBool>,
  shutdown: Shutdown,
}

impl StopHandle {
  fn new() -> Self {
    Self {
      running: Arc::new(AtomicBool::new(false)),
      shutdown: Shutdown::new(),
    }
  }

  pub fn request_stop(&self) {
    self.running.store(false, Ordering::Release);
    if self.shutdown.trigger() {
      info!("请求停止流水线");
    }
  }

  pub fn is_stop_requested(&self) -> bool {
    self.shutdown.is_triggered()
  }

  /// 阻塞直到有人请求停止（信号、阶段出错或输入结束）
  pub fn wait(&self) {
    self.shutdown.wait();
  }

  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    self.shutdown.wait_timeout(timeout)
  }

  fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }
}

/// 每个阶段线程持有的共享状态
#[derive(Clone)]
struct StageContext {
  stop: StopHandle,
  stats: Arc<PipelineStats>,
  failure: Arc<Mutex<Option<PipelineError>>>,
}

impl StageContext {
  fn is_running(&self) -> bool {
    self.stop.is_running()
  }

  fn fail(&self, stage: Stage, source: StageError) {
    let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
    if failure.is_none() {
      *failure = Some(PipelineError::Stage { stage, source });
    }
  }
}

struct Channels {
  frames: BoundedChannel<Frame>,
  prepared: BoundedChannel<LetterboxedFrame>,
  raw: BoundedChannel<RawDetections>,
  detections: BoundedChannel<DetectResult>,
}

/// 流水线调度器：持有四个阶段线程和三条阶段间队列
pub struct PipelineScheduler<A: Accelerator + 'static> {
  model: Arc<Yolov8<A>>,
  capture: Option<Box<dyn Capture>>,
  display: Option<Box<dyn Display>>,
  overlay: Option<Overlay>,
  channel_capacity: usize,
  state: PipelineState,
  stop: StopHandle,
  stats: Arc<PipelineStats>,
  failure: Arc<Mutex<Option<PipelineError>>>,
  workers: Vec<(Stage, JoinHandle<()>)>,
}

impl<A: Accelerator + 'static> PipelineScheduler<A> {
  pub fn new<C, D>(
    config: &PipelineConfig,
    accessor: Arc<InferenceAccessor<A>>,
    capture: C,
    display: D,
  ) -> Self
  where
    C: Capture + 'static,
    D: Display + 'static,
  {
    Self {
      model: Arc::new(Yolov8::new(accessor, config)),
      capture: Some(Box::new(capture)),
      display: Some(Box::new(display)),
      overlay: Some(Overlay::default()),
      channel_capacity: config.channel_capacity.max(1),
      state: PipelineState::Created,
      stop: StopHandle::new(),
      stats: Arc::new(PipelineStats::default()),
      failure: Arc::new(Mutex::new(None)),
      workers: Vec::new(),
    }
  }

  pub fn with_overlay(mut self, overlay: Overlay) -> Self {
    self.overlay = Some(overlay);
    self
  }

  pub fn state(&self) -> PipelineState {
    self.state
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.clone()
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  pub fn model(&self) -> &Yolov8<A> {
    &self.model
  }

  /// 初始化加速器并启动四个阶段线程
  pub fn start(&mut self) -> Result<(), PipelineError> {
    if self.state != PipelineState::Created {
      return Err(PipelineError::InvalidState(self.state));
    }

    self.model.initialize()?;

    let (Some(capture), Some(display), Some(overlay)) =
      (self.capture.take(), self.display.take(), self.overlay.take())
    else {
      return Err(PipelineError::InvalidState(self.state));
    };

    let shutdown = &self.stop.shutdown;
    let channels = Channels {
      frames: BoundedChannel::with_shutdown(self.channel_capacity, shutdown),
      prepared: BoundedChannel::with_shutdown(self.channel_capacity, shutdown),
      raw: BoundedChannel::with_shutdown(self.channel_capacity, shutdown),
      detections: BoundedChannel::with_shutdown(self.channel_capacity, shutdown),
    };

    self.stop.running.store(true, Ordering::Release);
    self.state = PipelineState::Running;
    info!("流水线启动，队列容量 {}", self.channel_capacity);

    if let Err(e) = self.spawn_stages(channels, capture, display, overlay) {
      error!("阶段线程创建失败: {}", e);
      let _ = self.stop();
      return Err(e);
    }
    Ok(())
  }

  fn spawn_stages(
    &mut self,
    channels: Channels,
    capture: Box<dyn Capture>,
    display: Box<dyn Display>,
    overlay: Overlay,
  ) -> Result<(), PipelineError> {
    let Channels {
      frames,
      prepared,
      raw,
      detections,
    } = channels;

    {
      let frames = frames.clone();
      let detections = detections.clone();
      self.spawn_stage(Stage::Capture, move |ctx| {
        capture_loop(ctx, capture, display, overlay, &frames, &detections)
      })?;
    }
    {
      let model = Arc::clone(&self.model);
      let prepared = prepared.clone();
      self.spawn_stage(Stage::Preprocess, move |ctx| {
        preprocess_loop(ctx, model.as_ref(), &frames, &prepared)
      })?;
    }
    {
      let model = Arc::clone(&self.model);
      let raw = raw.clone();
      self.spawn_stage(Stage::Inference, move |ctx| {
        inference_loop(ctx, model.as_ref(), &prepared, &raw)
      })?;
    }
    {
      let model = Arc::clone(&self.model);
      self.spawn_stage(Stage::Postprocess, move |ctx| {
        postprocess_loop(ctx, model.as_ref(), &raw, &detections)
      })?;
    }
    Ok(())
  }

  fn spawn_stage<F>(&mut self, stage: Stage, body: F) -> Result<(), PipelineError>
  where
    F: FnOnce(&StageContext) -> Result<(), StageError> + Send + 'static,
  {
    let ctx = StageContext {
      stop: self.stop.clone(),
      stats: Arc::clone(&self.stats),
      failure: Arc::clone(&self.failure),
    };

    let handle = thread::Builder::new()
      .name(stage.thread_name().to_string())
      .spawn(move || {
        info!("{}阶段启动", stage);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)))
          .unwrap_or(Err(StageError::Panicked));
        match outcome {
          Ok(()) => info!("{}阶段退出", stage),
          Err(e) if ctx.is_running() => {
            error!("{}阶段出错: {}", stage, e);
            ctx.fail(stage, e);
          }
          Err(e) => debug!("{}阶段在停止过程中返回: {}", stage, e),
        }
        // 少了任何一个阶段流水线都无法继续
        ctx.stop.request_stop();
      })?;

    self.workers.push((stage, handle));
    Ok(())
  }

  /// 停止流水线：清除运行标志、释放加速器、等待所有阶段线程退出
  ///
  /// 可重复调用。返回运行期间第一个阶段错误。正在进行的推理会先完成，
  /// 之后阻塞在队列上的阶段被停止信号唤醒。
  pub fn stop(&mut self) -> Result<(), PipelineError> {
    match self.state {
      PipelineState::Stopped => return Ok(()),
      PipelineState::Created => {
        self.stop.request_stop();
        self.model.accessor().shutdown();
        self.state = PipelineState::Stopped;
        return Ok(());
      }
      PipelineState::Running | PipelineState::Stopping => {}
    }

    self.state = PipelineState::Stopping;
    self.stop.request_stop();
    self.model.accessor().shutdown();

    for (stage, worker) in self.workers.drain(..) {
      if worker.join().is_err() {
        warn!("{}阶段线程异常退出", stage);
      }
    }
    self.state = PipelineState::Stopped;

    let stats = self.stats.snapshot();
    info!(
      "流水线已停止: 采集 {} 帧, 送检 {} 帧, 丢弃 {} 帧, 推理 {} 次, 显示 {} 帧",
      stats.captured, stats.submitted, stats.dropped_frames, stats.inferences, stats.displayed
    );

    match self
      .failure
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

impl<A: Accelerator + 'static> Drop for PipelineScheduler<A> {
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      error!("流水线停止时报告错误: {}", e);
    }
  }
}

fn capture_loop(
  ctx: &StageContext,
  mut capture: Box<dyn Capture>,
  mut display: Box<dyn Display>,
  overlay: Overlay,
  frames: &BoundedChannel<Frame>,
  detections: &BoundedChannel<DetectResult>,
) -> Result<(), StageError> {
  let mut latest: Option<DetectResult> = None;
  let mut first = true;

  while ctx.is_running() {
    let mut frame = match capture.grab() {
      Ok(frame) => frame,
      Err(CaptureError::Exhausted) => {
        info!("输入结束");
        return Ok(());
      }
      Err(e) => return Err(e.into()),
    };
    PipelineStats::bump(&ctx.stats.captured);

    // 第一帧直接送检，之后每拿到一份检测结果再送下一帧
    let fresh = detections.try_pop();
    if first || fresh.is_some() {
      first = false;
      if let Some(result) = fresh {
        latest = Some(result);
      }
      if frames.push(frame.clone(), PushPolicy::DropIfFull) {
        PipelineStats::bump(&ctx.stats.submitted);
      } else if ctx.is_running() {
        PipelineStats::bump(&ctx.stats.dropped_frames);
        trace!("预处理忙，丢弃当前帧");
      }
    }

    if let Some(result) = &latest {
      overlay.draw(&mut frame, result)?;
    }
    display.show(&frame)?;
    PipelineStats::bump(&ctx.stats.displayed);
  }
  Ok(())
}

fn preprocess_loop<A: Accelerator>(
  ctx: &StageContext,
  model: &Yolov8<A>,
  frames: &BoundedChannel<Frame>,
  prepared: &BoundedChannel<LetterboxedFrame>,
) -> Result<(), StageError> {
  while ctx.is_running() {
    let Some(frame) = frames.pop() else {
      break;
    };
    let input = model.preprocess(&frame)?;
    debug!(
      "预处理完成: {}x{} → {}x{}",
      frame.width(),
      frame.height(),
      input.frame.width(),
      input.frame.height()
    );
    if !prepared.push(input, PushPolicy::BlockForever) {
      break;
    }
  }
  Ok(())
}

fn inference_loop<A: Accelerator>(
  ctx: &StageContext,
  model: &Yolov8<A>,
  prepared: &BoundedChannel<LetterboxedFrame>,
  raw: &BoundedChannel<RawDetections>,
) -> Result<(), StageError> {
  while ctx.is_running() {
    let Some(input) = prepared.pop() else {
      break;
    };
    let output = model.infer(&input)?;
    PipelineStats::bump(&ctx.stats.inferences);
    if !raw.push(output, PushPolicy::BlockForever) {
      break;
    }
  }
  Ok(())
}

fn postprocess_loop<A: Accelerator>(
  ctx: &StageContext,
  model: &Yolov8<A>,
  raw: &BoundedChannel<RawDetections>,
  detections: &BoundedChannel<DetectResult>,
) -> Result<(), StageError> {
  while ctx.is_running() {
    let Some(output) = raw.pop() else {
      break;
    };
    let result = model.postprocess(output)?;
    if detections.push(result, PushPolicy::DropIfFull) {
      PipelineStats::bump(&ctx.stats.detections);
    } else if ctx.is_running() {
      PipelineStats::bump(&ctx.stats.dropped_detections);
      trace!("上一份检测结果还没被取走，丢弃本次结果");
    }
  }
  Ok(())
}
