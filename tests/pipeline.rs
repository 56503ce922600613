// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 流水线调度测试
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

mod common;

use std::{
  sync::{Arc, atomic::Ordering},
  thread,
  time::{Duration, Instant},
};

use common::{
  MockAccelerator, MockCapture, MockFlags, Probe, RecordingDisplay, config, model_file,
  wait_until,
};
use shanan_stream::{
  accelerator::{AcceleratorRunError, InferenceAccessor},
  channel::{BoundedChannel, PushPolicy},
  frame::Frame,
  input::CaptureError,
  model::Yolov8Error,
  output::draw::Overlay,
  pipeline::{PipelineError, PipelineScheduler, PipelineState, Stage, StageError},
};

fn accessor(flags: MockFlags) -> Arc<InferenceAccessor<MockAccelerator>> {
  Arc::new(InferenceAccessor::new(flags))
}

#[test]
fn drop_if_full_keeps_the_first_frame() {
  let frames = BoundedChannel::<Frame>::new(1);
  let a = Frame::filled(2, 2, [1, 1, 1]).unwrap();
  let b = Frame::filled(2, 2, [2, 2, 2]).unwrap();

  assert!(frames.push(a.clone(), PushPolicy::DropIfFull));
  assert!(!frames.push(b, PushPolicy::DropIfFull));

  let consumer = {
    let frames = frames.clone();
    thread::spawn(move || {
      let mut seen = Vec::new();
      while let Some(frame) = frames.try_pop() {
        seen.push(frame);
      }
      seen
    })
  };
  let seen = consumer.join().unwrap();
  assert_eq!(seen, vec![a]);
  assert!(frames.is_empty());
}

#[test]
fn detections_are_overlaid_on_the_display() {
  let model = model_file();
  let probe = Arc::new(Probe::default());
  let flags = MockFlags {
    probe: probe.clone(),
    ..Default::default()
  };
  let display = RecordingDisplay::default();

  let mut scheduler = PipelineScheduler::new(
    &config(&model),
    accessor(flags),
    MockCapture::new(64, 64),
    display.clone(),
  );
  assert_eq!(scheduler.state(), PipelineState::Created);
  scheduler.start().unwrap();
  assert_eq!(scheduler.state(), PipelineState::Running);

  // 64x64 的帧缩放到 32x32，检测框 (12, 12, 8, 8) 映射回帧坐标 (24, 24) - (40, 40)
  let color = Overlay::color(0);
  let drawn = wait_until(Duration::from_secs(5), || {
    display
      .last
      .lock()
      .unwrap()
      .as_ref()
      .is_some_and(|frame| frame.pixel(24, 24) == Some(color) && frame.pixel(40, 40) == Some(color))
  });
  assert!(drawn, "检测框没有出现在显示帧上");

  scheduler.stop().unwrap();
  assert_eq!(scheduler.state(), PipelineState::Stopped);

  let stats = scheduler.stats();
  assert!(stats.inferences >= 1);
  assert!(stats.detections >= 1);
  assert!(stats.submitted >= stats.inferences);
  assert!(stats.captured >= stats.displayed);
  assert!(stats.captured >= stats.submitted + stats.dropped_frames);
  assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);

  // 再次停止什么也不做
  scheduler.stop().unwrap();
  assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_waits_for_inflight_inference_and_joins_every_stage() {
  let model = model_file();
  let probe = Arc::new(Probe::default());
  let flags = MockFlags {
    execute_delay: Duration::from_millis(300),
    probe: probe.clone(),
    ..Default::default()
  };
  let capture = MockCapture::new(32, 32);
  let capture_token = capture.token.clone();
  let display = RecordingDisplay::default();
  let display_token = display.token.clone();

  let mut scheduler = PipelineScheduler::new(&config(&model), accessor(flags), capture, display);
  scheduler.start().unwrap();

  assert!(wait_until(Duration::from_secs(5), || probe
    .in_execute
    .load(Ordering::SeqCst)));

  let started = Instant::now();
  scheduler.stop().unwrap();
  let elapsed = started.elapsed();

  assert!(elapsed < Duration::from_secs(5), "stop 用时 {:?}", elapsed);
  assert_eq!(scheduler.state(), PipelineState::Stopped);
  // 进行中的推理先完成，然后才释放硬件
  assert!(!probe.in_execute.load(Ordering::SeqCst));
  assert_eq!(
    probe.runs.load(Ordering::SeqCst),
    probe.completed.load(Ordering::SeqCst)
  );
  assert_eq!(probe.destroyed.load(Ordering::SeqCst), 1);
  // 采集线程已经退出并释放了设备
  assert_eq!(Arc::strong_count(&capture_token), 1);
  assert_eq!(Arc::strong_count(&display_token), 1);
}

#[test]
fn inference_error_stops_the_pipeline() {
  let model = model_file();
  let probe = Arc::new(Probe::default());
  let flags = MockFlags {
    fail_at_run: Some(2),
    probe: probe.clone(),
    ..Default::default()
  };

  let mut scheduler = PipelineScheduler::new(
    &config(&model),
    accessor(flags),
    MockCapture::new(48, 32),
    RecordingDisplay::default(),
  );
  let handle = scheduler.stop_handle();
  scheduler.start().unwrap();

  assert!(handle.wait_timeout(Duration::from_secs(5)), "流水线没有自行停止");
  let err = scheduler.stop().unwrap_err();
  assert_eq!(err.stage(), Some(Stage::Inference));
  assert!(matches!(
    err,
    PipelineError::Stage {
      source: StageError::Model(Yolov8Error::Run(AcceleratorRunError::Execute(_))),
      ..
    }
  ));
  assert_eq!(probe.completed.load(Ordering::SeqCst), 1);
}

#[test]
fn capture_error_stops_the_pipeline() {
  let model = model_file();
  let mut capture = MockCapture::new(32, 32);
  capture.fail_at = Some(5);

  let mut scheduler = PipelineScheduler::new(
    &config(&model),
    accessor(MockFlags::default()),
    capture,
    RecordingDisplay::default(),
  );
  let handle = scheduler.stop_handle();
  scheduler.start().unwrap();

  assert!(handle.wait_timeout(Duration::from_secs(5)));
  let err = scheduler.stop().unwrap_err();
  assert_eq!(err.stage(), Some(Stage::Capture));
  assert!(matches!(
    err,
    PipelineError::Stage {
      source: StageError::Capture(CaptureError::Frame(_)),
      ..
    }
  ));
}

#[test]
fn exhausted_input_is_a_clean_stop() {
  let model = model_file();
  let mut capture = MockCapture::new(32, 32);
  capture.limit = Some(3);
  let display = RecordingDisplay::default();

  let mut scheduler = PipelineScheduler::new(
    &config(&model),
    accessor(MockFlags::default()),
    capture,
    display.clone(),
  );
  let handle = scheduler.stop_handle();
  scheduler.start().unwrap();

  assert!(handle.wait_timeout(Duration::from_secs(5)));
  scheduler.stop().unwrap();
  assert_eq!(display.shown.load(Ordering::SeqCst), 3);
  assert_eq!(scheduler.stats().captured, 3);
}

#[test]
fn start_fails_when_the_model_does_not_match() {
  let model = model_file();
  // 模拟模型只有 1 个类别，配置成 80 类时输出长度对不上
  let config = config(&model).with_num_classes(80);
  let mut scheduler = PipelineScheduler::new(
    &config,
    accessor(MockFlags::default()),
    MockCapture::new(32, 32),
    RecordingDisplay::default(),
  );

  assert!(matches!(
    scheduler.start(),
    Err(PipelineError::Init(Yolov8Error::ModelMismatch(_)))
  ));
  assert_eq!(scheduler.state(), PipelineState::Created);
  scheduler.stop().unwrap();
  assert_eq!(scheduler.state(), PipelineState::Stopped);
  assert!(matches!(
    scheduler.start(),
    Err(PipelineError::InvalidState(PipelineState::Stopped))
  ));
}
