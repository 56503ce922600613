// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 运行任务
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{
  accelerator::{Accelerator, InferenceAccessor},
  input::{Capture, CaptureError},
  model::{Model, Yolov8},
  output::{Display, draw::Overlay},
  pipeline::{PipelineConfig, PipelineScheduler, StatsSnapshot},
};

/// 收到中断信号后最多等待这么久，之后强制退出
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 安装 Ctrl-C 处理函数，每个进程只能调用一次
///
/// 处理函数先调用 `on_interrupt`，如果程序在限定时间内还没退出就强制退出。
pub fn install_interrupt_handler<F>(on_interrupt: F) -> anyhow::Result<()>
where
  F: Fn() + Send + 'static,
{
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    on_interrupt();
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(())
}

/// 单线程顺序执行：采集 → 预处理 → 推理 → 后处理 → 叠加显示
#[derive(Default)]
pub struct SequentialTask {
  frame_number: Option<usize>,
  overlay: Overlay,
  stop: Arc<AtomicBool>,
}

impl SequentialTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_overlay(mut self, overlay: Overlay) -> Self {
    self.overlay = overlay;
    self
  }

  /// 置位后循环在当前帧结束时退出
  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.stop)
  }
}

impl<I, A, O> Task<I, Yolov8<A>, O> for SequentialTask
where
  I: Capture,
  A: Accelerator,
  O: Display,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: Yolov8<A>, mut output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    model.initialize()?;

    let mut frame_index = 0usize;
    while !self.stop.load(Ordering::Acquire) {
      let mut frame = match input.grab() {
        Ok(frame) => frame,
        Err(CaptureError::Exhausted) => {
          info!("输入结束");
          break;
        }
        Err(e) => return Err(e.into()),
      };
      frame_index += 1;

      let now = Instant::now();
      let result = model.detect(&frame)?;
      let elapsed_a = now.elapsed();
      self.overlay.draw(&mut frame, &result)?;
      output.show(&frame)?;
      let elapsed_b = now.elapsed();
      info!(
        "第 {} 帧: {} 个目标，耗时 {:.2?} / {:.2?}",
        frame_index,
        result.items.len(),
        elapsed_a,
        elapsed_b
      );

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
    }

    model.accessor().shutdown();
    info!("任务完成，共处理 {} 帧", frame_index);
    Ok(())
  }
}

/// 四阶段流水线：启动后等待停止请求（中断信号、阶段错误、输入结束或运行时长到期）
#[derive(Default)]
pub struct PipelineTask {
  config: PipelineConfig,
  overlay: Overlay,
  duration: Option<Duration>,
  interrupt: bool,
}

impl PipelineTask {
  pub fn new(config: PipelineConfig) -> Self {
    Self {
      config,
      ..Default::default()
    }
  }

  pub fn with_overlay(mut self, overlay: Overlay) -> Self {
    self.overlay = overlay;
    self
  }

  /// 最长运行时间
  pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
    self.duration = duration;
    self
  }

  /// 是否安装 Ctrl-C 处理函数
  pub fn with_interrupt_handler(mut self, interrupt: bool) -> Self {
    self.interrupt = interrupt;
    self
  }

  /// 运行流水线并返回停止时的统计
  pub fn run<I, A, O>(
    self,
    input: I,
    accessor: Arc<InferenceAccessor<A>>,
    output: O,
  ) -> anyhow::Result<StatsSnapshot>
  where
    I: Capture + 'static,
    A: Accelerator + 'static,
    O: Display + 'static,
  {
    info!("开始任务...");
    let mut scheduler =
      PipelineScheduler::new(&self.config, accessor, input, output).with_overlay(self.overlay);
    let handle = scheduler.stop_handle();

    if self.interrupt {
      let handle = handle.clone();
      install_interrupt_handler(move || handle.request_stop())?;
    }

    scheduler.start()?;
    match self.duration {
      Some(duration) => {
        if !handle.wait_timeout(duration) {
          info!("运行时间到达 {:.2?}，停止流水线", duration);
        }
      }
      None => handle.wait(),
    }

    scheduler.stop()?;
    let stats = scheduler.stats();
    info!("任务完成，退出");
    Ok(stats)
  }
}
