// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_sequential.rs - 单线程顺序检测
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
  path::PathBuf,
  sync::{Arc, atomic::Ordering},
};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_stream::{
  FromUrl,
  accelerator::{InferenceAccessor, ReplayAccelerator, model_path_from_url},
  input::InputWrapper,
  model::{Labels, Yolov8},
  output::{OutputWrapper, draw::Overlay},
  pipeline::PipelineConfig,
  task::{SequentialTask, Task, install_interrupt_handler},
};

/// 不经过流水线，逐帧采集、推理、显示
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 replay:///models/yolov8n.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 类别名称文件
  #[arg(long, value_name = "FILE")]
  pub classes: Option<PathBuf>,
  /// 标签字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let labels = match &args.classes {
    Some(path) => Labels::from_file(path)?,
    None => Labels::coco(),
  };

  let config = PipelineConfig::default()
    .with_model_path(model_path_from_url::<ReplayAccelerator>(&args.model)?)
    .with_num_classes(labels.len())
    .with_score_threshold(args.confidence)
    .with_iou_threshold(args.nms_threshold);

  let mut overlay = Overlay::new(labels);
  if let Some(font) = &args.font {
    overlay = overlay.with_font_file(font)?;
  }

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let model = Yolov8::new(
    Arc::new(InferenceAccessor::<ReplayAccelerator>::default()),
    &config,
  );

  let task = SequentialTask::default()
    .with_frame_number(args.frame_number)
    .with_overlay(overlay);
  let stop = task.stop_flag();
  install_interrupt_handler(move || stop.store(true, Ordering::Release))?;

  task.run_task(input, model, output)?;

  Ok(())
}
