// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 四阶段流水线主程序
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

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_stream::{
  FromUrl,
  accelerator::{
    DEFAULT_WORKSPACE_SIZE, InferenceAccessor, ReplayAccelerator, ReplayFlags, model_path_from_url,
  },
  frame::ChannelOrder,
  input::InputWrapper,
  model::Labels,
  output::{OutputWrapper, draw::Overlay},
  pipeline::PipelineConfig,
  task::PipelineTask,
};

/// Shanan 实时检测流水线
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 replay:///models/yolov8n.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 image:///data/street.jpg?fps=15 或 v4l:///dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 显示输出，例如 fb:///dev/fb0 或 image:///tmp/latest.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 类别名称文件，每行一个；缺省为 COCO 80 类
  #[arg(long, value_name = "FILE")]
  pub classes: Option<PathBuf>,
  /// 标签字体（TrueType），不给则只画框
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 置信度阈值
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// NMS IOU 阈值
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,
  /// NMS 自适应系数
  #[arg(long, default_value = "0.5", value_name = "ETA")]
  pub nms_eta: f32,

  /// 模型输入宽度
  #[arg(long, default_value = "640", value_name = "PIXELS")]
  pub input_width: u32,
  /// 模型输入高度
  #[arg(long, default_value = "640", value_name = "PIXELS")]
  pub input_height: u32,
  /// 模型输入的通道排列
  #[arg(long, value_enum, default_value_t = ChannelOrder::Rgb)]
  pub channel_order: ChannelOrder,
  /// 加速器工作区字节数
  #[arg(long, default_value_t = DEFAULT_WORKSPACE_SIZE, value_name = "BYTES")]
  pub workspace_size: usize,

  /// 运行指定秒数后退出，缺省一直运行到 Ctrl-C
  #[arg(long, value_name = "SECONDS")]
  pub duration: Option<u64>,
  /// 回放后端不模拟推理耗时
  #[arg(long)]
  pub no_latency: bool,
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
  info!("类别数量: {}", labels.len());

  let config = PipelineConfig::default()
    .with_model_path(model_path_from_url::<ReplayAccelerator>(&args.model)?)
    .with_workspace_size(args.workspace_size)
    .with_input_size(args.input_width, args.input_height)
    .with_num_classes(labels.len())
    .with_score_threshold(args.confidence)
    .with_iou_threshold(args.nms_threshold)
    .with_nms_eta(args.nms_eta)
    .with_channel_order(args.channel_order);

  let mut overlay = Overlay::new(labels);
  if let Some(font) = &args.font {
    overlay = overlay.with_font_file(font)?;
  }

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let accessor = Arc::new(InferenceAccessor::<ReplayAccelerator>::new(ReplayFlags {
    simulate_latency: !args.no_latency,
  }));

  let stats = PipelineTask::new(config)
    .with_overlay(overlay)
    .with_duration(args.duration.map(Duration::from_secs))
    .with_interrupt_handler(true)
    .run(input, accessor, output)?;

  info!(
    "采集 {} 帧，送检 {} 帧，推理 {} 次，显示 {} 帧",
    stats.captured, stats.submitted, stats.inferences, stats.displayed
  );
  Ok(())
}
