// 该文件是 Shanan （山南西风） 项目的一部分。
// src/accelerator/replay.rs - 回放式加速器后端
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

//! 没有 NPU 时使用的后端：模型文件是一个 JSON 描述，
//! 列出输入输出张量以及每次推理要报告的输出内容。
//!
//! ```json
//! {
//!   "latency_ms": 20,
//!   "inputs": [{ "format": "uint8", "dims": [1, 3, 640, 640] }],
//!   "outputs": [{
//!     "format": "int8",
//!     "dims": [1, 84, 8400],
//!     "quantization": { "type": "affine", "scale": 0.0039, "zero_point": -128 },
//!     "constant": 0.0,
//!     "values": [[0, 320.0], [8400, 320.0]]
//!   }]
//! }
//! ```

use std::{sync::Arc, thread, time::Duration};

use serde::Deserialize;
use tracing::{debug, info, trace};

use super::{Accelerator, AcceleratorInitError, AcceleratorRunError};
use crate::tensor::{ElementFormat, QuantizationSpec, TensorDesc, TensorEncoder};

#[derive(Debug, Deserialize)]
struct ReplayManifest {
  #[serde(default)]
  latency_ms: u64,
  inputs: Vec<TensorDesc>,
  outputs: Vec<ReplayOutput>,
}

#[derive(Debug, Deserialize)]
struct ReplayOutput {
  format: ElementFormat,
  dims: Vec<usize>,
  #[serde(default)]
  quantization: QuantizationSpec,
  #[serde(default)]
  constant: f32,
  /// 稀疏覆盖：`[元素下标, 实数值]`
  #[serde(default)]
  values: Vec<(usize, f32)>,
}

#[derive(Debug, Clone)]
pub struct ReplayFlags {
  /// 是否按 `latency_ms` 真实等待
  pub simulate_latency: bool,
}

impl Default for ReplayFlags {
  fn default() -> Self {
    Self {
      simulate_latency: true,
    }
  }
}

pub struct ReplayAccelerator {
  inputs: Vec<Arc<TensorDesc>>,
  outputs: Vec<Arc<TensorDesc>>,
  input_buffers: Vec<Vec<u8>>,
  output_buffers: Vec<Vec<u8>>,
  mapped: Vec<bool>,
  submitted: bool,
  latency: Duration,
  runs: u64,
}

impl ReplayAccelerator {
  pub fn runs(&self) -> u64 {
    self.runs
  }
}

impl Accelerator for ReplayAccelerator {
  const SCHEME: &'static str = "replay";
  type Flags = ReplayFlags;

  fn create(
    model: &[u8],
    workspace_size: usize,
    flags: &ReplayFlags,
  ) -> Result<Self, AcceleratorInitError> {
    let manifest: ReplayManifest = serde_json::from_slice(model)
      .map_err(|e| AcceleratorInitError::invalid(format!("模型描述解析失败: {}", e)))?;

    if manifest.inputs.is_empty() {
      return Err(AcceleratorInitError::invalid("模型没有输入"));
    }
    if manifest.outputs.is_empty() {
      return Err(AcceleratorInitError::invalid("模型没有输出"));
    }

    let inputs: Vec<Arc<TensorDesc>> = manifest.inputs.into_iter().map(Arc::new).collect();
    for (index, desc) in inputs.iter().enumerate() {
      if !desc.format.is_decodable() {
        return Err(AcceleratorInitError::invalid(format!(
          "输入 {} 的格式 {:?} 不受支持",
          index, desc.format
        )));
      }
    }

    let mut outputs = Vec::with_capacity(manifest.outputs.len());
    let mut output_buffers = Vec::with_capacity(manifest.outputs.len());
    for (index, output) in manifest.outputs.into_iter().enumerate() {
      let desc = Arc::new(TensorDesc::new(output.format, output.dims, output.quantization));
      let count = desc.element_count();

      let mut content = vec![output.constant; count];
      for (position, value) in output.values {
        let slot = content.get_mut(position).ok_or_else(|| {
          AcceleratorInitError::invalid(format!(
            "输出 {} 的下标 {} 超出元素数量 {}",
            index, position, count
          ))
        })?;
        *slot = value;
      }

      let mut buffer = vec![0u8; desc.byte_len()];
      TensorEncoder
        .encode_into(&desc, &content, &mut buffer)
        .map_err(|e| AcceleratorInitError::invalid(format!("输出 {} 无法编码: {}", index, e)))?;

      outputs.push(desc);
      output_buffers.push(buffer);
    }

    let required = model.len()
      + inputs.iter().map(|d| d.byte_len()).sum::<usize>()
      + outputs.iter().map(|d| d.byte_len()).sum::<usize>();
    if required > workspace_size {
      return Err(AcceleratorInitError::WorkspaceExhausted {
        required,
        available: workspace_size,
      });
    }
    debug!("回放模型占用工作区 {} / {} 字节", required, workspace_size);

    let latency = if flags.simulate_latency {
      Duration::from_millis(manifest.latency_ms)
    } else {
      Duration::ZERO
    };

    info!(
      "回放加速器就绪: {} 个输入, {} 个输出, 延迟 {:?}",
      inputs.len(),
      outputs.len(),
      latency
    );

    Ok(Self {
      input_buffers: inputs.iter().map(|d| vec![0u8; d.byte_len()]).collect(),
      mapped: vec![false; inputs.len()],
      inputs,
      outputs,
      output_buffers,
      submitted: false,
      latency,
      runs: 0,
    })
  }

  fn input_descs(&self) -> &[Arc<TensorDesc>] {
    &self.inputs
  }

  fn output_descs(&self) -> &[Arc<TensorDesc>] {
    &self.outputs
  }

  fn map_input(&mut self, index: usize) -> Result<&mut [u8], AcceleratorRunError> {
    let buffer = self
      .input_buffers
      .get_mut(index)
      .ok_or(AcceleratorRunError::InvalidInput(index))?;
    self.mapped[index] = true;
    Ok(buffer)
  }

  fn submit(&mut self) -> Result<(), AcceleratorRunError> {
    if let Some(index) = self.mapped.iter().position(|m| !m) {
      return Err(AcceleratorRunError::Submit(format!("输入 {} 未设置", index)));
    }
    self.submitted = true;
    Ok(())
  }

  fn execute(&mut self) -> Result<(), AcceleratorRunError> {
    if !self.submitted {
      return Err(AcceleratorRunError::Execute("没有已提交的任务".to_string()));
    }
    if !self.latency.is_zero() {
      thread::sleep(self.latency);
    }
    self.submitted = false;
    self.mapped.fill(false);
    self.runs += 1;
    trace!("回放推理完成，第 {} 次", self.runs);
    Ok(())
  }

  fn map_output(&self, index: usize) -> Result<&[u8], AcceleratorRunError> {
    self
      .output_buffers
      .get(index)
      .map(Vec::as_slice)
      .ok_or(AcceleratorRunError::InvalidOutput(index))
  }

  fn destroy(&mut self) {
    info!("回放加速器销毁，共推理 {} 次", self.runs);
    self.input_buffers.clear();
    self.output_buffers.clear();
  }
}
