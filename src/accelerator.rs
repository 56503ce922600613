// 该文件是 Shanan （山南西风） 项目的一部分。
// src/accelerator.rs - 推理加速器访问
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
  path::{Path, PathBuf},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::tensor::{DecodeError, ElementFormat, RawTensorBuffer, TensorDesc};

mod replay;
pub use self::replay::{ReplayAccelerator, ReplayFlags};

/// 默认工作区大小
pub const DEFAULT_WORKSPACE_SIZE: usize = 17 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum AcceleratorInitError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("工作区不足: 需要 {required} 字节, 可用 {available} 字节")]
  WorkspaceExhausted { required: usize, available: usize },
  #[error("推理访问器已销毁，不能再次初始化")]
  Destroyed,
}

impl AcceleratorInitError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    AcceleratorInitError::ModelInvalid(msg.into())
  }
}

#[derive(Error, Debug)]
pub enum AcceleratorRunError {
  #[error("推理访问器未初始化")]
  NotInitialized,
  #[error("推理访问器已销毁")]
  Destroyed,
  #[error("输入槽 {0} 不存在")]
  InvalidInput(usize),
  #[error("输出槽 {0} 不存在")]
  InvalidOutput(usize),
  #[error("填充输入失败: {0}")]
  InputFill(String),
  #[error("提交推理任务失败: {0}")]
  Submit(String),
  #[error("执行推理失败: {0}")]
  Execute(String),
  #[error("读取输出失败: {0}")]
  OutputFetch(String),
  #[error(transparent)]
  Decode(#[from] DecodeError),
}

/// 单上下文推理硬件的驱动接口
///
/// 一个实例就是一个硬件上下文，不可重入；[`InferenceAccessor`] 负责串行化。
/// `destroy` 由访问器保证只调用一次。
pub trait Accelerator: Send + Sized {
  /// 模型地址使用的 URL 方案
  const SCHEME: &'static str;
  /// 创建参数，对应驱动的初始化标志
  type Flags: Default + Send + Sync;

  fn create(
    model: &[u8],
    workspace_size: usize,
    flags: &Self::Flags,
  ) -> Result<Self, AcceleratorInitError>;

  fn input_descs(&self) -> &[Arc<TensorDesc>];
  fn output_descs(&self) -> &[Arc<TensorDesc>];

  /// 映射输入槽对应的加速器内存
  fn map_input(&mut self, index: usize) -> Result<&mut [u8], AcceleratorRunError>;
  fn submit(&mut self) -> Result<(), AcceleratorRunError>;
  /// 阻塞直到硬件完成
  fn execute(&mut self) -> Result<(), AcceleratorRunError>;
  fn map_output(&self, index: usize) -> Result<&[u8], AcceleratorRunError>;

  fn destroy(&mut self);
}

/// 从模型地址取出文件路径，URL 方案必须与后端一致（例如 `replay:///models/yolov8n.json`）
pub fn model_path_from_url<A: Accelerator>(url: &Url) -> Result<PathBuf, AcceleratorInitError> {
  if url.scheme() != A::SCHEME {
    error!(
      "URI scheme mismatch: expected '{}', found '{}'",
      A::SCHEME,
      url.scheme()
    );
    return Err(AcceleratorInitError::invalid(format!(
      "模型地址方案应为 '{}'，实际为 '{}'",
      A::SCHEME,
      url.scheme()
    )));
  }
  if url.path().is_empty() || url.path() == "/" {
    return Err(AcceleratorInitError::invalid("模型地址缺少文件路径"));
  }
  Ok(PathBuf::from(url.path()))
}

enum AccessorState<A> {
  Uninitialized,
  Ready(A),
  Destroyed,
}

/// 加速器生命周期（创建 → 多次推理 → 销毁）的唯一持有者
///
/// 所有调用都经过同一把锁，因此任一时刻最多只有一次 `run` 在进行。
/// `shutdown` 会等待正在进行的 `run` 结束后再释放硬件。
pub struct InferenceAccessor<A: Accelerator> {
  flags: A::Flags,
  state: Mutex<AccessorState<A>>,
}

impl<A: Accelerator> Default for InferenceAccessor<A> {
  fn default() -> Self {
    Self::new(A::Flags::default())
  }
}

impl<A: Accelerator> InferenceAccessor<A> {
  pub fn new(flags: A::Flags) -> Self {
    Self {
      flags,
      state: Mutex::new(AccessorState::Uninitialized),
    }
  }

  fn lock(&self) -> MutexGuard<'_, AccessorState<A>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 加载模型并创建硬件上下文，已初始化时什么也不做
  pub fn initialize(
    &self,
    model_path: impl AsRef<Path>,
    workspace_size: usize,
  ) -> Result<(), AcceleratorInitError> {
    let mut state = self.lock();
    match &*state {
      AccessorState::Ready(_) => {
        debug!("推理上下文已存在，跳过初始化");
        return Ok(());
      }
      AccessorState::Destroyed => return Err(AcceleratorInitError::Destroyed),
      AccessorState::Uninitialized => {}
    }

    let model_path = model_path.as_ref();
    info!("加载模型文件: {}", model_path.display());
    let model = std::fs::read(model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建推理上下文，工作区 {} 字节", workspace_size);
    let accelerator = A::create(&model, workspace_size, &self.flags)?;

    debug!("模型输入数量: {}", accelerator.input_descs().len());
    for (index, desc) in accelerator.input_descs().iter().enumerate() {
      debug!(
        "输入 {}: {:?} {:?} {:?}",
        index, desc.format, desc.dims, desc.quantization
      );
    }
    debug!("模型输出数量: {}", accelerator.output_descs().len());
    for (index, desc) in accelerator.output_descs().iter().enumerate() {
      debug!(
        "输出 {}: {:?} {:?} {:?}",
        index, desc.format, desc.dims, desc.quantization
      );
    }

    *state = AccessorState::Ready(accelerator);
    info!("模型加载完成");
    Ok(())
  }

  pub fn is_ready(&self) -> bool {
    matches!(&*self.lock(), AccessorState::Ready(_))
  }

  pub fn input_descs(&self) -> Result<Vec<Arc<TensorDesc>>, AcceleratorRunError> {
    self.with_ready(|accelerator| accelerator.input_descs().to_vec())
  }

  pub fn output_descs(&self) -> Result<Vec<Arc<TensorDesc>>, AcceleratorRunError> {
    self.with_ready(|accelerator| accelerator.output_descs().to_vec())
  }

  fn with_ready<T>(&self, f: impl FnOnce(&A) -> T) -> Result<T, AcceleratorRunError> {
    match &*self.lock() {
      AccessorState::Ready(accelerator) => Ok(f(accelerator)),
      AccessorState::Uninitialized => Err(AcceleratorRunError::NotInitialized),
      AccessorState::Destroyed => Err(AcceleratorRunError::Destroyed),
    }
  }

  /// 执行一次推理
  ///
  /// 对每个输入槽调用一次 `fill(index, buffer, format)` 填充加速器内存，
  /// 然后提交、等待完成，并把每个输出复制成一个 [`RawTensorBuffer`]。
  /// 任一步骤失败都直接返回错误，不做重试。
  pub fn run<F>(&self, mut fill: F) -> Result<Vec<RawTensorBuffer>, AcceleratorRunError>
  where
    F: FnMut(usize, &mut [u8], ElementFormat) -> Result<(), AcceleratorRunError>,
  {
    let mut state = self.lock();
    let accelerator = match &mut *state {
      AccessorState::Ready(accelerator) => accelerator,
      AccessorState::Uninitialized => return Err(AcceleratorRunError::NotInitialized),
      AccessorState::Destroyed => return Err(AcceleratorRunError::Destroyed),
    };

    let inputs = accelerator.input_descs().to_vec();
    for (index, desc) in inputs.iter().enumerate() {
      let buffer = accelerator.map_input(index)?;
      fill(index, buffer, desc.format)?;
    }

    debug!("提交推理任务");
    accelerator.submit()?;
    accelerator.execute()?;

    let outputs = accelerator.output_descs().to_vec();
    let mut results = Vec::with_capacity(outputs.len());
    for (index, desc) in outputs.into_iter().enumerate() {
      let bytes = accelerator.map_output(index)?;
      results.push(RawTensorBuffer::new(desc, bytes)?);
    }
    Ok(results)
  }

  /// 释放硬件资源，可重复调用；之后访问器不能再使用
  pub fn shutdown(&self) {
    let mut state = self.lock();
    match std::mem::replace(&mut *state, AccessorState::Destroyed) {
      AccessorState::Ready(mut accelerator) => {
        accelerator.destroy();
        info!("推理上下文已释放");
      }
      AccessorState::Uninitialized => {
        debug!("推理访问器在初始化前被关闭");
      }
      AccessorState::Destroyed => {}
    }
  }
}

impl<A: Accelerator> Drop for InferenceAccessor<A> {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::QuantizationSpec;
  use std::{
    io::Write,
    sync::atomic::{AtomicUsize, Ordering},
  };

  static DESTROYED: AtomicUsize = AtomicUsize::new(0);

  /// 把输入的每个字节加一写到输出
  struct Echo {
    inputs: Vec<Arc<TensorDesc>>,
    outputs: Vec<Arc<TensorDesc>>,
    input: Vec<u8>,
    output: Vec<u8>,
    fail_execute: bool,
  }

  #[derive(Default)]
  struct EchoFlags {
    fail_execute: bool,
  }

  impl Accelerator for Echo {
    const SCHEME: &'static str = "echo";
    type Flags = EchoFlags;

    fn create(
      model: &[u8],
      workspace_size: usize,
      flags: &EchoFlags,
    ) -> Result<Self, AcceleratorInitError> {
      let len = match model {
        [n] => usize::from(*n),
        _ => return Err(AcceleratorInitError::invalid("模型必须是一个字节")),
      };
      if len * 2 > workspace_size {
        return Err(AcceleratorInitError::WorkspaceExhausted {
          required: len * 2,
          available: workspace_size,
        });
      }
      let desc = Arc::new(TensorDesc::new(
        ElementFormat::UInt8,
        vec![len],
        QuantizationSpec::None,
      ));
      Ok(Self {
        inputs: vec![desc.clone()],
        outputs: vec![desc],
        input: vec![0; len],
        output: vec![0; len],
        fail_execute: flags.fail_execute,
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
      if self.fail_execute {
        return Err(AcceleratorRunError::Execute("硬件错误".into()));
      }
      for (o, i) in self.output.iter_mut().zip(&self.input) {
        *o = i.wrapping_add(1);
      }
      Ok(())
    }

    fn map_output(&self, index: usize) -> Result<&[u8], AcceleratorRunError> {
      match index {
        0 => Ok(&self.output),
        _ => Err(AcceleratorRunError::InvalidOutput(index)),
      }
    }

    fn destroy(&mut self) {
      DESTROYED.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn model_file(len: u8) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[len]).unwrap();
    file
  }

  #[test]
  fn run_fills_and_copies_outputs() {
    let model = model_file(4);
    let accessor = InferenceAccessor::<Echo>::default();
    accessor.initialize(model.path(), 1024).unwrap();
    accessor.initialize(model.path(), 1024).unwrap();
    assert!(accessor.is_ready());

    let outputs = accessor
      .run(|index, buffer, format| {
        assert_eq!(index, 0);
        assert_eq!(format, ElementFormat::UInt8);
        buffer.copy_from_slice(&[1, 2, 3, 255]);
        Ok(())
      })
      .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].as_bytes(), &[2, 3, 4, 0]);

    let second = accessor
      .run(|_, buffer, _| {
        buffer.fill(9);
        Ok(())
      })
      .unwrap();
    // 第一次的结果不受第二次推理影响
    assert_eq!(outputs[0].as_bytes(), &[2, 3, 4, 0]);
    assert_eq!(second[0].as_bytes(), &[10, 10, 10, 10]);
  }

  #[test]
  fn missing_model_file_fails_init() {
    let accessor = InferenceAccessor::<Echo>::default();
    let err = accessor
      .initialize("/nonexistent/model.bin", 1024)
      .unwrap_err();
    assert!(matches!(err, AcceleratorInitError::ModelLoad(_)));
    assert!(!accessor.is_ready());
  }

  #[test]
  fn workspace_limit_is_reported() {
    let model = model_file(200);
    let accessor = InferenceAccessor::<Echo>::default();
    let err = accessor.initialize(model.path(), 100).unwrap_err();
    assert!(matches!(
      err,
      AcceleratorInitError::WorkspaceExhausted {
        required: 400,
        available: 100
      }
    ));
  }

  #[test]
  fn run_errors_propagate() {
    let model = model_file(2);
    let accessor = InferenceAccessor::<Echo>::new(EchoFlags { fail_execute: true });
    accessor.initialize(model.path(), 1024).unwrap();
    let err = accessor.run(|_, _, _| Ok(())).unwrap_err();
    assert!(matches!(err, AcceleratorRunError::Execute(_)));

    let err = accessor
      .run(|_, _, _| Err(AcceleratorRunError::InputFill("坏帧".into())))
      .unwrap_err();
    assert!(matches!(err, AcceleratorRunError::InputFill(_)));
  }

  #[test]
  fn shutdown_is_idempotent_and_final() {
    let model = model_file(2);
    let accessor = InferenceAccessor::<Echo>::default();
    assert!(matches!(
      accessor.run(|_, _, _| Ok(())),
      Err(AcceleratorRunError::NotInitialized)
    ));
    accessor.initialize(model.path(), 1024).unwrap();

    let before = DESTROYED.load(Ordering::SeqCst);
    accessor.shutdown();
    accessor.shutdown();
    assert!(matches!(
      accessor.run(|_, _, _| Ok(())),
      Err(AcceleratorRunError::Destroyed)
    ));
    assert!(matches!(
      accessor.initialize(model.path(), 1024),
      Err(AcceleratorInitError::Destroyed)
    ));
    drop(accessor);
    // 其他测试可能并发销毁，只检查至少增加了一次
    assert!(DESTROYED.load(Ordering::SeqCst) > before);
  }

  #[test]
  fn model_url_scheme_is_checked() {
    let url = Url::parse("echo:///models/net.bin").unwrap();
    assert_eq!(
      model_path_from_url::<Echo>(&url).unwrap(),
      PathBuf::from("/models/net.bin")
    );

    let url = Url::parse("replay:///models/net.json").unwrap();
    assert!(matches!(
      model_path_from_url::<Echo>(&url),
      Err(AcceleratorInitError::ModelInvalid(_))
    ));
    let url = Url::parse("echo:///").unwrap();
    assert!(model_path_from_url::<Echo>(&url).is_err());
  }
}
