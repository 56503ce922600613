// 该文件是 Shanan （山南西风） 项目的一部分。
// src/channel.rs - 阶段间有界交接队列
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
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, select};

/// 入队策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPolicy {
  /// 队列已满时直接丢弃新元素
  DropIfFull,
  /// 等待空位，超时后丢弃
  BlockWithTimeout(Duration),
  /// 一直等待空位（或停止信号）
  BlockForever,
}

/// 停止信号
///
/// 内部是一个从不发送数据的通道，触发时丢弃发送端，
/// 所有监听者立即观察到断开。克隆共享同一个信号。
#[derive(Debug, Clone)]
pub struct Shutdown {
  trigger: Arc<Mutex<Option<Sender<()>>>>,
  listener: Receiver<()>,
}

impl Default for Shutdown {
  fn default() -> Self {
    Self::new()
  }
}

impl Shutdown {
  pub fn new() -> Self {
    let (tx, rx) = bounded(0);
    Self {
      trigger: Arc::new(Mutex::new(Some(tx))),
      listener: rx,
    }
  }

  /// 触发停止信号，只有第一次调用返回 `true`
  pub fn trigger(&self) -> bool {
    let sender = self
      .trigger
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    sender.is_some()
  }

  pub fn is_triggered(&self) -> bool {
    matches!(self.listener.try_recv(), Err(TryRecvError::Disconnected))
  }

  /// 阻塞直到信号被触发
  pub fn wait(&self) {
    let _ = self.listener.recv();
  }

  /// 最多等待 `timeout`，返回信号是否已触发
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    matches!(
      self.listener.recv_timeout(timeout),
      Err(RecvTimeoutError::Disconnected)
    )
  }

  pub(crate) fn listener(&self) -> &Receiver<()> {
    &self.listener
  }
}

/// 固定容量、线程安全的交接队列
///
/// 元素所有权随 `push`/`pop` 整体转移。`pop` 没有超时版本，
/// 阻塞中的消费者由绑定的 [`Shutdown`] 唤醒并得到 `None`。
#[derive(Debug)]
pub struct BoundedChannel<T> {
  sender: Sender<T>,
  receiver: Receiver<T>,
  shutdown: Shutdown,
  capacity: usize,
}

impl<T> Clone for BoundedChannel<T> {
  fn clone(&self) -> Self {
    Self {
      sender: self.sender.clone(),
      receiver: self.receiver.clone(),
      shutdown: self.shutdown.clone(),
      capacity: self.capacity,
    }
  }
}

impl<T> BoundedChannel<T> {
  /// 创建一个独立的队列（不与任何流水线共享停止信号）
  ///
  /// # Panics
  ///
  /// `capacity` 为 0 时 panic。
  pub fn new(capacity: usize) -> Self {
    Self::with_shutdown(capacity, &Shutdown::new())
  }

  /// 创建绑定到 `shutdown` 的队列
  ///
  /// # Panics
  ///
  /// `capacity` 为 0 时 panic。
  pub fn with_shutdown(capacity: usize, shutdown: &Shutdown) -> Self {
    assert!(capacity > 0, "队列容量必须大于 0");
    let (sender, receiver) = bounded(capacity);
    Self {
      sender,
      receiver,
      shutdown: shutdown.clone(),
      capacity,
    }
  }

  /// 按 `policy` 入队，返回元素是否被接收
  ///
  /// `DropIfFull` 下，当且仅当调用时队列已满返回 `false`。
  /// 停止信号触发后任何策略都返回 `false`。
  pub fn push(&self, item: T, policy: PushPolicy) -> bool {
    if self.shutdown.is_triggered() {
      return false;
    }

    match policy {
      PushPolicy::DropIfFull => self.sender.try_send(item).is_ok(),
      PushPolicy::BlockWithTimeout(timeout) => select! {
        send(self.sender, item) -> res => res.is_ok(),
        recv(self.shutdown.listener()) -> _ => false,
        default(timeout) => false,
      },
      PushPolicy::BlockForever => select! {
        send(self.sender, item) -> res => res.is_ok(),
        recv(self.shutdown.listener()) -> _ => false,
      },
    }
  }

  /// 阻塞出队（FIFO），停止信号触发后返回 `None`
  pub fn pop(&self) -> Option<T> {
    if self.shutdown.is_triggered() {
      return None;
    }

    select! {
      recv(self.receiver) -> item => item.ok(),
      recv(self.shutdown.listener()) -> _ => None,
    }
  }

  /// 非阻塞出队
  pub fn try_pop(&self) -> Option<T> {
    self.receiver.try_recv().ok()
  }

  pub fn len(&self) -> usize {
    self.receiver.len()
  }

  pub fn is_empty(&self) -> bool {
    self.receiver.is_empty()
  }

  pub fn is_full(&self) -> bool {
    self.receiver.is_full()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}
