// 该文件是 Looker3d 项目的一部分。
// src/transfer.rs - 解码线程到渲染线程的缓冲区移交
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

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use crate::label::LabelField;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的缓冲区编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl std::fmt::Display for BufferId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// 可移交的缓冲区，只能由 [`TransferList::adopt`] 创建
#[derive(Debug)]
pub struct Transferable<T> {
  id: BufferId,
  inner: T,
}

impl<T> Transferable<T> {
  pub fn id(&self) -> BufferId {
    self.id
  }

  pub fn get_mut(&mut self) -> &mut T {
    &mut self.inner
  }

  pub fn into_inner(self) -> T {
    self.inner
  }
}

impl<T> Deref for Transferable<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.inner
  }
}

/// 一个批次中需要移交的缓冲区清单
#[derive(Debug, Default)]
pub struct TransferList {
  ids: Vec<BufferId>,
}

impl TransferList {
  /// 登记新产生的缓冲区，登记与创建同时发生
  pub fn adopt<T>(&mut self, inner: T) -> Transferable<T> {
    let id = BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed));
    self.ids.push(id);
    Transferable { id, inner }
  }

  pub fn ids(&self) -> &[BufferId] {
    &self.ids
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn append(&mut self, mut other: TransferList) {
    self.ids.append(&mut other.ids);
  }
}

/// 提交给解码线程的请求
#[derive(Debug)]
pub struct DecodeRequest {
  pub sample_id: String,
  pub generation: u64,
  pub labels: Vec<LabelField>,
}

/// 解码线程发回渲染线程的消息
#[derive(Debug)]
pub struct DecodedBatch {
  pub sample_id: String,
  pub generation: u64,
  pub labels: Vec<LabelField>,
  pub transfer: TransferList,
}

impl DecodedBatch {
  /// 批次中实际持有的全部缓冲区
  pub fn buffer_ids(&self) -> Vec<BufferId> {
    let mut ids = Vec::new();
    for field in &self.labels {
      field.label.collect_buffer_ids(&mut ids);
    }
    ids
  }
}

#[derive(Error, Debug)]
pub enum TransferError {
  #[error("缓冲区 {0} 未列入移交清单")]
  Unlisted(BufferId),
  #[error("移交清单中的缓冲区 {0} 不在批次中")]
  Missing(BufferId),
  #[error("缓冲区 {0} 重复出现")]
  Duplicated(BufferId),
  #[error("通道已断开")]
  Disconnected,
  #[error("等待解码结果超时")]
  Timeout,
}

pub fn channel() -> (TransferSender, TransferReceiver) {
  let (tx, rx) = mpsc::channel();
  (TransferSender { tx }, TransferReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct TransferSender {
  tx: mpsc::Sender<DecodedBatch>,
}

impl TransferSender {
  /// 整批移交，调用后发送方不再持有批次中的任何缓冲区
  pub fn send(&self, batch: DecodedBatch) -> Result<(), TransferError> {
    verify_transfer_set(&batch)?;
    debug!(
      "移交样本 {} 的 {} 个缓冲区",
      batch.sample_id,
      batch.transfer.len()
    );
    self.tx.send(batch).map_err(|_| TransferError::Disconnected)
  }
}

fn verify_transfer_set(batch: &DecodedBatch) -> Result<(), TransferError> {
  let mut listed = BTreeSet::new();
  for id in batch.transfer.ids() {
    if !listed.insert(*id) {
      return Err(TransferError::Duplicated(*id));
    }
  }

  let mut held = BTreeSet::new();
  for id in batch.buffer_ids() {
    if !held.insert(id) {
      return Err(TransferError::Duplicated(id));
    }
    if !listed.contains(&id) {
      error!("缓冲区 {} 未登记即被发送", id);
      return Err(TransferError::Unlisted(id));
    }
  }

  match listed.difference(&held).next() {
    Some(id) => Err(TransferError::Missing(*id)),
    None => Ok(()),
  }
}

#[derive(Debug)]
pub struct TransferReceiver {
  rx: mpsc::Receiver<DecodedBatch>,
}

impl TransferReceiver {
  /// 非阻塞读取，没有消息时返回 `Ok(None)`
  pub fn try_recv(&self) -> Result<Option<DecodedBatch>, TransferError> {
    match self.rx.try_recv() {
      Ok(batch) => Ok(Some(batch)),
      Err(TryRecvError::Empty) => Ok(None),
      Err(TryRecvError::Disconnected) => Err(TransferError::Disconnected),
    }
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Result<DecodedBatch, TransferError> {
    self.rx.recv_timeout(timeout).map_err(|e| match e {
      RecvTimeoutError::Timeout => TransferError::Timeout,
      RecvTimeoutError::Disconnected => TransferError::Disconnected,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::array::{ArrayData, DecodedArray};
  use crate::label::{Label, RenderableMask, Segmentation};

  fn segmentation_with_mask(list: &mut TransferList) -> LabelField {
    let array = DecodedArray::new(ArrayData::Uint8(vec![1; 4]), vec![2, 2]).unwrap();
    let mut label = Segmentation::default();
    label.mask = Some(RenderableMask::allocate(array, list).unwrap());
    LabelField {
      path: "segmentation".to_string(),
      label: Label::Segmentation(label),
    }
  }

  fn batch(labels: Vec<LabelField>, transfer: TransferList) -> DecodedBatch {
    DecodedBatch {
      sample_id: "s1".to_string(),
      generation: 1,
      labels,
      transfer,
    }
  }

  #[test]
  fn adopted_buffers_are_listed() {
    let mut list = TransferList::default();
    let a = list.adopt(vec![0u8; 4]);
    let b = list.adopt(vec![1u8; 4]);
    assert_ne!(a.id(), b.id());
    assert_eq!(list.ids(), &[a.id(), b.id()]);
    assert_eq!(b.into_inner(), vec![1u8; 4]);
  }

  #[test]
  fn sends_batch_with_exact_transfer_set() {
    let (tx, rx) = channel();
    let mut list = TransferList::default();
    let field = segmentation_with_mask(&mut list);
    let expected: BTreeSet<_> = list.ids().iter().copied().collect();

    tx.send(batch(vec![field], list)).unwrap();
    let received = rx.try_recv().unwrap().unwrap();
    let held: BTreeSet<_> = received.buffer_ids().into_iter().collect();
    assert_eq!(held, expected);
    assert_eq!(held.len(), 2);
  }

  #[test]
  fn refuses_unlisted_buffer() {
    let (tx, _rx) = channel();
    let mut other = TransferList::default();
    let field = segmentation_with_mask(&mut other);
    let err = tx.send(batch(vec![field], TransferList::default())).unwrap_err();
    assert!(matches!(err, TransferError::Unlisted(_)));
  }

  #[test]
  fn refuses_listed_but_missing_buffer() {
    let (tx, _rx) = channel();
    let mut list = TransferList::default();
    let _stray = list.adopt(vec![0u8; 1]);
    let err = tx.send(batch(Vec::new(), list)).unwrap_err();
    assert!(matches!(err, TransferError::Missing(_)));
  }

  #[test]
  fn receiver_reports_empty_and_disconnected() {
    let (tx, rx) = channel();
    assert!(rx.try_recv().unwrap().is_none());
    drop(tx);
    assert!(matches!(rx.try_recv(), Err(TransferError::Disconnected)));
  }
}
