// 该文件是 Looker3d 项目的一部分。
// src/event.rs - 进程内事件总线
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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// 标签在其他组件中被切换选中时发出的事件
pub const LABEL_TOGGLED_EVENT: &str = "fo-label-toggled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelToggledEvent {
  pub id: String,
  pub field: String,
  pub sample_id: String,
  pub instance_id: Option<String>,
  pub is_shift_pressed: bool,
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Listeners<E> = HashMap<String, Vec<(u64, Listener<E>)>>;

struct BusInner<E> {
  next_id: AtomicU64,
  listeners: RwLock<Listeners<E>>,
}

impl<E> BusInner<E> {
  // 监听者崩溃不应让总线失效
  fn read(&self) -> RwLockReadGuard<'_, Listeners<E>> {
    self.listeners.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, Listeners<E>> {
    self.listeners.write().unwrap_or_else(|e| e.into_inner())
  }

  fn remove(&self, event: &str, id: u64) {
    let mut listeners = self.write();
    if let Some(list) = listeners.get_mut(event) {
      list.retain(|(listener_id, _)| *listener_id != id);
      if list.is_empty() {
        listeners.remove(event);
      }
    }
  }
}

/// 按事件名分发的发布订阅总线
pub struct EventBus<E> {
  inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
  fn clone(&self) -> Self {
    EventBus {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<E> Default for EventBus<E> {
  fn default() -> Self {
    EventBus {
      inner: Arc::new(BusInner {
        next_id: AtomicU64::new(0),
        listeners: RwLock::new(HashMap::new()),
      }),
    }
  }
}

impl<E: 'static> EventBus<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册监听者，返回的 [`Subscription`] 被释放时自动注销
  pub fn on<F>(&self, event: &str, listener: F) -> Subscription
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .write()
      .entry(event.to_string())
      .or_default()
      .push((id, Arc::new(listener)));

    let inner: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
    let event = event.to_string();
    Subscription {
      dispose: Some(Box::new(move || {
        if let Some(inner) = inner.upgrade() {
          inner.remove(&event, id);
        }
      })),
    }
  }

  /// 通知当前所有监听者，返回通知的数量
  pub fn emit(&self, event: &str, payload: &E) -> usize {
    // 先取快照，监听者内部可以再订阅或退订
    let snapshot: Vec<Listener<E>> = match self.inner.read().get(event) {
      Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
      None => Vec::new(),
    };
    for listener in &snapshot {
      listener(payload);
    }
    debug!("事件 {} 通知了 {} 个监听者", event, snapshot.len());
    snapshot.len()
  }

  pub fn listener_count(&self, event: &str) -> usize {
    self.inner.read().get(event).map_or(0, Vec::len)
  }
}

/// 订阅句柄
pub struct Subscription {
  dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(dispose) = self.dispose.take() {
      dispose();
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.dispose.is_some())
      .finish()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

static SELECTIVE_RENDERING_BUS: LazyLock<EventBus<LabelToggledEvent>> =
  LazyLock::new(EventBus::new);

/// 进程内共享的选择性渲染总线
pub fn selective_rendering_bus() -> &'static EventBus<LabelToggledEvent> {
  &SELECTIVE_RENDERING_BUS
}
