// 该文件是 Looker3d 项目的一部分。
// src/scene.rs - 三维标签场景
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

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
  event::{EventBus, LABEL_TOGGLED_EVENT, LabelToggledEvent, Subscription, selective_rendering_bus},
  label::{Sample, SampleGroup},
  overlay::{
    AcceptAll, ColoringConfig, LabelFilter, OverlayConfig, OverlayDescriptor, build_overlays,
  },
  settings::Looker3dSettings,
  transfer::{DecodeRequest, DecodedBatch, TransferError, TransferReceiver},
};

/// 点击叠加层时上报的选择事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionEvent {
  pub id: String,
  pub field: String,
  pub sample_id: String,
  pub instance_id: Option<String>,
  pub is_shift_pressed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneNode {
  pub key: String,
  pub overlay: OverlayDescriptor,
  pub line_width: f32,
}

/// 一次渲染得到的节点集合
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Scene {
  pub nodes: Vec<SceneNode>,
}

impl Scene {
  pub fn node(&self, key: &str) -> Option<&SceneNode> {
    self.nodes.iter().find(|n| n.key == key)
  }

  pub fn cuboids(&self) -> impl Iterator<Item = &SceneNode> {
    self
      .nodes
      .iter()
      .filter(|n| matches!(n.overlay, OverlayDescriptor::Cuboid(_)))
  }

  pub fn polylines(&self) -> impl Iterator<Item = &SceneNode> {
    self
      .nodes
      .iter()
      .filter(|n| matches!(n.overlay, OverlayDescriptor::Polyline(_)))
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

#[derive(Debug)]
struct MountedSample {
  generation: u64,
  sample: Sample,
}

/// 渲染端持有的样本，按挂载代数丢弃过期的解码结果
#[derive(Debug, Default)]
pub struct LabelStore {
  mounted: Vec<MountedSample>,
  next_generation: u64,
}

impl LabelStore {
  /// 挂载样本，同 id 的旧样本被替换；返回本次挂载的代数
  pub fn mount(&mut self, sample: Sample) -> u64 {
    self.next_generation += 1;
    let generation = self.next_generation;
    match self.mounted.iter_mut().find(|m| m.sample.id == sample.id) {
      Some(mounted) => {
        mounted.generation = generation;
        mounted.sample = sample;
      }
      None => self.mounted.push(MountedSample { generation, sample }),
    }
    generation
  }

  pub fn unmount(&mut self, sample_id: &str) -> bool {
    let before = self.mounted.len();
    self.mounted.retain(|m| m.sample.id != sample_id);
    before != self.mounted.len()
  }

  pub fn clear(&mut self) {
    self.mounted.clear();
  }

  /// 应用解码结果；样本已卸载或代数不符时丢弃，返回是否应用
  pub fn apply(&mut self, batch: DecodedBatch) -> bool {
    let Some(mounted) = self
      .mounted
      .iter_mut()
      .find(|m| m.sample.id == batch.sample_id)
    else {
      debug!("样本 {} 已卸载，丢弃解码结果", batch.sample_id);
      return false;
    };
    if mounted.generation != batch.generation {
      debug!(
        "样本 {} 的解码结果已过期 ({} != {})",
        batch.sample_id, batch.generation, mounted.generation
      );
      return false;
    }
    mounted.sample.fields = batch.labels;
    true
  }

  pub fn samples(&self) -> impl Iterator<Item = &Sample> {
    self.mounted.iter().map(|m| &m.sample)
  }

  pub fn len(&self) -> usize {
    self.mounted.len()
  }

  pub fn is_empty(&self) -> bool {
    self.mounted.is_empty()
  }
}

type SelectHandler = Box<dyn FnMut(SelectionEvent) + Send>;

/// 三维标签层：持有样本、着色与过滤状态，生成场景并处理交互
pub struct ThreeDLabels {
  store: LabelStore,
  config: OverlayConfig,
  filter: Box<dyn LabelFilter + Send>,
  on_select: SelectHandler,
  subscription: Option<Subscription>,
  scene: Scene,
  dirty: bool,
}

impl ThreeDLabels {
  /// 挂载到进程内共享的总线上
  pub fn mount<S, T>(on_select: S, on_shift_click: T) -> Self
  where
    S: FnMut(SelectionEvent) + Send + 'static,
    T: Fn(&LabelToggledEvent) + Send + Sync + 'static,
  {
    Self::mount_on(selective_rendering_bus(), on_select, on_shift_click)
  }

  pub fn mount_on<S, T>(bus: &EventBus<LabelToggledEvent>, on_select: S, on_shift_click: T) -> Self
  where
    S: FnMut(SelectionEvent) + Send + 'static,
    T: Fn(&LabelToggledEvent) + Send + Sync + 'static,
  {
    let subscription = bus.on(LABEL_TOGGLED_EVENT, on_shift_click);
    ThreeDLabels {
      store: LabelStore::default(),
      config: OverlayConfig::default(),
      filter: Box::new(AcceptAll),
      on_select: Box::new(on_select),
      subscription: Some(subscription),
      scene: Scene::default(),
      dirty: true,
    }
  }

  pub fn set_coloring(&mut self, coloring: ColoringConfig) {
    self.config.coloring = coloring;
    self.dirty = true;
  }

  pub fn set_settings(&mut self, settings: Looker3dSettings) {
    self.config.settings = settings.clamped();
    self.dirty = true;
  }

  pub fn set_filter<F>(&mut self, filter: F)
  where
    F: LabelFilter + Send + 'static,
  {
    self.filter = Box::new(filter);
    self.dirty = true;
  }

  pub fn set_selected_labels(&mut self, selected: HashSet<String>) {
    self.config.selected_labels = selected;
    self.dirty = true;
  }

  pub fn settings(&self) -> &Looker3dSettings {
    &self.config.settings
  }

  /// 挂载样本的外壳用于首轮渲染，返回交给解码线程的请求
  pub fn load_sample(&mut self, sample: Sample) -> DecodeRequest {
    let generation = self.store.mount(sample.shell());
    self.dirty = true;
    DecodeRequest {
      sample_id: sample.id,
      generation,
      labels: sample.fields,
    }
  }

  /// 用新的分组替换全部样本
  pub fn load_group(&mut self, group: SampleGroup) -> Vec<DecodeRequest> {
    self.store.clear();
    group
      .samples
      .into_iter()
      .map(|sample| self.load_sample(sample))
      .collect()
  }

  pub fn unmount_sample(&mut self, sample_id: &str) -> bool {
    let removed = self.store.unmount(sample_id);
    self.dirty |= removed;
    removed
  }

  pub fn receive(&mut self, batch: DecodedBatch) -> bool {
    let applied = self.store.apply(batch);
    self.dirty |= applied;
    applied
  }

  /// 非阻塞地取走所有已到达的结果，返回应用的数量
  pub fn poll(&mut self, receiver: &TransferReceiver) -> Result<usize, TransferError> {
    let mut applied = 0;
    while let Some(batch) = receiver.try_recv()? {
      if self.receive(batch) {
        applied += 1;
      }
    }
    Ok(applied)
  }

  /// 状态变化后重新生成场景
  pub fn render(&mut self) -> &Scene {
    if self.dirty {
      let settings = &self.config.settings;
      let nodes = build_overlays(self.store.samples(), &self.config, self.filter.as_ref())
        .into_iter()
        .map(|overlay| {
          let line_width = match overlay {
            OverlayDescriptor::Cuboid(_) => settings.cuboid_line_width,
            OverlayDescriptor::Polyline(_) => settings.polyline_line_width,
          };
          SceneNode {
            key: overlay.key(),
            overlay,
            line_width,
          }
        })
        .collect();
      self.scene = Scene { nodes };
      self.dirty = false;
      debug!("场景重建完成，共 {} 个节点", self.scene.len());
    }
    &self.scene
  }

  /// 点击节点，向选择回调上报；节点不存在时返回 false
  pub fn click(&mut self, key: &str, is_shift_pressed: bool) -> bool {
    self.render();
    let Some(node) = self.scene.node(key) else {
      return false;
    };
    let common = node.overlay.common();
    let event = SelectionEvent {
      id: common.id.clone(),
      field: common.path.clone(),
      sample_id: common.sample_id.clone(),
      instance_id: common.instance_id.clone(),
      is_shift_pressed,
    };
    (self.on_select)(event);
    true
  }

  pub fn canonical_sample_id(&self) -> Option<&str> {
    self.store.samples().next().map(|s| s.id.as_str())
  }

  pub fn store(&self) -> &LabelStore {
    &self.store
  }

  /// 卸载并注销总线订阅
  pub fn unmount(mut self) {
    if let Some(subscription) = self.subscription.take() {
      subscription.unsubscribe();
    }
    info!("三维标签层已卸载");
  }
}
