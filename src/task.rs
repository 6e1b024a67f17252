// 该文件是 Looker3d 项目的一部分。
// src/task.rs - 任务编排
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

use std::{thread, time::Duration, time::Instant};
use tracing::{debug, info, warn};

use crate::{
  decode::Decode,
  label::SampleGroup,
  output::Render,
  overlay::{ColoringConfig, TagFilter},
  scene::{Scene, ThreeDLabels},
  settings::Looker3dSettings,
  worker::DecodeWorker,
};

const DEFAULT_DECODE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, decoder: M, output: O) -> Result<(), Self::Error>;
}

/// 场景的着色、过滤与设置
#[derive(Debug, Clone, Default)]
pub struct SceneOptions {
  pub settings: Looker3dSettings,
  pub coloring: ColoringConfig,
  pub filter: TagFilter,
}

impl SceneOptions {
  fn mount(&self) -> ThreeDLabels {
    let mut labels = ThreeDLabels::mount(
      |selection| info!("选中标签: {:?}", selection),
      |toggled| debug!("标签切换: {:?}", toggled),
    );
    labels.set_settings(self.settings.clone());
    labels.set_coloring(self.coloring.clone());
    labels.set_filter(self.filter.clone());
    labels
  }
}

pub struct OneShotTask {
  options: SceneOptions,
  timeout: Duration,
}

impl OneShotTask {
  pub fn new(options: SceneOptions) -> Self {
    OneShotTask {
      options,
      timeout: DEFAULT_DECODE_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = SampleGroup>,
  M: Decode<Error = ME> + Send + 'static,
  O: Render<SampleGroup, Scene, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, decoder: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let group = input.next().ok_or_else(|| anyhow::anyhow!("没有输入样本"))?;
    let frame = group.shell();
    let (worker, receiver) = DecodeWorker::spawn(decoder)?;
    let mut labels = self.options.mount();

    let now = Instant::now();
    let requests = labels.load_group(group);
    let pending = requests.len();
    for request in requests {
      worker.submit(request)?;
    }
    info!("首轮渲染 {} 个节点，等待解码...", labels.render().len());

    for _ in 0..pending {
      let batch = receiver.recv_timeout(self.timeout)?;
      labels.receive(batch);
    }
    info!("解码完成，耗时: {:.2?}", now.elapsed());

    output.render_result(&frame, labels.render())?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    labels.unmount();
    worker.shutdown();
    Ok(())
  }
}

/// 反复解码同一组样本，统计解码耗时
pub struct RepeatShotTask {
  options: SceneOptions,
  repeat_times: usize,
}

impl RepeatShotTask {
  pub fn new(options: SceneOptions) -> Self {
    RepeatShotTask {
      options,
      repeat_times: 1000,
    }
  }

  pub fn with_repeat_times(mut self, repeat_times: usize) -> Self {
    self.repeat_times = repeat_times.max(3);
    self
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = SampleGroup>,
  M: Decode<Error = ME>,
  O: Render<SampleGroup, Scene, Error = RE>,
> Task<I, M, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, decoder: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let group = input.next().ok_or_else(|| anyhow::anyhow!("没有输入样本"))?;
    let frame = group.shell();
    let mut labels = self.options.mount();

    let mut times = Vec::with_capacity(self.repeat_times);
    for i in 0..self.repeat_times {
      let requests = labels.load_group(group.clone_undecoded());
      let now = Instant::now();
      for request in requests {
        let batch = decoder.decode(request)?;
        labels.receive(batch);
      }
      let elapsed = now.elapsed();
      debug!("({})解码完成，耗时: {:.2?}", i, elapsed);
      output.render_result(&frame, labels.render())?;
      times.push(elapsed);
    }

    warn!(
      "平均解码时间: {:.2?}",
      times.iter().skip(2).sum::<Duration>() / (times.len() - 2) as u32
    );

    labels.unmount();
    Ok(())
  }
}

/// 持续读取样本，渲染端以轮询方式接收解码结果
pub struct ContinuousTask {
  options: SceneOptions,
  frame_number: Option<usize>,
  timeout: Duration,
  poll_interval: Duration,
}

impl ContinuousTask {
  pub fn new(options: SceneOptions) -> Self {
    ContinuousTask {
      options,
      frame_number: None,
      timeout: DEFAULT_DECODE_TIMEOUT,
      poll_interval: Duration::from_millis(5),
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = SampleGroup>,
  M: Decode<Error = ME> + Send + 'static,
  O: Render<SampleGroup, Scene, Error = RE>,
> Task<I, M, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, decoder: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = std::sync::mpsc::channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let (worker, receiver) = DecodeWorker::spawn(decoder)?;
    let mut labels = self.options.mount();

    let mut frame_index = 0usize;
    for group in input {
      frame_index = frame_index.wrapping_add(1);
      info!("处理第 {} 组样本", frame_index);
      let frame = group.shell();
      let now = Instant::now();

      // 上一组未完成的结果会在到达时被丢弃
      let requests = labels.load_group(group);
      let mut pending = requests.len();
      for request in requests {
        worker.submit(request)?;
      }
      debug!("首轮渲染 {} 个节点", labels.render().len());

      while pending > 0 {
        pending = pending.saturating_sub(labels.poll(&receiver)?);
        if pending == 0 {
          break;
        }
        if now.elapsed() > self.timeout {
          warn!("第 {} 组样本仍有 {} 个解码结果未到达", frame_index, pending);
          break;
        }
        thread::sleep(self.poll_interval);
      }
      let elapsed_a = now.elapsed();

      output.render_result(&frame, labels.render())?;
      let elapsed_b = now.elapsed();
      info!("解码完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定数量 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    labels.unmount();
    worker.shutdown();
    info!("任务完成，退出");
    Ok(())
  }
}
