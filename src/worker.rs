// 该文件是 Looker3d 项目的一部分。
// src/worker.rs - 后台解码线程
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

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  decode::Decode,
  transfer::{self, DecodeRequest, TransferReceiver},
};

const WORKER_NAME: &str = "label-decoder";

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("无法启动解码线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("解码线程已停止")]
  Stopped,
}

/// 在独立线程上运行解码器，结果通过移交通道送回
pub struct DecodeWorker {
  requests: Option<mpsc::Sender<DecodeRequest>>,
  handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
  pub fn spawn<D>(decoder: D) -> Result<(DecodeWorker, TransferReceiver), WorkerError>
  where
    D: Decode + Send + 'static,
    D::Error: std::fmt::Display,
  {
    let (request_tx, request_rx) = mpsc::channel::<DecodeRequest>();
    let (batch_tx, batch_rx) = transfer::channel();

    let handle = thread::Builder::new()
      .name(WORKER_NAME.to_string())
      .spawn(move || {
        info!("解码线程启动");
        for request in request_rx {
          let sample_id = request.sample_id.clone();
          let batch = match decoder.decode(request) {
            Ok(batch) => batch,
            Err(e) => {
              error!("样本 {} 解码失败: {}", sample_id, e);
              continue;
            }
          };
          if let Err(e) = batch_tx.send(batch) {
            // 接收端已关闭时退出
            debug!("样本 {} 的结果无法移交: {}", sample_id, e);
            if matches!(e, transfer::TransferError::Disconnected) {
              break;
            }
          }
        }
        info!("解码线程退出");
      })?;

    Ok((
      DecodeWorker {
        requests: Some(request_tx),
        handle: Some(handle),
      },
      batch_rx,
    ))
  }

  pub fn submit(&self, request: DecodeRequest) -> Result<(), WorkerError> {
    let requests = self.requests.as_ref().ok_or(WorkerError::Stopped)?;
    requests.send(request).map_err(|_| WorkerError::Stopped)
  }

  /// 停止接收请求并等待线程处理完已提交的请求
  pub fn shutdown(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    self.requests.take();
    if let Some(handle) = self.handle.take()
      && handle.join().is_err()
    {
      error!("解码线程异常退出");
    }
  }
}

impl Drop for DecodeWorker {
  fn drop(&mut self) {
    self.stop();
  }
}
