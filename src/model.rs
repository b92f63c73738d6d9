// 该文件是 Menshi （门识） 项目的一部分。
// src/model.rs - 模型接口与生命周期管理
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
  future::Future,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Instant,
};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::frame::{ModelOutput, NormalizedTensor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("模型文件读取失败: {0}")]
  Io(String),
  #[error("模型无效: {0}")]
  Invalid(String),
  #[error("模型推理失败: {0}")]
  Predict(String),
  #[error("模型在加载完成前已被释放")]
  Released,
}

impl From<std::io::Error> for ModelError {
  fn from(err: std::io::Error) -> Self {
    ModelError::Io(err.to_string())
  }
}

/// 已加载的分类模型
///
/// 加载后只读共享，所有推理调用共用同一个实例。
pub trait Classifier: Send + Sync + 'static {
  fn predict(
    &self,
    input: &NormalizedTensor,
  ) -> impl Future<Output = Result<ModelOutput, ModelError>> + Send;

  /// 释放模型占用的资源，由 [`ModelManager::release`] 调用一次
  fn dispose(&self) {}
}

/// 外部模型加载器：取得模型字节并构造模型
pub trait ModelLoader: Send + Sync + 'static {
  type Model: Classifier;

  fn load(&self) -> impl Future<Output = Result<Self::Model, ModelError>> + Send;
}

/// 全进程唯一的已加载模型
pub type ModelHandle<M> = Arc<M>;

/// 供展示层观察的模型状态
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ModelState {
  #[default]
  Unloaded,
  Loading,
  Ready,
  Error(String),
}

enum Slot<M> {
  Empty,
  /// `release_requested` 表示加载期间收到了 `release`，加载完成后立即释放
  Loading { release_requested: bool },
  Ready(ModelHandle<M>),
  Failed(ModelError),
}

/// 模型生命周期管理
///
/// - 已有句柄时同步返回；
/// - 正在加载时，后来的调用者等待同一次加载的结果，不会再发起第二次加载；
/// - 加载失败不是粘滞的，下一次 `ensure_loaded` 会重新尝试；
/// - `release` 幂等；加载期间调用时，模型在加载完成后立即释放。
pub struct ModelManager<L: ModelLoader> {
  loader: L,
  slot: Mutex<Slot<L::Model>>,
  state: watch::Sender<ModelState>,
}

impl<L: ModelLoader> ModelManager<L> {
  pub fn new(loader: L) -> Self {
    let (state, _) = watch::channel(ModelState::Unloaded);
    Self {
      loader,
      slot: Mutex::new(Slot::Empty),
      state,
    }
  }

  pub fn state(&self) -> ModelState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ModelState> {
    self.state.subscribe()
  }

  /// 当前已就绪的句柄（不会触发加载）
  pub fn current(&self) -> Option<ModelHandle<L::Model>> {
    match &*self.lock_slot() {
      Slot::Ready(model) => Some(model.clone()),
      _ => None,
    }
  }

  pub async fn ensure_loaded(&self) -> Result<ModelHandle<L::Model>, ModelError> {
    loop {
      let waiter = {
        let mut slot = self.lock_slot();
        if let Slot::Ready(model) = &*slot {
          return Ok(model.clone());
        }
        if matches!(*slot, Slot::Loading { .. }) {
          Some(self.state.subscribe())
        } else {
          *slot = Slot::Loading {
            release_requested: false,
          };
          self.set_state(ModelState::Loading);
          None
        }
      };
      let Some(mut rx) = waiter else {
        return self.load_now().await;
      };

      debug!("模型正在加载，等待同一次加载结果");
      if rx.wait_for(|s| *s != ModelState::Loading).await.is_err() {
        return Err(ModelError::Invalid("模型管理器已销毁".to_string()));
      }

      match &*self.lock_slot() {
        Slot::Ready(model) => return Ok(model.clone()),
        Slot::Failed(err) => return Err(err.clone()),
        // 被释放或被新的加载接手，重新判断
        Slot::Empty | Slot::Loading { .. } => continue,
      }
    }
  }

  /// 释放模型；没有模型时什么也不做
  pub fn release(&self) {
    let released = {
      let mut slot = self.lock_slot();
      match std::mem::replace(&mut *slot, Slot::Empty) {
        Slot::Ready(model) => Some(model),
        Slot::Loading { .. } => {
          *slot = Slot::Loading {
            release_requested: true,
          };
          info!("模型仍在加载中，加载完成后立即释放");
          return;
        }
        Slot::Empty | Slot::Failed(_) => None,
      }
    };

    if let Some(model) = released {
      info!("释放模型资源");
      model.dispose();
      if Arc::strong_count(&model) > 1 {
        warn!("释放时仍有 {} 处引用模型句柄", Arc::strong_count(&model) - 1);
      }
    }
    self.set_state(ModelState::Unloaded);
  }

  async fn load_now(&self) -> Result<ModelHandle<L::Model>, ModelError> {
    info!("开始加载模型");
    let now = Instant::now();
    let mut guard = LoadGuard {
      manager: self,
      armed: true,
    };
    let result = self.loader.load().await;
    guard.armed = false;

    let mut slot = self.lock_slot();
    match result {
      Ok(model) if matches!(*slot, Slot::Loading { release_requested: true }) => {
        *slot = Slot::Failed(ModelError::Released);
        self.set_state(ModelState::Unloaded);
        drop(slot);
        warn!("模型加载期间收到释放请求，立即释放");
        model.dispose();
        Err(ModelError::Released)
      }
      Ok(model) => {
        let model = Arc::new(model);
        *slot = Slot::Ready(model.clone());
        self.set_state(ModelState::Ready);
        info!("模型加载完成，耗时: {:.2?}", now.elapsed());
        Ok(model)
      }
      Err(err) => {
        error!("模型加载失败: {}", err);
        *slot = Slot::Failed(err.clone());
        self.set_state(ModelState::Error(err.to_string()));
        Err(err)
      }
    }
  }

  fn set_state(&self, next: ModelState) {
    self.state.send_if_modified(|state| {
      if *state == next {
        false
      } else {
        *state = next;
        true
      }
    });
  }

  fn lock_slot(&self) -> MutexGuard<'_, Slot<L::Model>> {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// 加载中途被取消时把状态复位，避免永远停在 Loading
struct LoadGuard<'a, L: ModelLoader> {
  manager: &'a ModelManager<L>,
  armed: bool,
}

impl<L: ModelLoader> Drop for LoadGuard<'_, L> {
  fn drop(&mut self) {
    if self.armed {
      warn!("模型加载被取消");
      *self.manager.lock_slot() = Slot::Empty;
      self.manager.set_state(ModelState::Unloaded);
    }
  }
}

#[cfg(feature = "model_dense")]
mod dense;
#[cfg(feature = "model_dense")]
pub use self::dense::{DenseLoader, DenseModel};
