// 该文件是 Menshi （门识） 项目的一部分。
// src/task.rs - 实时循环调度
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
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use tokio::{
  sync::watch,
  task::JoinHandle,
  time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
  config::{LoopMode, PipelineConfig},
  error::PipelineError,
  inference::{InferenceEngine, RankedResult},
  input::{CaptureProvider, FrameSource},
  model::{ModelLoader, ModelManager, ModelState},
  output::{Published, ResultBoard},
};

/// 实时循环的生命周期状态：`Idle → Starting → Running → Stopping → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
  #[default]
  Idle,
  Starting,
  Running,
  Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSession {
  pub running: bool,
  pub mode: LoopMode,
}

/// 展示层可读取的全部状态
#[derive(Debug, Clone)]
pub struct PipelineStatus {
  pub session: SessionState,
  pub model: ModelState,
  pub latest: Option<Published>,
  pub last_error: Option<PipelineError>,
}

/// 视频流模式下的自我节流
///
/// 宿主的每一次调度机会都会询问 `admit`，距离上一次执行不足最小间隔时跳过。
#[derive(Debug)]
pub struct FrameThrottle {
  min_interval: Duration,
  last: Option<Instant>,
}

impl FrameThrottle {
  pub fn new(min_interval: Duration) -> Self {
    Self {
      min_interval,
      last: None,
    }
  }

  pub fn admit(&mut self, now: Instant) -> bool {
    match self.last {
      Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
      _ => {
        self.last = Some(now);
        true
      }
    }
  }
}

struct SessionHandle {
  id: u64,
  cancel: watch::Sender<bool>,
  task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Control {
  next_id: u64,
  session: Option<SessionHandle>,
  /// 已停止但可能仍在完成最后一轮迭代的循环任务
  draining: Option<JoinHandle<()>>,
}

struct Shared<P: CaptureProvider, L: ModelLoader> {
  config: PipelineConfig,
  source: tokio::sync::Mutex<FrameSource<P>>,
  models: ModelManager<L>,
  engine: InferenceEngine,
  board: ResultBoard,
  control: Mutex<Control>,
  state: watch::Sender<SessionState>,
  last_error: Mutex<Option<PipelineError>>,
  /// 正在进行的快照数量
  snapshots: watch::Sender<usize>,
}

/// 快照期间持有，结束（包括被取消）时计数减一
struct SnapshotGuard<'a> {
  count: &'a watch::Sender<usize>,
}

impl<'a> SnapshotGuard<'a> {
  fn enter(count: &'a watch::Sender<usize>) -> Self {
    count.send_modify(|n| *n += 1);
    Self { count }
  }
}

impl Drop for SnapshotGuard<'_> {
  fn drop(&mut self) {
    self.count.send_modify(|n| *n = n.saturating_sub(1));
  }
}

/// 实时循环调度器
///
/// 视频流与拍照两种模式共用同一个状态机，区别只在于重新触发的策略：
/// 视频流模式按固定节拍轮询并自我节流，拍照模式在上一轮完成后延时触发。
/// 同一时刻至多只有一个会话在运行，迭代之间严格串行。
pub struct Scheduler<P: CaptureProvider, L: ModelLoader> {
  shared: Arc<Shared<P, L>>,
}

impl<P: CaptureProvider, L: ModelLoader> Clone for Scheduler<P, L> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
  // 发送端被丢弃同样视为取消
  let _ = rx.wait_for(|stopped| *stopped).await;
}

impl<P: CaptureProvider, L: ModelLoader> Scheduler<P, L> {
  pub fn new(config: PipelineConfig, provider: P, loader: L) -> Self {
    let engine = InferenceEngine::from_config(&config);
    let (state, _) = watch::channel(SessionState::Idle);
    let (snapshots, _) = watch::channel(0);
    Self {
      shared: Arc::new(Shared {
        config,
        source: tokio::sync::Mutex::new(FrameSource::new(provider)),
        models: ModelManager::new(loader),
        engine,
        board: ResultBoard::new(),
        control: Mutex::new(Control::default()),
        state,
        last_error: Mutex::new(None),
        snapshots,
      }),
    }
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.shared.config
  }

  pub fn engine(&self) -> &InferenceEngine {
    &self.shared.engine
  }

  pub fn models(&self) -> &ModelManager<L> {
    &self.shared.models
  }

  pub fn board(&self) -> &ResultBoard {
    &self.shared.board
  }

  pub fn state(&self) -> SessionState {
    *self.shared.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
    self.shared.state.subscribe()
  }

  pub fn subscribe_results(&self) -> watch::Receiver<Option<Published>> {
    self.shared.board.subscribe()
  }

  pub fn session(&self) -> LiveSession {
    LiveSession {
      running: self.state() == SessionState::Running,
      mode: self.shared.config.mode,
    }
  }

  pub fn last_error(&self) -> Option<PipelineError> {
    self.lock_last_error().clone()
  }

  pub fn status(&self) -> PipelineStatus {
    PipelineStatus {
      session: self.state(),
      model: self.shared.models.state(),
      latest: self.shared.board.latest(),
      last_error: self.last_error(),
    }
  }

  /// 启动实时循环
  ///
  /// 已处于 `Starting`/`Running` 时直接返回当前状态。
  /// 打开视频流或加载模型失败时回到 `Idle`，错误同时记录在 `last_error` 中。
  pub async fn start(&self) -> Result<PipelineStatus, PipelineError> {
    let (id, previous) = {
      let mut control = self.lock_control();
      let state = self.state();
      if matches!(state, SessionState::Starting | SessionState::Running) {
        debug!("会话已处于 {:?}，忽略 start()", state);
        drop(control);
        return Ok(self.status());
      }

      control.next_id += 1;
      let id = control.next_id;
      let (cancel, _) = watch::channel(false);
      control.session = Some(SessionHandle {
        id,
        cancel,
        task: None,
      });
      self.set_state(SessionState::Starting);
      (id, control.draining.take())
    };
    info!("会话 {} 启动中 ({:?} 模式)", id, self.shared.config.mode);

    if let Some(task) = previous {
      debug!("等待上一个会话结束");
      if let Err(e) = task.await {
        error!("上一个会话任务异常退出: {}", e);
      }
    }

    if let Err(err) = self.prepare(id).await {
      self.shared.source.lock().await.release(id);
      let aborted = {
        let mut control = self.lock_control();
        let current = control.session.as_ref().is_some_and(|s| s.id == id);
        if current {
          control.session = None;
          self.set_state(SessionState::Idle);
        }
        current
      };
      if aborted {
        error!("会话 {} 启动失败: {}", id, err);
        *self.lock_last_error() = Some(err.clone());
      }
      return Err(err);
    }

    let launched = {
      let mut control = self.lock_control();
      match control.session.as_mut() {
        Some(session) if session.id == id && !*session.cancel.borrow() => {
          let task = tokio::spawn(run_loop(
            self.shared.clone(),
            id,
            session.cancel.subscribe(),
          ));
          session.task = Some(task);
          self.set_state(SessionState::Running);
          true
        }
        _ => false,
      }
    };

    if launched {
      *self.lock_last_error() = None;
      info!("会话 {} 已运行", id);
    } else {
      info!("会话 {} 在启动期间被停止", id);
      self.shared.source.lock().await.release(id);
    }
    Ok(self.status())
  }

  /// 停止实时循环
  ///
  /// 不等待正在进行的迭代；该迭代结束后会发现会话已停止并丢弃结果，
  /// 随后由循环任务自己释放视频流。
  pub fn stop(&self) {
    let mut control = self.lock_control();
    let state = self.state();
    if !matches!(state, SessionState::Starting | SessionState::Running) {
      debug!("会话处于 {:?}，忽略 stop()", state);
      return;
    }

    self.set_state(SessionState::Stopping);
    if let Some(session) = control.session.take() {
      session.cancel.send_replace(true);
      if let Some(task) = session.task {
        if control.draining.replace(task).is_some() {
          warn!("上一个会话仍未结束，不再等待它");
        }
      }
      info!("会话 {} 已停止", session.id);
    }
    self.set_state(SessionState::Idle);
  }

  /// 卸载：停止循环，等待最后一轮迭代与进行中的快照结束，然后依次释放视频流与模型
  pub async fn teardown(&self) {
    self.stop();

    let task = self.lock_control().draining.take();
    if let Some(task) = task {
      if let Err(e) = task.await {
        error!("会话任务异常退出: {}", e);
      }
    }

    let mut snapshots = self.shared.snapshots.subscribe();
    let pending = *snapshots.borrow();
    if pending > 0 {
      debug!("等待 {} 个进行中的快照结束", pending);
    }
    // 发送端由 Shared 持有，不会提前关闭
    let _ = snapshots.wait_for(|n| *n == 0).await;

    if self.shared.source.lock().await.release_all() {
      info!("已关闭视频流");
    }
    self.shared.models.release();
    info!("流水线已卸载");
  }

  /// 单次快照：独立于实时会话完成一次 采集 → 预处理 → 推理 → 发布
  pub async fn snapshot_once(&self) -> Result<RankedResult, PipelineError> {
    let _guard = SnapshotGuard::enter(&self.shared.snapshots);
    let result = self.snapshot_inner().await;
    if let Err(err) = &result {
      warn!("快照失败: {}", err);
      if err.is_session_level() {
        *self.lock_last_error() = Some(err.clone());
      }
    }
    result
  }

  async fn snapshot_inner(&self) -> Result<RankedResult, PipelineError> {
    let model = self.shared.models.ensure_loaded().await?;
    let raw = {
      let mut source = self.shared.source.lock().await;
      source.snapshot(&self.shared.config.stream).await?
    };
    let ranked = self.shared.engine.classify(&*model, raw).await?;
    let sequence = self.shared.board.publish(ranked.clone());
    debug!("快照结果已发布 #{}", sequence);
    Ok(ranked)
  }

  async fn prepare(&self, id: u64) -> Result<(), PipelineError> {
    self
      .shared
      .source
      .lock()
      .await
      .acquire(id, &self.shared.config.stream)
      .await?;
    self.shared.models.ensure_loaded().await?;
    Ok(())
  }

  fn set_state(&self, next: SessionState) {
    self.shared.state.send_if_modified(|state| {
      if *state == next {
        false
      } else {
        trace!("会话状态 {:?} -> {:?}", state, next);
        *state = next;
        true
      }
    });
  }

  fn lock_control(&self) -> MutexGuard<'_, Control> {
    self
      .shared
      .control
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_last_error(&self) -> MutexGuard<'_, Option<PipelineError>> {
    self
      .shared
      .last_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

impl<P: CaptureProvider, L: ModelLoader> Shared<P, L> {
  /// 执行一轮迭代；返回 `false` 表示会话已停止，不应再次触发
  async fn iterate(&self, cancel: &watch::Receiver<bool>) -> bool {
    let frame = self.source.lock().await.next_frame().await;
    let raw = match frame {
      Ok(Some(raw)) => raw,
      Ok(None) => {
        trace!("帧源尚未就绪，跳过本轮");
        return !*cancel.borrow();
      }
      Err(err) => {
        warn!("采集失败，跳过本轮: {}", err);
        return !*cancel.borrow();
      }
    };

    let Some(model) = self.models.current() else {
      warn!("模型未就绪，跳过本轮");
      return !*cancel.borrow();
    };
    let now = std::time::Instant::now();
    let result = self.engine.classify(&*model, raw).await;
    drop(model);

    // 发布与重新触发之前检查会话是否仍在运行
    if *cancel.borrow() {
      debug!("会话已停止，丢弃本轮结果");
      return false;
    }

    match result {
      Ok(ranked) => {
        let sequence = self.board.publish(ranked);
        debug!("第 {} 个结果已发布，耗时: {:.2?}", sequence, now.elapsed());
      }
      Err(err) => warn!("本轮处理失败: {}", err),
    }
    true
  }
}

async fn run_loop<P: CaptureProvider, L: ModelLoader>(
  shared: Arc<Shared<P, L>>,
  id: u64,
  mut cancel: watch::Receiver<bool>,
) {
  debug!("会话 {} 的循环任务开始", id);

  match shared.config.mode {
    LoopMode::Stream => {
      let mut ticker = tokio::time::interval(shared.config.tick_interval());
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      let mut throttle = FrameThrottle::new(shared.config.min_frame_interval());

      loop {
        let now = tokio::select! {
          biased;
          _ = cancelled(&mut cancel) => break,
          now = ticker.tick() => now,
        };
        if !throttle.admit(now) {
          continue;
        }
        if !shared.iterate(&cancel).await {
          break;
        }
      }
    }
    LoopMode::Discrete => {
      let rearm_delay = shared.config.rearm_delay();
      loop {
        if *cancel.borrow() || !shared.iterate(&cancel).await {
          break;
        }
        tokio::select! {
          biased;
          _ = cancelled(&mut cancel) => break,
          _ = tokio::time::sleep(rearm_delay) => {}
        }
      }
    }
  }

  shared.source.lock().await.release(id);
  debug!("会话 {} 的循环任务结束", id);
}
