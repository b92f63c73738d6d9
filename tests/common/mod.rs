// 该文件是 Menshi （门识） 项目的一部分。
// tests/common/mod.rs - 集成测试用的相机与模型替身
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

#![allow(dead_code)]

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use menshi::{
  LabelSet, LoopMode, PipelineConfig, Scheduler,
  config::StreamConfig,
  frame::{ModelOutput, NormalizedTensor, RawImage, Tensor},
  input::{CaptureError, CaptureProvider, Permission},
  model::{Classifier, ModelError, ModelLoader},
};

pub fn good_frame() -> RawImage {
  RawImage::Rgb {
    width: 4,
    height: 4,
    data: vec![200; 4 * 4 * 3],
  }
}

pub fn config(mode: LoopMode) -> PipelineConfig {
  PipelineConfig::default()
    .with_input_size(4)
    .with_labels(LabelSet::new(["OR", "AND", "NOT"]))
    .with_mode(mode)
}

#[derive(Default)]
pub struct CameraStats {
  pub opens: AtomicUsize,
  pub closes: AtomicUsize,
  pub captures: AtomicUsize,
}

impl CameraStats {
  pub fn opens(&self) -> usize {
    self.opens.load(Ordering::SeqCst)
  }

  pub fn closes(&self) -> usize {
    self.closes.load(Ordering::SeqCst)
  }

  pub fn captures(&self) -> usize {
    self.captures.load(Ordering::SeqCst)
  }
}

/// 按脚本循环给出帧；`None` 表示帧源未就绪
pub struct FakeCamera {
  pub stats: Arc<CameraStats>,
  permission: Permission,
  open_error: Option<CaptureError>,
  script: Vec<Option<RawImage>>,
}

pub struct FakeStream {
  cursor: usize,
}

impl FakeCamera {
  pub fn new() -> Self {
    Self {
      stats: Arc::new(CameraStats::default()),
      permission: Permission::Granted,
      open_error: None,
      script: vec![Some(good_frame())],
    }
  }

  pub fn denied(mut self) -> Self {
    self.permission = Permission::Denied;
    self
  }

  pub fn failing_open(mut self, error: CaptureError) -> Self {
    self.open_error = Some(error);
    self
  }

  pub fn with_script(mut self, script: Vec<Option<RawImage>>) -> Self {
    self.script = script;
    self
  }
}

impl CaptureProvider for FakeCamera {
  type Stream = FakeStream;

  async fn request_permission(&mut self) -> Permission {
    self.permission
  }

  async fn open_stream(&mut self, _config: &StreamConfig) -> Result<FakeStream, CaptureError> {
    if let Some(err) = &self.open_error {
      return Err(err.clone());
    }
    self.stats.opens.fetch_add(1, Ordering::SeqCst);
    Ok(FakeStream { cursor: 0 })
  }

  async fn capture_frame(
    &mut self,
    stream: &mut FakeStream,
  ) -> Result<Option<RawImage>, CaptureError> {
    self.stats.captures.fetch_add(1, Ordering::SeqCst);
    let frame = self.script[stream.cursor % self.script.len()].clone();
    stream.cursor += 1;
    Ok(frame)
  }

  fn close_stream(&mut self, _stream: FakeStream) {
    self.stats.closes.fetch_add(1, Ordering::SeqCst);
  }
}

#[derive(Default)]
pub struct ModelStats {
  pub loads: AtomicUsize,
  pub predicts: AtomicUsize,
  pub disposes: AtomicUsize,
  pub in_flight: AtomicUsize,
  pub max_in_flight: AtomicUsize,
  pub used_after_dispose: AtomicUsize,
  disposed: AtomicBool,
}

impl ModelStats {
  pub fn loads(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }

  pub fn predicts(&self) -> usize {
    self.predicts.load(Ordering::SeqCst)
  }

  pub fn disposes(&self) -> usize {
    self.disposes.load(Ordering::SeqCst)
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  pub fn used_after_dispose(&self) -> usize {
    self.used_after_dispose.load(Ordering::SeqCst)
  }
}

pub struct FakeModel {
  stats: Arc<ModelStats>,
  probabilities: Vec<f32>,
  predict_delay: Duration,
}

impl Classifier for FakeModel {
  async fn predict(&self, _input: &NormalizedTensor) -> Result<ModelOutput, ModelError> {
    let stats = &self.stats;
    let running = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_in_flight.fetch_max(running, Ordering::SeqCst);

    if !self.predict_delay.is_zero() {
      tokio::time::sleep(self.predict_delay).await;
    }
    if stats.disposed.load(Ordering::SeqCst) {
      stats.used_after_dispose.fetch_add(1, Ordering::SeqCst);
    }

    stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    stats.predicts.fetch_add(1, Ordering::SeqCst);
    Ok(ModelOutput::Single(Tensor::from(self.probabilities.clone())))
  }

  fn dispose(&self) {
    self.stats.disposed.store(true, Ordering::SeqCst);
    self.stats.disposes.fetch_add(1, Ordering::SeqCst);
  }
}

pub struct FakeLoader {
  pub stats: Arc<ModelStats>,
  fail_first: AtomicBool,
  load_delay: Duration,
  predict_delay: Duration,
}

impl FakeLoader {
  pub fn new() -> Self {
    Self {
      stats: Arc::new(ModelStats::default()),
      fail_first: AtomicBool::new(false),
      load_delay: Duration::from_millis(50),
      predict_delay: Duration::ZERO,
    }
  }

  pub fn failing_first(self) -> Self {
    self.fail_first.store(true, Ordering::SeqCst);
    self
  }

  pub fn with_load_delay(mut self, delay: Duration) -> Self {
    self.load_delay = delay;
    self
  }

  pub fn with_predict_delay(mut self, delay: Duration) -> Self {
    self.predict_delay = delay;
    self
  }
}

impl ModelLoader for FakeLoader {
  type Model = FakeModel;

  async fn load(&self) -> Result<FakeModel, ModelError> {
    self.stats.loads.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.load_delay).await;
    if self.fail_first.swap(false, Ordering::SeqCst) {
      return Err(ModelError::Invalid("truncated weights".to_string()));
    }
    self.stats.disposed.store(false, Ordering::SeqCst);
    Ok(FakeModel {
      stats: self.stats.clone(),
      probabilities: vec![0.7, 0.2, 0.1],
      predict_delay: self.predict_delay,
    })
  }
}

pub struct Harness {
  pub scheduler: Scheduler<FakeCamera, FakeLoader>,
  pub camera: Arc<CameraStats>,
  pub model: Arc<ModelStats>,
}

pub fn harness(config: PipelineConfig, camera: FakeCamera, loader: FakeLoader) -> Harness {
  let camera_stats = camera.stats.clone();
  let model_stats = loader.stats.clone();
  Harness {
    scheduler: Scheduler::new(config, camera, loader),
    camera: camera_stats,
    model: model_stats,
  }
}
