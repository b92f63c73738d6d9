// 该文件是 Menshi （门识） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::{borrow::Cow, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_INPUT_SIZE: u32 = 224;
pub const DEFAULT_MIN_FRAME_INTERVAL_MS: u64 = 200;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 16;
pub const DEFAULT_REARM_DELAY_MS: u64 = 700;

/// 默认标签，与模型导出时的类别目录顺序（字母序）一致
const GATE_LABELS: [&str; 3] = ["AND", "NOT", "OR"];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] toml::de::Error),
}

/// 实时循环的调度方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopMode {
  /// 连续视频流：按帧回调轮询，并按最小间隔自我节流
  #[default]
  Stream,
  /// 离散拍照：上一轮完成后再延时触发下一轮
  Discrete,
}

/// 像素归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
  /// v / 255，结果位于 [0, 1]
  #[default]
  Unit,
  /// v / 127.5 - 1，结果位于 [-1, 1]
  Symmetric,
}

impl Normalization {
  #[inline]
  pub fn apply(self, value: u8) -> f32 {
    match self {
      Normalization::Unit => value as f32 / 255.0,
      Normalization::Symmetric => value as f32 / 127.5 - 1.0,
    }
  }
}

/// 摄像头朝向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Facing {
  Front,
  #[default]
  Environment,
}

/// 打开视频流时的期望参数
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
  pub width: u32,
  pub height: u32,
  pub facing: Facing,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      width: 640,
      height: 480,
      facing: Facing::Environment,
    }
  }
}

/// 有序标签序列，下标与模型输出向量位置一一对应
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LabelSet(Vec<String>);

#[derive(Deserialize)]
struct LabelFile {
  labels: LabelSet,
}

impl LabelSet {
  pub fn new<I, S>(labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(labels.into_iter().map(Into::into).collect())
  }

  /// 从 TOML 标签文件读取，格式为 `labels = ["AND", "NOT", "OR"]`
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let file: LabelFile = toml::from_str(&text)?;
    debug!("从 {} 读取 {} 个标签", path.display(), file.labels.len());
    Ok(file.labels)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.0.get(index).map(String::as_str)
  }

  /// 下标对应的标签；超出配置范围时合成 `class_<index>`
  pub fn name(&self, index: usize) -> Cow<'_, str> {
    match self.get(index) {
      Some(label) => Cow::Borrowed(label),
      None => Cow::Owned(format!("class_{}", index)),
    }
  }
}

impl Default for LabelSet {
  fn default() -> Self {
    Self::new(GATE_LABELS)
  }
}

/// 启动时确定、运行期不可修改的流水线配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// 模型输入边长 S，张量形状为 [1, S, S, 3]
  pub input_size: u32,
  pub labels: LabelSet,
  pub mode: LoopMode,
  pub normalization: Normalization,
  /// 视频流模式下两次真正执行之间的最小间隔
  pub min_frame_interval_ms: u64,
  /// 视频流模式下宿主提供调度机会的周期（约等于显示刷新率）
  pub tick_interval_ms: u64,
  /// 拍照模式下上一轮完成后到下一轮开始的延时
  pub rearm_delay_ms: u64,
  pub stream: StreamConfig,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      input_size: DEFAULT_INPUT_SIZE,
      labels: LabelSet::default(),
      mode: LoopMode::default(),
      normalization: Normalization::default(),
      min_frame_interval_ms: DEFAULT_MIN_FRAME_INTERVAL_MS,
      tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
      rearm_delay_ms: DEFAULT_REARM_DELAY_MS,
      stream: StreamConfig::default(),
    }
  }
}

impl PipelineConfig {
  /// 从 TOML 文件读取配置，缺省字段使用默认值
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
  }

  pub fn with_labels(mut self, labels: LabelSet) -> Self {
    self.labels = labels;
    self
  }

  pub fn with_mode(mut self, mode: LoopMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn with_normalization(mut self, normalization: Normalization) -> Self {
    self.normalization = normalization;
    self
  }

  pub fn with_min_frame_interval(mut self, interval: Duration) -> Self {
    self.min_frame_interval_ms = interval.as_millis() as u64;
    self
  }

  pub fn with_tick_interval(mut self, interval: Duration) -> Self {
    self.tick_interval_ms = interval.as_millis() as u64;
    self
  }

  pub fn with_rearm_delay(mut self, delay: Duration) -> Self {
    self.rearm_delay_ms = delay.as_millis() as u64;
    self
  }

  pub fn with_stream(mut self, stream: StreamConfig) -> Self {
    self.stream = stream;
    self
  }

  pub fn min_frame_interval(&self) -> Duration {
    Duration::from_millis(self.min_frame_interval_ms)
  }

  pub fn tick_interval(&self) -> Duration {
    // interval() 不接受零周期
    Duration::from_millis(self.tick_interval_ms.max(1))
  }

  pub fn rearm_delay(&self) -> Duration {
    Duration::from_millis(self.rearm_delay_ms)
  }
}
