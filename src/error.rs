// 该文件是 Menshi （门识） 项目的一部分。
// src/error.rs - 流水线错误汇总
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

use thiserror::Error;

use crate::{
  inference::InferenceError, input::CaptureError, model::ModelError, preprocess::DecodeError,
};

/// 流水线对外暴露的错误
///
/// 分两类：
/// - 会话级错误（权限、视频流、模型加载）会中止 `start()`，并作为 `last_error` 暴露给展示层；
/// - 单帧错误（解码、推理）只影响当前这一轮迭代，循环记录日志后继续。
///
/// `ConfigMismatch` 只是诊断信息，不会阻断任何操作。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
  #[error("相机权限被拒绝")]
  PermissionDenied,
  #[error("视频流不可用: {0}")]
  StreamUnavailable(String),
  #[error("模型加载失败: {0}")]
  ModelLoadFailed(String),
  #[error("图像解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("配置不一致: 标签数量 {labels}, 模型输出宽度 {outputs}")]
  ConfigMismatch { labels: usize, outputs: usize },
}

impl PipelineError {
  /// 是否为会话级错误（会让 `start()` 失败并停留在 Idle）
  pub fn is_session_level(&self) -> bool {
    matches!(
      self,
      PipelineError::PermissionDenied
        | PipelineError::StreamUnavailable(_)
        | PipelineError::ModelLoadFailed(_)
    )
  }
}

impl From<CaptureError> for PipelineError {
  fn from(err: CaptureError) -> Self {
    match err {
      CaptureError::PermissionDenied => PipelineError::PermissionDenied,
      other => PipelineError::StreamUnavailable(other.to_string()),
    }
  }
}

impl From<ModelError> for PipelineError {
  fn from(err: ModelError) -> Self {
    PipelineError::ModelLoadFailed(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn session_level_kinds() {
    assert!(PipelineError::PermissionDenied.is_session_level());
    assert!(PipelineError::StreamUnavailable("busy".into()).is_session_level());
    assert!(PipelineError::ModelLoadFailed("bad".into()).is_session_level());
    assert!(!PipelineError::Decode(DecodeError::Empty).is_session_level());
    assert!(
      !PipelineError::ConfigMismatch {
        labels: 3,
        outputs: 4
      }
      .is_session_level()
    );
  }

  #[test]
  fn capture_errors_keep_permission_kind() {
    assert_eq!(
      PipelineError::from(CaptureError::PermissionDenied),
      PipelineError::PermissionDenied
    );
    assert!(matches!(
      PipelineError::from(CaptureError::StreamUnavailable("no device".into())),
      PipelineError::StreamUnavailable(msg) if msg.contains("no device")
    ));
  }
}
