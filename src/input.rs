// 该文件是 Menshi （门识） 项目的一部分。
// src/input.rs - 相机/图像输入
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

use std::{future::Future, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{FromUrl, config::StreamConfig, frame::RawImage};

/// 临时视频流等待第一帧的轮询次数与间隔
const SNAPSHOT_ATTEMPTS: usize = 50;
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("相机权限被拒绝")]
  PermissionDenied,
  #[error("视频流不可用: {0}")]
  StreamUnavailable(String),
  #[error("采集失败: {0}")]
  Capture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
  Granted,
  Denied,
}

/// 外部相机提供者
///
/// `Stream` 是打开的视频流的所有权凭证，必须且只能交还给 `close_stream` 一次。
pub trait CaptureProvider: Send + 'static {
  type Stream: Send + 'static;

  fn request_permission(&mut self) -> impl Future<Output = Permission> + Send;

  fn open_stream(
    &mut self,
    config: &StreamConfig,
  ) -> impl Future<Output = Result<Self::Stream, CaptureError>> + Send;

  /// 取一帧；`Ok(None)` 表示源暂未就绪，调用方应跳过本轮
  fn capture_frame(
    &mut self,
    stream: &mut Self::Stream,
  ) -> impl Future<Output = Result<Option<RawImage>, CaptureError>> + Send;

  fn close_stream(&mut self, stream: Self::Stream);
}

struct OpenStream<S> {
  handle: S,
  /// 持有该视频流的会话；`None` 为一次性快照打开的临时流
  owner: Option<u64>,
}

/// 帧源适配器
///
/// 持有相机提供者以及至多一个打开的视频流。
pub struct FrameSource<P: CaptureProvider> {
  provider: P,
  stream: Option<OpenStream<P::Stream>>,
}

impl<P: CaptureProvider> FrameSource<P> {
  pub fn new(provider: P) -> Self {
    Self {
      provider,
      stream: None,
    }
  }

  pub fn is_open(&self) -> bool {
    self.stream.is_some()
  }

  fn owner(&self) -> Option<u64> {
    self.stream.as_ref().and_then(|open| open.owner)
  }

  /// 为会话 `owner` 打开视频流；流已被其他会话占用时失败
  pub async fn acquire(&mut self, owner: u64, config: &StreamConfig) -> Result<(), CaptureError> {
    match self.stream.as_ref().map(|open| open.owner) {
      Some(Some(current)) if current == owner => return Ok(()),
      Some(Some(current)) => {
        return Err(CaptureError::StreamUnavailable(format!(
          "视频流已被会话 {} 占用",
          current
        )));
      }
      Some(None) => {
        warn!("关闭遗留的临时视频流");
        self.close();
      }
      None => {}
    }

    self.stream = Some(OpenStream {
      handle: self.open(config).await?,
      owner: Some(owner),
    });
    info!("会话 {} 已打开视频流", owner);
    Ok(())
  }

  /// 从已打开的视频流取一帧；未打开时视为未就绪
  pub async fn next_frame(&mut self) -> Result<Option<RawImage>, CaptureError> {
    let Some(open) = self.stream.as_mut() else {
      return Ok(None);
    };
    self.provider.capture_frame(&mut open.handle).await
  }

  /// 一次性快照：复用已打开的视频流，否则临时打开一个，取到一帧后立即关闭
  pub async fn snapshot(&mut self, config: &StreamConfig) -> Result<RawImage, CaptureError> {
    let temporary = self.stream.is_none();
    if temporary {
      self.stream = Some(OpenStream {
        handle: self.open(config).await?,
        owner: None,
      });
    }

    let mut result = Err(CaptureError::Capture("等待第一帧超时".to_string()));
    for attempt in 0..SNAPSHOT_ATTEMPTS {
      match self.next_frame().await {
        Ok(Some(frame)) => {
          result = Ok(frame);
          break;
        }
        Ok(None) => {
          debug!("第 {} 次取帧: 帧源尚未就绪", attempt + 1);
          tokio::time::sleep(SNAPSHOT_RETRY_DELAY).await;
        }
        Err(err) => {
          result = Err(err);
          break;
        }
      }
    }

    if temporary {
      self.close();
    }
    result
  }

  /// 仅当视频流属于 `owner` 时关闭它
  pub fn release(&mut self, owner: u64) -> bool {
    if self.owner() == Some(owner) {
      self.close();
      info!("会话 {} 已释放视频流", owner);
      true
    } else {
      false
    }
  }

  /// 无条件关闭视频流（进程/组件卸载时使用）
  pub fn release_all(&mut self) -> bool {
    let was_open = self.is_open();
    self.close();
    was_open
  }

  async fn open(&mut self, config: &StreamConfig) -> Result<P::Stream, CaptureError> {
    if self.provider.request_permission().await == Permission::Denied {
      warn!("相机权限被拒绝");
      return Err(CaptureError::PermissionDenied);
    }
    self.provider.open_stream(config).await
  }

  fn close(&mut self) {
    if let Some(open) = self.stream.take() {
      self.provider.close_stream(open.handle);
    }
  }
}

#[cfg(feature = "image_file_input")]
mod image_file;
#[cfg(feature = "image_file_input")]
pub use self::image_file::{ImageFileCamera, ImageFileStream};

#[cfg(feature = "v4l_input")]
mod v4l2_camera;
#[cfg(feature = "v4l_input")]
pub use self::v4l2_camera::{V4l2Camera, V4l2Stream};

/// 按 URL 方案选择具体的相机实现
#[cfg(any(feature = "image_file_input", feature = "v4l_input"))]
pub enum CameraWrapper {
  #[cfg(feature = "image_file_input")]
  ImageFile(ImageFileCamera),
  #[cfg(feature = "v4l_input")]
  V4l2(V4l2Camera),
}

#[cfg(any(feature = "image_file_input", feature = "v4l_input"))]
pub enum CameraStream {
  #[cfg(feature = "image_file_input")]
  ImageFile(ImageFileStream),
  #[cfg(feature = "v4l_input")]
  V4l2(V4l2Stream),
}

#[cfg(any(feature = "image_file_input", feature = "v4l_input"))]
impl FromUrl for CameraWrapper {
  type Error = CaptureError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "image_file_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileCamera::SCHEME {
        return Ok(CameraWrapper::ImageFile(ImageFileCamera::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4l2Camera::SCHEME {
        return Ok(CameraWrapper::V4l2(V4l2Camera::from_url(url)?));
      }
    }
    Err(CaptureError::SchemeMismatch)
  }
}

#[cfg(any(feature = "image_file_input", feature = "v4l_input"))]
impl CaptureProvider for CameraWrapper {
  type Stream = CameraStream;

  async fn request_permission(&mut self) -> Permission {
    match self {
      #[cfg(feature = "image_file_input")]
      CameraWrapper::ImageFile(camera) => camera.request_permission().await,
      #[cfg(feature = "v4l_input")]
      CameraWrapper::V4l2(camera) => camera.request_permission().await,
    }
  }

  async fn open_stream(&mut self, config: &StreamConfig) -> Result<CameraStream, CaptureError> {
    match self {
      #[cfg(feature = "image_file_input")]
      CameraWrapper::ImageFile(camera) => camera.open_stream(config).await.map(CameraStream::ImageFile),
      #[cfg(feature = "v4l_input")]
      CameraWrapper::V4l2(camera) => camera.open_stream(config).await.map(CameraStream::V4l2),
    }
  }

  async fn capture_frame(
    &mut self,
    stream: &mut CameraStream,
  ) -> Result<Option<RawImage>, CaptureError> {
    match (self, stream) {
      #[cfg(feature = "image_file_input")]
      (CameraWrapper::ImageFile(camera), CameraStream::ImageFile(stream)) => {
        camera.capture_frame(stream).await
      }
      #[cfg(feature = "v4l_input")]
      (CameraWrapper::V4l2(camera), CameraStream::V4l2(stream)) => {
        camera.capture_frame(stream).await
      }
      #[allow(unreachable_patterns)]
      _ => Err(CaptureError::Capture("视频流与相机类型不匹配".to_string())),
    }
  }

  fn close_stream(&mut self, stream: CameraStream) {
    match (self, stream) {
      #[cfg(feature = "image_file_input")]
      (CameraWrapper::ImageFile(camera), CameraStream::ImageFile(stream)) => {
        camera.close_stream(stream)
      }
      #[cfg(feature = "v4l_input")]
      (CameraWrapper::V4l2(camera), CameraStream::V4l2(stream)) => camera.close_stream(stream),
      #[allow(unreachable_patterns)]
      _ => warn!("视频流与相机类型不匹配，直接丢弃"),
    }
  }
}
