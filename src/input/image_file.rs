// 该文件是 Menshi （门识） 项目的一部分。
// src/input/image_file.rs - 图像文件相机
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

use std::{io::ErrorKind, path::PathBuf};

use tracing::{debug, error, info};
use url::Url;

use super::{CaptureError, CaptureProvider, Permission};
use crate::{FromUrl, FromUrlWithScheme, config::StreamConfig, frame::RawImage};

const READ_IMAGE_FILE_SCHEME: &str = "image";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 把图像文件（或目录下的所有图像）当作拍照相机
///
/// 每次取帧读取一张已编码照片，目录会按文件名顺序循环。
pub struct ImageFileCamera {
  path: PathBuf,
}

pub struct ImageFileStream {
  files: Vec<PathBuf>,
  cursor: usize,
}

impl FromUrl for ImageFileCamera {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch);
    }

    Ok(ImageFileCamera {
      path: PathBuf::from(url.path()),
    })
  }
}

impl FromUrlWithScheme for ImageFileCamera {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl ImageFileCamera {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

fn is_image(path: &std::path::Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn unavailable(err: std::io::Error) -> CaptureError {
  if err.kind() == ErrorKind::PermissionDenied {
    CaptureError::PermissionDenied
  } else {
    CaptureError::StreamUnavailable(err.to_string())
  }
}

impl CaptureProvider for ImageFileCamera {
  type Stream = ImageFileStream;

  async fn request_permission(&mut self) -> Permission {
    match tokio::fs::metadata(&self.path).await {
      Err(err) if err.kind() == ErrorKind::PermissionDenied => Permission::Denied,
      // 其余错误留给 open_stream 报告
      _ => Permission::Granted,
    }
  }

  async fn open_stream(&mut self, config: &StreamConfig) -> Result<ImageFileStream, CaptureError> {
    debug!(
      "图像文件相机忽略分辨率设置 {}x{}",
      config.width, config.height
    );

    let metadata = tokio::fs::metadata(&self.path).await.map_err(unavailable)?;
    let files = if metadata.is_dir() {
      let mut entries = tokio::fs::read_dir(&self.path).await.map_err(unavailable)?;
      let mut files = Vec::new();
      while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
        let path = entry.path();
        if is_image(&path) {
          files.push(path);
        }
      }
      files.sort();
      files
    } else {
      vec![self.path.clone()]
    };

    if files.is_empty() {
      return Err(CaptureError::StreamUnavailable(format!(
        "目录 {} 中没有图像文件",
        self.path.display()
      )));
    }

    info!("打开图像文件相机: {} 张图像", files.len());
    Ok(ImageFileStream { files, cursor: 0 })
  }

  async fn capture_frame(
    &mut self,
    stream: &mut ImageFileStream,
  ) -> Result<Option<RawImage>, CaptureError> {
    let path = &stream.files[stream.cursor % stream.files.len()];
    stream.cursor = stream.cursor.wrapping_add(1);

    debug!("读取图像: {}", path.display());
    let bytes = tokio::fs::read(path)
      .await
      .map_err(|e| CaptureError::Capture(format!("{}: {}", path.display(), e)))?;
    Ok(Some(RawImage::Encoded(bytes)))
  }

  fn close_stream(&mut self, stream: ImageFileStream) {
    debug!("关闭图像文件相机，共读取 {} 次", stream.cursor);
  }
}
