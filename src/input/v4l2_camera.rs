// 该文件是 Menshi （门识） 项目的一部分。
// src/input/v4l2_camera.rs - V4L2 摄像头
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
  io::ErrorKind,
  path::Path,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
  thread::JoinHandle,
  time::Duration,
};

use tracing::{debug, error, info, warn};
use url::Url;
use v4l::{
  FourCC, buffer::Type, io::mmap::Stream, io::traits::CaptureStream, prelude::*, video::Capture,
};

use super::{CaptureError, CaptureProvider, Permission};
use crate::{
  FromUrl, FromUrlWithScheme,
  config::{Facing, StreamConfig},
  frame::RawImage,
};

const V4L_SCHEME: &str = "v4l";
const DEFAULT_DEVICE: &str = "/dev/video0";
const CAPTURE_BUFFERS: u32 = 4;
/// 单次取帧的最长阻塞时间，采集线程至少以此频率检查停止标志
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);
/// 重新打开设备前等待上一个采集线程退出的上限
const CLOSE_WAIT: Duration = Duration::from_secs(2);

/// V4L2 连续视频流相机
///
/// 打开视频流后由一个采集线程持有设备，不断把最新一帧放进共享槽位；
/// 取帧时拿走槽位里的帧，没有新帧时视为未就绪。
/// 关闭视频流时不阻塞调用方，采集线程在后台回收。
pub struct V4l2Camera {
  device_path: String,
  closing: Option<tokio::task::JoinHandle<()>>,
}

pub struct V4l2Stream {
  latest: Arc<Mutex<Option<RawImage>>>,
  failure: Arc<Mutex<Option<String>>>,
  stop: Arc<AtomicBool>,
  worker: Option<JoinHandle<()>>,
}

impl FromUrl for V4l2Camera {
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

    // v4l:///dev/video0
    let device_path = if url.path().is_empty() || url.path() == "/" {
      DEFAULT_DEVICE.to_string()
    } else {
      url.path().to_string()
    };

    Ok(V4l2Camera {
      device_path,
      closing: None,
    })
  }
}

impl FromUrlWithScheme for V4l2Camera {
  const SCHEME: &'static str = V4L_SCHEME;
}

impl V4l2Camera {
  pub fn new(device_path: impl Into<String>) -> Self {
    Self {
      device_path: device_path.into(),
      closing: None,
    }
  }

  /// 等待上一个采集线程释放设备
  async fn wait_closed(&mut self) -> Result<(), CaptureError> {
    let Some(mut closing) = self.closing.take() else {
      return Ok(());
    };
    match tokio::time::timeout(CLOSE_WAIT, &mut closing).await {
      Ok(_) => Ok(()),
      Err(_) => {
        warn!("上一个采集线程在 {:?} 内未退出", CLOSE_WAIT);
        self.closing = Some(closing);
        Err(CaptureError::StreamUnavailable(
          "设备仍被上一个采集线程占用".to_string(),
        ))
      }
    }
  }
}

fn join_worker(worker: JoinHandle<()>) {
  if worker.join().is_err() {
    warn!("采集线程异常退出");
  }
}

fn device_error(err: std::io::Error) -> CaptureError {
  if err.kind() == ErrorKind::PermissionDenied {
    CaptureError::PermissionDenied
  } else {
    CaptureError::StreamUnavailable(err.to_string())
  }
}

fn open_device(path: &str, width: u32, height: u32) -> Result<(Device, u32, u32), CaptureError> {
  let device = Device::with_path(path).map_err(device_error)?;

  let mut format = device.format().map_err(device_error)?;
  format.width = width;
  format.height = height;
  format.fourcc = FourCC::new(b"YUYV");
  let format = device.set_format(&format).map_err(device_error)?;

  if format.fourcc != FourCC::new(b"YUYV") {
    return Err(CaptureError::StreamUnavailable(format!(
      "设备不支持 YUYV，当前像素格式为 {}",
      format.fourcc
    )));
  }

  Ok((device, format.width, format.height))
}

/// 将 YUYV 格式转换为 RGB
pub(crate) fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let pixels = (width * height) as usize;
  let mut rgb = Vec::with_capacity(pixels * 3);

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;

    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  // 驱动偶尔给出不完整的缓冲区，补齐以保持尺寸一致
  rgb.resize(pixels * 3, 0);
  rgb
}

fn capture_loop(
  device: Device,
  width: u32,
  height: u32,
  latest: Arc<Mutex<Option<RawImage>>>,
  failure: Arc<Mutex<Option<String>>>,
  stop: Arc<AtomicBool>,
) {
  let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, CAPTURE_BUFFERS) {
    Ok(stream) => stream,
    Err(e) => {
      error!("无法创建捕获流: {}", e);
      *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
      return;
    }
  };
  stream.set_timeout(CAPTURE_TIMEOUT);

  let mut frames = 0u64;
  while !stop.load(Ordering::Acquire) {
    match stream.next() {
      Ok((buffer, _meta)) => {
        let data = yuyv_to_rgb(buffer, width, height);
        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(RawImage::Rgb {
          width,
          height,
          data,
        });
        frames += 1;
      }
      Err(e) if e.kind() == ErrorKind::TimedOut => {
        debug!("等待帧超时");
      }
      Err(e) => {
        error!("无法捕获帧: {}", e);
        *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        break;
      }
    }
  }
  debug!("采集线程退出，共采集 {} 帧", frames);
}

impl CaptureProvider for V4l2Camera {
  type Stream = V4l2Stream;

  async fn request_permission(&mut self) -> Permission {
    // 设备节点不可读写即视为未授权
    let path = self.device_path.clone();
    let denied = tokio::task::spawn_blocking(move || {
      std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(Path::new(&path))
        .is_err_and(|e| e.kind() == ErrorKind::PermissionDenied)
    })
    .await
    .unwrap_or(false);

    if denied {
      Permission::Denied
    } else {
      Permission::Granted
    }
  }

  async fn open_stream(&mut self, config: &StreamConfig) -> Result<V4l2Stream, CaptureError> {
    if config.facing == Facing::Front {
      debug!("V4L2 设备不区分朝向，忽略 facing 设置");
    }
    self.wait_closed().await?;

    let path = self.device_path.clone();
    let (width, height) = (config.width, config.height);
    let (device, width, height) =
      tokio::task::spawn_blocking(move || open_device(&path, width, height))
        .await
        .map_err(|e| CaptureError::StreamUnavailable(e.to_string()))??;
    info!("打开 V4L2 设备 {}: {}x{}", self.device_path, width, height);

    let latest = Arc::new(Mutex::new(None));
    let failure = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
      let (latest, failure, stop) = (latest.clone(), failure.clone(), stop.clone());
      std::thread::Builder::new()
        .name("v4l2-capture".to_string())
        .spawn(move || capture_loop(device, width, height, latest, failure, stop))
        .map_err(|e| CaptureError::StreamUnavailable(e.to_string()))?
    };

    Ok(V4l2Stream {
      latest,
      failure,
      stop,
      worker: Some(worker),
    })
  }

  async fn capture_frame(
    &mut self,
    stream: &mut V4l2Stream,
  ) -> Result<Option<RawImage>, CaptureError> {
    if let Some(reason) = stream
      .failure
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      return Err(CaptureError::Capture(reason));
    }
    Ok(
      stream
        .latest
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take(),
    )
  }

  fn close_stream(&mut self, mut stream: V4l2Stream) {
    stream.stop.store(true, Ordering::Release);
    if let Some(worker) = stream.worker.take() {
      // 采集线程至多在一次取帧超时后退出并释放设备
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          self.closing = Some(runtime.spawn_blocking(move || join_worker(worker)));
        }
        Err(_) => join_worker(worker),
      }
    }
    info!("关闭 V4L2 设备 {}", self.device_path);
  }
}

impl Drop for V4l2Stream {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::Release);
  }
}
