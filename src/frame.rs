// 该文件是 Menshi （门识） 项目的一部分。
// src/frame.rs - 图像帧与张量定义
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

use image::RgbImage;

pub const RGB_CHANNELS: usize = 3;

/// 采集源给出的原始图像，只被预处理消费一次
#[derive(Debug, Clone)]
pub enum RawImage {
  /// 已编码的照片（JPEG / PNG 等），拍照模式下的常见形式
  Encoded(Vec<u8>),
  /// 紧密排列的 RGB24 像素，视频流模式下的常见形式
  Rgb {
    width: u32,
    height: u32,
    data: Vec<u8>,
  },
}

impl RawImage {
  pub fn is_empty(&self) -> bool {
    match self {
      RawImage::Encoded(bytes) => bytes.is_empty(),
      RawImage::Rgb { data, .. } => data.is_empty(),
    }
  }
}

impl From<RgbImage> for RawImage {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    RawImage::Rgb {
      width,
      height,
      data: image.into_raw(),
    }
  }
}

/// 形状固定为 [1, S, S, 3]（NHWC）的归一化浮点张量
///
/// 由创建它的调用独占，被一次 `predict` 消费后随作用域释放。
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
  size: usize,
  data: Box<[f32]>,
}

impl NormalizedTensor {
  pub(crate) fn from_raw(size: usize, data: Vec<f32>) -> Self {
    debug_assert_eq!(data.len(), size * size * RGB_CHANNELS);
    Self {
      size,
      data: data.into_boxed_slice(),
    }
  }

  pub fn zeros(size: usize) -> Self {
    Self::from_raw(size, vec![0.0; size * size * RGB_CHANNELS])
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, self.size, self.size, RGB_CHANNELS]
  }

  pub fn as_nhwc(&self) -> &[f32] {
    &self.data
  }

  /// (y, x, c) 处的值
  #[inline]
  pub fn at(&self, y: usize, x: usize, c: usize) -> f32 {
    self.data[(y * self.size + x) * RGB_CHANNELS + c]
  }
}

/// 模型输出的单个张量
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  shape: Vec<usize>,
  data: Vec<f32>,
}

impl Tensor {
  /// 形状与数据长度不一致时返回 `None`
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
    if shape.iter().product::<usize>() != data.len() {
      return None;
    }
    Some(Self { shape, data })
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data
  }
}

impl From<Vec<f32>> for Tensor {
  fn from(data: Vec<f32>) -> Self {
    Self {
      shape: vec![1, data.len()],
      data,
    }
  }
}

/// `predict` 的结果：单个张量，或者只含一个张量的列表
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
  Single(Tensor),
  List(Vec<Tensor>),
}
