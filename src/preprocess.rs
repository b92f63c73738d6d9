// 该文件是 Menshi （门识） 项目的一部分。
// src/preprocess.rs - 图像预处理
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

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::trace;

use crate::{
  config::{Normalization, PipelineConfig},
  frame::{NormalizedTensor, RawImage},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("图像缓冲区为空")]
  Empty,
  #[error("无法解码图像: {0}")]
  Image(String),
  #[error("像素缓冲区长度不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
}

impl From<image::ImageError> for DecodeError {
  fn from(err: image::ImageError) -> Self {
    DecodeError::Image(err.to_string())
  }
}

/// 原始图像 → S×S 双线性缩放 → 归一化 → [1, S, S, 3]
///
/// 插值方式固定为双线性（`FilterType::Triangle`），必须与模型导出时一致。
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
  size: u32,
  normalization: Normalization,
}

impl Preprocessor {
  pub fn new(size: u32, normalization: Normalization) -> Self {
    Self {
      size,
      normalization,
    }
  }

  pub fn from_config(config: &PipelineConfig) -> Self {
    Self::new(config.input_size, config.normalization)
  }

  pub fn preprocess(&self, raw: RawImage) -> Result<NormalizedTensor, DecodeError> {
    if self.size == 0 {
      return Err(DecodeError::InvalidDimensions {
        width: 0,
        height: 0,
      });
    }

    let image = decode(raw)?;
    trace!(
      "预处理: {}x{} -> {}x{}",
      image.width(),
      image.height(),
      self.size,
      self.size
    );

    let resized = if image.dimensions() == (self.size, self.size) {
      image
    } else {
      image::imageops::resize(&image, self.size, self.size, FilterType::Triangle)
    };

    let data = resized
      .as_raw()
      .iter()
      .map(|&v| self.normalization.apply(v))
      .collect();

    Ok(NormalizedTensor::from_raw(self.size as usize, data))
  }
}

/// 以默认的 /255 归一化执行预处理
pub fn preprocess(raw: RawImage, size: u32) -> Result<NormalizedTensor, DecodeError> {
  Preprocessor::new(size, Normalization::Unit).preprocess(raw)
}

fn decode(raw: RawImage) -> Result<RgbImage, DecodeError> {
  if raw.is_empty() {
    return Err(DecodeError::Empty);
  }

  let image = match raw {
    RawImage::Encoded(bytes) => image::load_from_memory(&bytes)?.to_rgb8(),
    RawImage::Rgb {
      width,
      height,
      data,
    } => {
      let expected = width as usize * height as usize * 3;
      if data.len() != expected {
        return Err(DecodeError::BufferSizeMismatch {
          expected,
          actual: data.len(),
        });
      }
      RgbImage::from_raw(width, height, data).ok_or(DecodeError::BufferSizeMismatch {
        expected,
        actual: 0,
      })?
    }
  };

  if image.width() == 0 || image.height() == 0 {
    return Err(DecodeError::InvalidDimensions {
      width: image.width(),
      height: image.height(),
    });
  }

  Ok(image)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb};
  use std::io::Cursor;

  fn solid(width: u32, height: u32, pixel: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(pixel))
  }

  #[test]
  fn zero_byte_buffer_is_decode_error() {
    assert_eq!(
      preprocess(RawImage::Encoded(Vec::new()), 224),
      Err(DecodeError::Empty)
    );
  }

  #[test]
  fn garbage_bytes_are_decode_error() {
    let result = preprocess(RawImage::Encoded(vec![0xde, 0xad, 0xbe, 0xef]), 8);
    assert!(matches!(result, Err(DecodeError::Image(_))));
  }

  #[test]
  fn rgb_buffer_length_is_checked() {
    let raw = RawImage::Rgb {
      width: 4,
      height: 4,
      data: vec![0; 10],
    };
    assert_eq!(
      preprocess(raw, 8),
      Err(DecodeError::BufferSizeMismatch {
        expected: 48,
        actual: 10
      })
    );
  }

  #[test]
  fn resizes_and_scales_to_unit_range() {
    let raw = RawImage::from(solid(37, 11, [255, 0, 51]));
    let tensor = preprocess(raw, 16).unwrap();
    assert_eq!(tensor.shape(), [1, 16, 16, 3]);
    for y in [0, 7, 15] {
      for x in [0, 9, 15] {
        assert!((tensor.at(y, x, 0) - 1.0).abs() < 1e-6);
        assert!(tensor.at(y, x, 1).abs() < 1e-6);
        assert!((tensor.at(y, x, 2) - 0.2).abs() < 1e-6);
      }
    }
    assert!(tensor.as_nhwc().iter().all(|v| (0.0..=1.0).contains(v)));
  }

  #[test]
  fn decodes_encoded_png() {
    let mut bytes = Vec::new();
    solid(5, 5, [10, 20, 30])
      .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
      .unwrap();
    let tensor = preprocess(RawImage::Encoded(bytes), 5).unwrap();
    assert!((tensor.at(2, 2, 1) - 20.0 / 255.0).abs() < 1e-6);
  }

  #[test]
  fn symmetric_normalization() {
    let pre = Preprocessor::new(2, Normalization::Symmetric);
    let tensor = pre.preprocess(RawImage::from(solid(2, 2, [0, 255, 0]))).unwrap();
    assert_eq!(tensor.at(0, 0, 0), -1.0);
    assert_eq!(tensor.at(1, 1, 1), 1.0);
  }
}
