// 该文件是 Menshi （门识） 项目的一部分。
// src/model/dense.rs - 全连接 softmax 分类模型
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

//! 模型文件为 JSON：
//!
//! ```json
//! { "input_size": 224, "grid": 8, "weights": [...], "bias": [...] }
//! ```
//!
//! 输入张量先按 `grid × grid` 网格做平均池化得到 `grid * grid * 3` 维特征，
//! 再经过 `weights`（行优先，`classes × features`）与 `bias`，最后 softmax。

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ModelOutput, NormalizedTensor, RGB_CHANNELS, Tensor},
  model::{Classifier, ModelError, ModelLoader},
};

const DENSE_SCHEME: &str = "dense";

#[derive(Deserialize)]
struct DenseFile {
  input_size: u32,
  grid: u32,
  weights: Vec<f32>,
  bias: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct DenseModel {
  input_size: usize,
  grid: usize,
  weights: Vec<f32>,
  bias: Vec<f32>,
}

impl DenseModel {
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
    let file: DenseFile =
      serde_json::from_slice(bytes).map_err(|e| ModelError::Invalid(e.to_string()))?;

    let input_size = file.input_size as usize;
    let grid = file.grid as usize;
    if grid == 0 || input_size == 0 || grid > input_size {
      return Err(ModelError::Invalid(format!(
        "网格 {} 与输入尺寸 {} 不兼容",
        grid, input_size
      )));
    }

    let classes = file.bias.len();
    let features = grid * grid * RGB_CHANNELS;
    if classes == 0 || file.weights.len() != classes * features {
      return Err(ModelError::Invalid(format!(
        "权重数量 {} 与 {} 类 x {} 维特征不符",
        file.weights.len(),
        classes,
        features
      )));
    }

    Ok(Self {
      input_size,
      grid,
      weights: file.weights,
      bias: file.bias,
    })
  }

  pub fn input_size(&self) -> usize {
    self.input_size
  }

  pub fn classes(&self) -> usize {
    self.bias.len()
  }

  fn pooled_features(&self, input: &NormalizedTensor) -> Vec<f32> {
    let size = self.input_size;
    let mut features = Vec::with_capacity(self.grid * self.grid * RGB_CHANNELS);

    for gy in 0..self.grid {
      let (y0, y1) = (gy * size / self.grid, (gy + 1) * size / self.grid);
      for gx in 0..self.grid {
        let (x0, x1) = (gx * size / self.grid, (gx + 1) * size / self.grid);
        let count = ((y1 - y0) * (x1 - x0)) as f32;
        for c in 0..RGB_CHANNELS {
          let mut sum = 0.0;
          for y in y0..y1 {
            for x in x0..x1 {
              sum += input.at(y, x, c);
            }
          }
          features.push(sum / count);
        }
      }
    }

    features
  }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  exps.into_iter().map(|e| e / sum).collect()
}

impl Classifier for DenseModel {
  async fn predict(&self, input: &NormalizedTensor) -> Result<ModelOutput, ModelError> {
    if input.size() != self.input_size {
      return Err(ModelError::Predict(format!(
        "输入尺寸 {} 与模型要求 {} 不符",
        input.size(),
        self.input_size
      )));
    }

    let features = self.pooled_features(input);
    let logits: Vec<f32> = self
      .weights
      .chunks_exact(features.len())
      .zip(&self.bias)
      .map(|(row, bias)| row.iter().zip(&features).map(|(w, f)| w * f).sum::<f32>() + bias)
      .collect();

    Ok(ModelOutput::Single(Tensor::from(softmax(&logits))))
  }

  fn dispose(&self) {
    debug!("释放全连接模型权重: {} 个参数", self.weights.len());
  }
}

/// 从 `dense:///path/to/model.json` 加载 [`DenseModel`]
pub struct DenseLoader {
  model_path: PathBuf,
  input_size: Option<u32>,
}

impl FromUrl for DenseLoader {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::SchemeMismatch);
    }

    Ok(DenseLoader {
      model_path: PathBuf::from(url.path()),
      input_size: None,
    })
  }
}

impl FromUrlWithScheme for DenseLoader {
  const SCHEME: &'static str = DENSE_SCHEME;
}

impl DenseLoader {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      input_size: None,
    }
  }

  /// 要求模型输入边长与流水线配置一致，否则视为加载失败
  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = Some(input_size);
    self
  }
}

impl ModelLoader for DenseLoader {
  type Model = DenseModel;

  async fn load(&self) -> Result<DenseModel, ModelError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = tokio::fs::read(&self.model_path).await?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let model = DenseModel::from_bytes(&model_data)?;
    if let Some(expected) = self.input_size {
      if model.input_size() != expected as usize {
        return Err(ModelError::Invalid(format!(
          "模型输入尺寸为 {}, 配置要求 {}",
          model.input_size(),
          expected
        )));
      }
    }

    debug!("模型类别数量: {}", model.classes());
    Ok(model)
  }
}
