// 该文件是 Menshi （门识） 项目的一部分。
// src/inference.rs - 推理与结果排序
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

use std::{sync::OnceLock, time::Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  config::{LabelSet, PipelineConfig},
  error::PipelineError,
  frame::{ModelOutput, NormalizedTensor, RawImage},
  model::Classifier,
  preprocess::Preprocessor,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("模型推理失败: {0}")]
  Predict(String),
  #[error("模型输出形状异常: {0}")]
  UnexpectedOutput(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
  pub label: String,
  pub probability: f32,
}

/// 按概率降序排列的预测；概率相同时保持原始下标顺序
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct RankedResult(Vec<Prediction>);

impl RankedResult {
  /// 按下标对齐标签后稳定排序；不做重新归一化
  pub fn rank(probabilities: &[f32], labels: &LabelSet) -> Self {
    let mut predictions: Vec<Prediction> = probabilities
      .iter()
      .enumerate()
      .map(|(index, &probability)| Prediction {
        label: labels.name(index).into_owned(),
        probability,
      })
      .collect();
    // sort_by 是稳定排序
    predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    Self(predictions)
  }

  pub fn best(&self) -> Option<&Prediction> {
    self.0.first()
  }

  pub fn top(&self, k: usize) -> &[Prediction] {
    &self.0[..k.min(self.0.len())]
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Prediction> {
    self.0.iter()
  }

  pub fn as_slice(&self) -> &[Prediction] {
    &self.0
  }
}

impl IntoIterator for RankedResult {
  type Item = Prediction;
  type IntoIter = std::vec::IntoIter<Prediction>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

/// 推理引擎
///
/// 每次调用只执行一次 `predict`。输入张量按值传入，与模型输出一起在本次调用内释放，
/// 任何返回路径上都不会有张量活过调用本身。
pub struct InferenceEngine {
  preprocessor: Preprocessor,
  labels: LabelSet,
  mismatch: OnceLock<(usize, usize)>,
}

impl InferenceEngine {
  pub fn new(preprocessor: Preprocessor, labels: LabelSet) -> Self {
    Self {
      preprocessor,
      labels,
      mismatch: OnceLock::new(),
    }
  }

  pub fn from_config(config: &PipelineConfig) -> Self {
    Self::new(Preprocessor::from_config(config), config.labels.clone())
  }

  pub fn labels(&self) -> &LabelSet {
    &self.labels
  }

  /// 标签数量与模型输出宽度不一致时的诊断（只记录第一次）
  pub fn config_mismatch(&self) -> Option<PipelineError> {
    self
      .mismatch
      .get()
      .map(|&(labels, outputs)| PipelineError::ConfigMismatch { labels, outputs })
  }

  pub async fn infer<M: Classifier>(
    &self,
    model: &M,
    input: NormalizedTensor,
  ) -> Result<RankedResult, InferenceError> {
    let now = Instant::now();
    let output = model
      .predict(&input)
      .await
      .map_err(|e| InferenceError::Predict(e.to_string()))?;
    drop(input);
    debug!("推理完成，耗时: {:.2?}", now.elapsed());

    let probabilities = flatten(output)?;
    self.check_width(probabilities.len());
    Ok(RankedResult::rank(&probabilities, &self.labels))
  }

  /// 预处理 + 推理
  pub async fn classify<M: Classifier>(
    &self,
    model: &M,
    raw: RawImage,
  ) -> Result<RankedResult, PipelineError> {
    let tensor = self.preprocessor.preprocess(raw)?;
    Ok(self.infer(model, tensor).await?)
  }

  fn check_width(&self, outputs: usize) {
    let labels = self.labels.len();
    if labels == outputs {
      return;
    }
    let mut first = false;
    self.mismatch.get_or_init(|| {
      first = true;
      (labels, outputs)
    });
    if first {
      warn!(
        "标签数量 {} 与模型输出宽度 {} 不一致，超出部分使用 class_<index> 占位",
        labels, outputs
      );
    }
  }
}

fn flatten(output: ModelOutput) -> Result<Vec<f32>, InferenceError> {
  let tensor = match output {
    ModelOutput::Single(tensor) => tensor,
    ModelOutput::List(mut tensors) if tensors.len() == 1 => tensors.remove(0),
    ModelOutput::List(tensors) => {
      return Err(InferenceError::UnexpectedOutput(format!(
        "输出列表包含 {} 个张量",
        tensors.len()
      )));
    }
  };

  let probabilities = tensor.into_vec();
  if probabilities.is_empty() {
    return Err(InferenceError::UnexpectedOutput("输出为空".to_string()));
  }
  Ok(probabilities)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{config::Normalization, frame::Tensor, model::ModelError};

  struct FixedModel(ModelOutput);

  impl Classifier for FixedModel {
    async fn predict(&self, _input: &NormalizedTensor) -> Result<ModelOutput, ModelError> {
      Ok(self.0.clone())
    }
  }

  fn engine(labels: &[&str]) -> InferenceEngine {
    InferenceEngine::new(
      Preprocessor::new(2, Normalization::Unit),
      LabelSet::new(labels.iter().copied()),
    )
  }

  fn pairs(result: &RankedResult) -> Vec<(&str, f32)> {
    result
      .iter()
      .map(|p| (p.label.as_str(), p.probability))
      .collect()
  }

  #[tokio::test]
  async fn ranks_gate_probabilities() {
    let model = FixedModel(ModelOutput::Single(Tensor::from(vec![0.7, 0.2, 0.1])));
    let engine = engine(&["OR", "AND", "NOT"]);
    let result = engine
      .infer(&model, NormalizedTensor::zeros(2))
      .await
      .unwrap();
    assert_eq!(pairs(&result), vec![("OR", 0.7), ("AND", 0.2), ("NOT", 0.1)]);
    assert!(engine.config_mismatch().is_none());
  }

  #[tokio::test]
  async fn sorts_descending_and_keeps_ties_stable() {
    let model = FixedModel(ModelOutput::List(vec![Tensor::from(vec![
      0.1, 0.3, 0.3, 0.0, 0.3,
    ])]));
    let engine = engine(&["a", "b", "c", "d", "e"]);
    let result = engine
      .infer(&model, NormalizedTensor::zeros(2))
      .await
      .unwrap();
    assert_eq!(
      pairs(&result),
      vec![("b", 0.3), ("c", 0.3), ("e", 0.3), ("a", 0.1), ("d", 0.0)]
    );
    assert!(
      result
        .as_slice()
        .windows(2)
        .all(|w| w[0].probability >= w[1].probability)
    );
  }

  #[tokio::test]
  async fn extra_outputs_get_placeholder_labels() {
    let model = FixedModel(ModelOutput::Single(Tensor::from(vec![0.1, 0.2, 0.3, 0.4])));
    let engine = engine(&["OR", "AND", "NOT"]);
    let result = engine
      .infer(&model, NormalizedTensor::zeros(2))
      .await
      .unwrap();
    assert_eq!(result.best().unwrap().label, "class_3");
    assert_eq!(result.len(), 4);
    assert_eq!(
      engine.config_mismatch(),
      Some(PipelineError::ConfigMismatch {
        labels: 3,
        outputs: 4
      })
    );
  }

  #[tokio::test]
  async fn rejects_multi_tensor_output() {
    let model = FixedModel(ModelOutput::List(vec![
      Tensor::from(vec![0.5, 0.5]),
      Tensor::from(vec![1.0]),
    ]));
    let result = engine(&["a", "b"])
      .infer(&model, NormalizedTensor::zeros(2))
      .await;
    assert!(matches!(result, Err(InferenceError::UnexpectedOutput(_))));
  }

  #[tokio::test]
  async fn classify_reports_decode_errors() {
    let model = FixedModel(ModelOutput::Single(Tensor::from(vec![1.0])));
    let result = engine(&["a"])
      .classify(&model, RawImage::Encoded(Vec::new()))
      .await;
    assert!(matches!(result, Err(PipelineError::Decode(_))));
  }

  #[test]
  fn top_is_bounded() {
    let ranked = RankedResult::rank(&[0.2, 0.8], &LabelSet::new(["x", "y"]));
    assert_eq!(ranked.top(5).len(), 2);
    assert_eq!(ranked.top(1)[0].label, "y");
  }
}
