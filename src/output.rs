// 该文件是 Menshi （门识） 项目的一部分。
// src/output.rs - 结果发布
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

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, trace};

use crate::inference::RankedResult;

/// 一次发布的排序结果
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
  /// 从 1 开始单调递增
  pub sequence: u64,
  pub published_at: DateTime<Utc>,
  pub ranked: RankedResult,
}

/// 唯一的“最新结果”槽位
///
/// 后写覆盖先写，不保留历史。展示层只读。
pub struct ResultBoard {
  latest: watch::Sender<Option<Published>>,
}

impl Default for ResultBoard {
  fn default() -> Self {
    Self::new()
  }
}

impl ResultBoard {
  pub fn new() -> Self {
    let (latest, _) = watch::channel(None);
    Self { latest }
  }

  pub fn publish(&self, ranked: RankedResult) -> u64 {
    let mut sequence = 0;
    self.latest.send_modify(|slot| {
      sequence = slot.as_ref().map_or(0, |p| p.sequence) + 1;
      *slot = Some(Published {
        sequence,
        published_at: Utc::now(),
        ranked,
      });
    });
    trace!("发布第 {} 个结果", sequence);
    sequence
  }

  pub fn latest(&self) -> Option<Published> {
    self.latest.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<Option<Published>> {
    self.latest.subscribe()
  }
}

/// 展示层消费已发布结果的接口
pub trait Render {
  type Error;
  fn render_result(&self, result: &Published) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum ConsoleRenderError {
  #[error("JSON 序列化错误: {0}")]
  Json(#[from] serde_json::Error),
}

/// 把结果写到日志（或以 JSON 行输出到标准输出）
#[derive(Debug, Default)]
pub struct ConsoleRender {
  json: bool,
  top: Option<usize>,
}

impl ConsoleRender {
  pub fn with_json(mut self, json: bool) -> Self {
    self.json = json;
    self
  }

  pub fn with_top(mut self, top: Option<usize>) -> Self {
    self.top = top;
    self
  }
}

impl Render for ConsoleRender {
  type Error = ConsoleRenderError;

  fn render_result(&self, result: &Published) -> Result<(), Self::Error> {
    let shown = match self.top {
      Some(k) => result.ranked.top(k),
      None => result.ranked.as_slice(),
    };

    if self.json {
      let line = serde_json::json!({
        "sequence": result.sequence,
        "published_at": result.published_at.to_rfc3339(),
        "predictions": shown,
      });
      println!("{}", serde_json::to_string(&line)?);
      return Ok(());
    }

    info!("结果 #{} ({})", result.sequence, result.published_at);
    for prediction in shown {
      info!(
        "  - {}: {:.2}%",
        prediction.label,
        prediction.probability * 100.0
      );
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::LabelSet;

  #[test]
  fn last_writer_wins() {
    let board = ResultBoard::new();
    assert!(board.latest().is_none());

    let labels = LabelSet::new(["OR", "AND"]);
    board.publish(RankedResult::rank(&[0.9, 0.1], &labels));
    let seq = board.publish(RankedResult::rank(&[0.2, 0.8], &labels));

    let latest = board.latest().unwrap();
    assert_eq!(seq, 2);
    assert_eq!(latest.sequence, 2);
    assert_eq!(latest.ranked.best().unwrap().label, "AND");
  }

  #[tokio::test]
  async fn subscribers_see_new_results() {
    let board = ResultBoard::new();
    let mut rx = board.subscribe();
    board.publish(RankedResult::rank(&[1.0], &LabelSet::new(["NOT"])));
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().as_ref().unwrap().sequence, 1);
  }

  #[test]
  fn console_render_accepts_results() {
    let board = ResultBoard::new();
    board.publish(RankedResult::rank(&[0.6, 0.4], &LabelSet::new(["OR", "AND"])));
    let latest = board.latest().unwrap();
    ConsoleRender::default().with_top(Some(1)).render_result(&latest).unwrap();
    ConsoleRender::default().with_json(true).render_result(&latest).unwrap();
  }
}
