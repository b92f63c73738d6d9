// 该文件是 Menshi （门识） 项目的一部分。
// src/bin/snapshot_classify.rs - 单次快照分类
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use menshi::{
  FromUrl, LabelSet, PipelineConfig, Scheduler,
  input::CameraWrapper,
  model::DenseLoader,
  output::{ConsoleRender, Render},
};

/// Menshi 单次快照参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件（dense:///path/to/model.json）
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源（image:///path/to/gate.png 或 v4l:///dev/video0）
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 流水线配置文件（TOML）
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 标签文件（TOML），覆盖配置文件中的标签
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<PathBuf>,
  /// 以 JSON 行输出结果
  #[arg(long)]
  pub json: bool,
  /// 只显示概率最高的前 K 项
  #[arg(long, value_name = "K")]
  pub top: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);

  let mut config = match &args.config {
    Some(path) => PipelineConfig::load(path)
      .with_context(|| format!("无法读取配置文件: {}", path.display()))?,
    None => PipelineConfig::default(),
  };
  if let Some(path) = &args.labels {
    config = config.with_labels(
      LabelSet::load(path).with_context(|| format!("无法读取标签文件: {}", path.display()))?,
    );
  }

  let camera = CameraWrapper::from_url(&args.input)?;
  let loader = DenseLoader::from_url(&args.model)?.input_size(config.input_size);
  let render = ConsoleRender::default()
    .with_json(args.json)
    .with_top(args.top);

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
    .context("无法创建异步运行时")?;

  runtime.block_on(async {
    let scheduler = Scheduler::new(config, camera, loader);
    let result = scheduler.snapshot_once().await;
    scheduler.teardown().await;
    result?;

    if let Some(latest) = scheduler.board().latest() {
      render.render_result(&latest)?;
    }
    Ok::<(), anyhow::Error>(())
  })
}
