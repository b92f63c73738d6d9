// 该文件是 Menshi （门识） 项目的一部分。
// src/bin/live_classify.rs - 实时逻辑门分类
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use menshi::{
  FromUrl, LabelSet, LoopMode, PipelineConfig, Scheduler,
  input::CameraWrapper,
  model::DenseLoader,
  output::{ConsoleRender, Render},
};

/// 收到中断信号后，超过该时长仍未退出则强制结束进程
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

/// Menshi 实时分类参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件（dense:///path/to/model.json）
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源（image:///path/to/dir 或 v4l:///dev/video0）
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 流水线配置文件（TOML）
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 标签文件（TOML），覆盖配置文件中的标签
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<PathBuf>,
  /// 使用拍照模式（上一轮完成后延时触发），默认为视频流模式
  #[arg(long)]
  pub discrete: bool,
  /// 收到多少个结果后退出（0 表示直到 Ctrl-C）
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
  /// 以 JSON 行输出结果
  #[arg(long)]
  pub json: bool,
  /// 只显示概率最高的前 K 项
  #[arg(long, value_name = "K")]
  pub top: Option<usize>,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
  let mut config = match &args.config {
    Some(path) => PipelineConfig::load(path)
      .with_context(|| format!("无法读取配置文件: {}", path.display()))?,
    None => PipelineConfig::default(),
  };
  if let Some(path) = &args.labels {
    let labels =
      LabelSet::load(path).with_context(|| format!("无法读取标签文件: {}", path.display()))?;
    config = config.with_labels(labels);
  }
  if args.discrete {
    config = config.with_mode(LoopMode::Discrete);
  }
  Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);

  let config = load_config(&args)?;
  let camera = CameraWrapper::from_url(&args.input)?;
  let loader = DenseLoader::from_url(&args.model)?.input_size(config.input_size);
  let scheduler = Scheduler::new(config, camera, loader);
  let render = ConsoleRender::default()
    .with_json(args.json)
    .with_top(args.top);

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    // 卸载卡住时兜底退出
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let mut results = scheduler.subscribe_results();
  scheduler.start().await?;

  let mut received = 0u64;
  loop {
    tokio::select! {
      _ = rx.recv() => {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      changed = results.changed() => {
        if changed.is_err() {
          break;
        }
        let latest = results.borrow_and_update().clone();
        let Some(latest) = latest else {
          continue;
        };
        render.render_result(&latest)?;
        received += 1;
        if args.frame_number > 0 && received >= args.frame_number {
          info!("达到指定帧数 {}, 退出任务循环", received);
          break;
        }
      }
    }
  }

  scheduler.teardown().await;
  if let Some(mismatch) = scheduler.engine().config_mismatch() {
    warn!("{}", mismatch);
  }

  info!("任务完成，退出");
  Ok(())
}
