// 该文件是 Menshi （门识） 项目的一部分。
// tests/snapshot.rs - 单次快照集成测试
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

mod common;

use std::time::Duration;

use menshi::{LoopMode, PipelineError, SessionState, model::ModelState};

use common::{FakeCamera, FakeLoader, config, good_frame, harness};

#[tokio::test(start_paused = true)]
async fn snapshot_uses_a_temporary_stream() {
  let h = harness(config(LoopMode::Discrete), FakeCamera::new(), FakeLoader::new());

  let ranked = h.scheduler.snapshot_once().await.unwrap();
  let labels: Vec<&str> = ranked.iter().map(|p| p.label.as_str()).collect();
  assert_eq!(labels, vec!["OR", "AND", "NOT"]);

  assert_eq!(h.scheduler.state(), SessionState::Idle);
  assert_eq!(h.camera.opens(), 1);
  assert_eq!(h.camera.closes(), 1);
  assert_eq!(h.scheduler.models().state(), ModelState::Ready);
  assert_eq!(h.scheduler.board().latest().unwrap().ranked, ranked);
}

#[tokio::test(start_paused = true)]
async fn snapshot_waits_for_a_ready_frame() {
  let h = harness(
    config(LoopMode::Discrete),
    FakeCamera::new().with_script(vec![None, None, Some(good_frame())]),
    FakeLoader::new(),
  );

  h.scheduler.snapshot_once().await.unwrap();
  assert_eq!(h.camera.captures(), 3);
  assert_eq!(h.camera.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_gives_up_when_source_never_ready() {
  let h = harness(
    config(LoopMode::Discrete),
    FakeCamera::new().with_script(vec![None]),
    FakeLoader::new(),
  );

  let err = h.scheduler.snapshot_once().await.unwrap_err();
  assert!(matches!(err, PipelineError::StreamUnavailable(_)));
  assert_eq!(h.camera.closes(), 1);
  assert!(h.scheduler.board().latest().is_none());
}

#[tokio::test(start_paused = true)]
async fn snapshot_reuses_running_session_stream() {
  let h = harness(
    config(LoopMode::Discrete).with_rearm_delay(Duration::from_secs(60)),
    FakeCamera::new(),
    FakeLoader::new(),
  );
  h.scheduler.start().await.unwrap();

  h.scheduler.snapshot_once().await.unwrap();
  assert_eq!(h.camera.opens(), 1);
  assert_eq!(h.camera.closes(), 0);
  assert_eq!(h.scheduler.state(), SessionState::Running);

  h.scheduler.teardown().await;
  assert_eq!(h.camera.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_records_permission_errors() {
  let h = harness(
    config(LoopMode::Discrete),
    FakeCamera::new().denied(),
    FakeLoader::new(),
  );

  let err = h.scheduler.snapshot_once().await.unwrap_err();
  assert_eq!(err, PipelineError::PermissionDenied);
  assert_eq!(h.scheduler.last_error(), Some(PipelineError::PermissionDenied));
}

#[tokio::test(start_paused = true)]
async fn teardown_waits_for_in_flight_snapshot() {
  let h = harness(
    config(LoopMode::Discrete),
    FakeCamera::new(),
    FakeLoader::new().with_predict_delay(Duration::from_millis(500)),
  );

  let (snapshot, ()) = tokio::join!(h.scheduler.snapshot_once(), async {
    // 快照推理进行中
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.scheduler.teardown().await;
  });

  snapshot.unwrap();
  assert_eq!(h.model.predicts(), 1);
  assert_eq!(h.model.used_after_dispose(), 0);
  assert_eq!(h.model.disposes(), 1);
  assert_eq!(h.camera.closes(), 1);
  assert_eq!(h.scheduler.models().state(), ModelState::Unloaded);
}
