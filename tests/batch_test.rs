//! 批量调度集成测试：全局轮数上限、成员失败隔离、缺失结果、提交重试、取消

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{answer, echo_round, runtime, test_config, DelayedGateway};
use folio::batch::BatchStatus;
use folio::core::{ControlError, FailureKind};
use folio::history::ArtifactRef;
use folio::jobs::JobStatus;
use folio::llm::{GatewayError, ScriptStep, ScriptedGateway};

fn status_of(view: &folio::batch::BatchView, location_prefix: &str) -> (JobStatus, Option<FailureKind>) {
    let member = view
        .members
        .iter()
        .find(|m| m.alias.starts_with(location_prefix))
        .unwrap_or_else(|| panic!("no member for {location_prefix}"));
    (member.job.status, member.job.error.as_ref().map(|e| e.kind))
}

#[tokio::test]
async fn test_three_jobs_two_round_cap() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(echo_round())));
    gw.script("job1.png", vec![ScriptStep::Reply(answer("one"))]).await;
    gw.script(
        "job2.png",
        vec![ScriptStep::Reply(echo_round()), ScriptStep::Reply(answer("two"))],
    )
    .await;
    let mut config = test_config();
    config.batch.max_global_rounds = 2;
    let rt = runtime(config, gw.clone());

    let batch_id = rt
        .batches
        .submit_batch(vec![
            ArtifactRef::new("job1.png"),
            ArtifactRef::new("job2.png"),
            ArtifactRef::new("job3.png"),
        ])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();

    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.global_round, 2);
    assert_eq!(status_of(&view, "job1_"), (JobStatus::Succeeded, None));
    assert_eq!(status_of(&view, "job2_"), (JobStatus::Succeeded, None));
    assert_eq!(
        status_of(&view, "job3_"),
        (JobStatus::Failed, Some(FailureKind::RoundBudgetExhausted))
    );
    assert_eq!(view.counts.succeeded, 2);
    assert_eq!(view.counts.failed, 1);
    assert_eq!(view.counts.active(), 0);

    // 每个全局轮次只有一次合并提交，且交互式接口从未被调用
    assert_eq!(gw.batch_submissions(), 2);
    assert!(gw.calls().await.iter().all(|c| c.batched));
}

#[tokio::test]
async fn test_member_failure_is_isolated() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(echo_round())));
    gw.script(
        "a.png",
        vec![
            ScriptStep::Reply(echo_round()),
            ScriptStep::Reply(echo_round()),
            ScriptStep::Error(GatewayError::Rejected("malformed reply".into())),
        ],
    )
    .await;
    gw.script(
        "b.png",
        vec![
            ScriptStep::Reply(echo_round()),
            ScriptStep::Reply(echo_round()),
            ScriptStep::Reply(echo_round()),
            ScriptStep::Reply(answer("B")),
        ],
    )
    .await;
    let mut c_steps: Vec<ScriptStep> = (0..4).map(|_| ScriptStep::Reply(echo_round())).collect();
    c_steps.push(ScriptStep::Reply(answer("C")));
    gw.script("c.png", c_steps).await;
    let rt = runtime(test_config(), gw);

    let batch_id = rt
        .batches
        .submit_batch(vec![
            ArtifactRef::new("a.png"),
            ArtifactRef::new("b.png"),
            ArtifactRef::new("c.png"),
        ])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();

    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(
        status_of(&view, "a_"),
        (JobStatus::Failed, Some(FailureKind::UpstreamRejected))
    );
    assert_eq!(status_of(&view, "b_"), (JobStatus::Succeeded, None));
    assert_eq!(status_of(&view, "c_"), (JobStatus::Succeeded, None));
    assert_eq!(view.counts.succeeded, 2);
    assert_eq!(view.counts.failed, 1);
    assert_eq!(view.global_round, 5);

    let a = view.members.iter().find(|m| m.alias.starts_with("a_")).unwrap();
    let a_rounds = rt.jobs.rounds(&a.job.session_id).await.unwrap();
    assert_eq!(a_rounds.len(), 2);
    assert_eq!(a.job.rounds_run, 2);

    let c = view.members.iter().find(|m| m.alias.starts_with("c_")).unwrap();
    let c_rounds = rt.jobs.rounds(&c.job.session_id).await.unwrap();
    let indices: Vec<u32> = c_rounds.iter().map(|r| r.round_index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert_eq!(c.job.result.as_ref().unwrap()["title"], "C");
}

#[tokio::test]
async fn test_omitted_reply_consumes_member_budget() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(answer("ok"))));
    // normal_retries = 3：连续 4 次缺失后失败
    gw.script(
        "missing.png",
        (0..4).map(|_| ScriptStep::Omit).collect(),
    )
    .await;
    gw.script("once.png", vec![ScriptStep::Omit]).await;
    let rt = runtime(test_config(), gw);

    let batch_id = rt
        .batches
        .submit_batch(vec![
            ArtifactRef::new("missing.png"),
            ArtifactRef::new("once.png"),
            ArtifactRef::new("fine.png"),
        ])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();

    assert_eq!(
        status_of(&view, "missing_"),
        (JobStatus::Failed, Some(FailureKind::UpstreamOmitted))
    );
    assert_eq!(status_of(&view, "once_"), (JobStatus::Succeeded, None));
    assert_eq!(status_of(&view, "fine_"), (JobStatus::Succeeded, None));

    // 缺失的成员没有写入任何轮次
    let missing = view
        .members
        .iter()
        .find(|m| m.alias.starts_with("missing_"))
        .unwrap();
    assert!(rt.jobs.rounds(&missing.job.session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_submission_retried_with_backoff() {
    let gw = Arc::new(
        ScriptedGateway::new(ScriptStep::Reply(answer("ok")))
            .with_submit_failures(2)
            .with_pending_polls(3),
    );
    let rt = runtime(test_config(), gw.clone());

    let batch_id = rt
        .batches
        .submit_batch(vec![ArtifactRef::new("x.png"), ArtifactRef::new("y.png")])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();
    assert_eq!(view.counts.succeeded, 2);
    assert_eq!(view.global_round, 1);
    assert_eq!(gw.batch_submissions(), 1);
}

#[tokio::test]
async fn test_exhausted_submission_charges_every_member() {
    let gw = Arc::new(
        ScriptedGateway::new(ScriptStep::Reply(answer("ok"))).with_submit_failures(1_000),
    );
    let mut config = test_config();
    config.batch.submit_retries = 0;
    config.rounds.normal_retries = 1;
    let rt = runtime(config, gw);

    let batch_id = rt
        .batches
        .submit_batch(vec![ArtifactRef::new("p.png"), ArtifactRef::new("q.png")])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.counts.failed, 2);
    assert_eq!(view.global_round, 0);
    for member in &view.members {
        assert_eq!(
            member.job.error.as_ref().map(|e| e.kind),
            Some(FailureKind::TransientUpstream)
        );
    }
}

#[tokio::test]
async fn test_cancel_between_global_rounds() {
    let gw = Arc::new(DelayedGateway {
        inner: ScriptedGateway::new(ScriptStep::Reply(echo_round())).with_pending_polls(2),
        delay: Duration::from_millis(20),
    });
    let rt = runtime(test_config(), gw);

    let batch_id = rt
        .batches
        .submit_batch(vec![ArtifactRef::new("m.png"), ArtifactRef::new("n.png")])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rt.batches.cancel(&batch_id).await.unwrap());

    let view = rt.batches.wait(&batch_id).await.unwrap();
    assert_eq!(view.status, BatchStatus::Cancelled);
    assert_eq!(view.counts.cancelled, 2);
    for member in &view.members {
        // 已开始的全局轮次完整落盘
        let rounds = rt.jobs.rounds(&member.job.session_id).await.unwrap();
        assert_eq!(rounds.len() as u32, member.job.rounds_run);
        assert!(rounds.iter().all(|r| r.tool_calls.len() == 1));
    }
    assert!(!rt.batches.cancel(&batch_id).await.unwrap());
}

#[tokio::test]
async fn test_batch_member_session_cannot_be_resumed_while_batch_runs() {
    let gw = Arc::new(DelayedGateway {
        inner: ScriptedGateway::new(ScriptStep::Reply(echo_round())).with_pending_polls(2),
        delay: Duration::from_millis(20),
    });
    let mut config = test_config();
    config.batch.max_global_rounds = 1;
    let rt = runtime(config, gw.clone());

    let batch_id = rt
        .batches
        .submit_batch(vec![ArtifactRef::new("held.png")])
        .await
        .unwrap();
    let session_id = rt.batches.status(&batch_id).await.unwrap().members[0]
        .job
        .session_id
        .clone();

    match rt.jobs.resume(&session_id, None).await {
        Err(ControlError::ResumeRefused { reason, .. }) => assert!(reason.contains(&batch_id)),
        other => panic!("Expected ResumeRefused, got {:?}", other),
    }

    let view = rt.batches.wait(&batch_id).await.unwrap();
    assert_eq!(
        status_of(&view, "held_"),
        (JobStatus::Failed, Some(FailureKind::RoundBudgetExhausted))
    );

    // 批次结束后会话归还，可显式续跑
    gw.inner
        .script("held.png", vec![ScriptStep::Reply(answer("Held"))])
        .await;
    let job_id = rt.jobs.resume(&session_id, None).await.unwrap();
    let record = rt.jobs.wait(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    let indices: Vec<u32> = rt
        .jobs
        .rounds(&session_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.round_index)
        .collect();
    assert_eq!(indices, vec![1, 2]);
}

#[tokio::test]
async fn test_transient_poll_error_keeps_polling_same_batch() {
    let gw = Arc::new(
        ScriptedGateway::new(ScriptStep::Reply(answer("ok")))
            .with_pending_polls(1)
            .with_poll_failures(2),
    );
    let rt = runtime(test_config(), gw.clone());

    let batch_id = rt
        .batches
        .submit_batch(vec![ArtifactRef::new("r.png"), ArtifactRef::new("s.png")])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();
    assert_eq!(view.counts.succeeded, 2);
    assert_eq!(view.global_round, 1);
    assert_eq!(gw.batch_submissions(), 1);
}

#[tokio::test]
async fn test_member_backoff_delays_next_submission() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(answer("ok"))));
    gw.script("late.png", vec![ScriptStep::Omit]).await;
    let mut config = test_config();
    config.rounds.backoff_initial_ms = 80;
    config.rounds.backoff_max_ms = 80;
    let rt = runtime(config, gw.clone());

    let started = std::time::Instant::now();
    let batch_id = rt
        .batches
        .submit_batch(vec![ArtifactRef::new("late.png"), ArtifactRef::new("prompt.png")])
        .await
        .unwrap();
    let view = rt.batches.wait(&batch_id).await.unwrap();

    assert_eq!(view.counts.succeeded, 2);
    assert_eq!(view.global_round, 2);
    assert_eq!(gw.batch_submissions(), 2);
    // 另一成员本轮已拿到回复，缺失成员仍要等满退避时长才会再次提交
    assert!(started.elapsed() >= Duration::from_millis(80));
}
