//! 轮次循环集成测试：轮数上限、工具失败不致命、JSONL 存档回放

mod common;

use std::sync::Arc;

use common::{answer, echo_round, runtime, test_config};
use folio::core::FailureKind;
use folio::history::{ArtifactRef, JsonlRoundStore, RoundStore, ToolCallStatus};
use folio::jobs::JobStatus;
use folio::llm::{ModelReply, ScriptStep, ScriptedGateway, ToolRequest};
use folio::rounds::FINAL_ANSWER_INSTRUCTION;

#[tokio::test]
async fn test_always_tools_fails_at_forced_round_six() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(echo_round())));
    let mut config = test_config();
    config.rounds.max_rounds = 5;
    let rt = runtime(config, gw.clone());

    let job_id = rt.jobs.submit(ArtifactRef::new("loop.png")).await.unwrap();
    let record = rt.jobs.wait(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, FailureKind::RoundBudgetExhausted);
    assert_eq!(record.rounds_run, 6);

    let rounds = rt.jobs.rounds(&record.session_id).await.unwrap();
    let indices: Vec<u32> = rounds.iter().map(|r| r.round_index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5, 6]);
    assert!(rounds.iter().all(|r| !r.is_final));
    assert!(rounds[5].tool_calls.is_empty());

    let calls = gw.calls().await;
    assert_eq!(calls.len(), 6);
    assert!(calls[..5].iter().all(|c| c.tool_count > 0 && c.instruction.is_none()));
    assert_eq!(calls[5].tool_count, 0);
    assert_eq!(calls[5].instruction.as_deref(), Some(FINAL_ANSWER_INSTRUCTION));
}

#[tokio::test]
async fn test_forced_round_can_still_answer() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(answer("Atlas"))));
    gw.script(
        "late.png",
        vec![
            ScriptStep::Reply(echo_round()),
            ScriptStep::Reply(echo_round()),
        ],
    )
    .await;
    let mut config = test_config();
    config.rounds.max_rounds = 2;
    let rt = runtime(config, gw.clone());

    let job_id = rt.jobs.submit(ArtifactRef::new("late.png")).await.unwrap();
    let record = rt.jobs.wait(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.result.unwrap()["title"], "Atlas");

    let rounds = rt.jobs.rounds(&record.session_id).await.unwrap();
    assert_eq!(rounds.len(), 3);
    assert!(rounds[2].is_final);
}

#[tokio::test]
async fn test_failing_tool_does_not_stop_the_session() {
    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(answer("Lotus Sutra"))));
    let broken = ModelReply::tools(
        "try lookup",
        vec![
            ToolRequest::new("broken_lookup", serde_json::json!({"query": "lotus"})),
            ToolRequest::new("no_such_tool", serde_json::json!({})),
        ],
    );
    gw.script(
        "frag.png",
        vec![ScriptStep::Reply(broken.clone()), ScriptStep::Reply(broken)],
    )
    .await;
    let rt = runtime(test_config(), gw);

    let job_id = rt.jobs.submit(ArtifactRef::new("frag.png")).await.unwrap();
    let record = rt.jobs.wait(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);

    let rounds = rt.jobs.rounds(&record.session_id).await.unwrap();
    assert_eq!(rounds.len(), 3);
    for round in &rounds[..2] {
        assert_eq!(round.tool_calls.len(), 2);
        assert!(round
            .tool_calls
            .iter()
            .all(|c| c.status == ToolCallStatus::Failure));
        assert_eq!(round.tool_calls[0].name, "broken_lookup");
        assert_eq!(round.tool_calls[1].name, "no_such_tool");
        assert!(round.tool_calls[1].backend.is_none());
    }
    assert!(rounds[2].is_final);
}

#[tokio::test]
async fn test_jsonl_history_replays_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.store.backend = "jsonl".to_string();
    config.store.dir = Some(dir.path().to_path_buf());

    let gw = Arc::new(ScriptedGateway::new(ScriptStep::Reply(answer("Diamond Sutra"))));
    gw.script(
        "scroll.png",
        vec![
            ScriptStep::Reply(echo_round()),
            ScriptStep::Reply(echo_round()),
        ],
    )
    .await;
    let rt = runtime(config, gw);
    let job_id = rt.jobs.submit(ArtifactRef::new("scroll.png")).await.unwrap();
    let record = rt.jobs.wait(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);

    // 新的存储实例只从磁盘读取
    let store = JsonlRoundStore::new(dir.path());
    let rounds = store.load(&record.session_id).await.unwrap();
    let indices: Vec<u32> = rounds.iter().map(|r| r.round_index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(rounds.iter().filter(|r| r.is_final).count(), 1);
    assert!(rounds.last().unwrap().is_final);

    let context = store.build_context(&record.session_id).await.unwrap();
    assert_eq!(context.history.len(), 3);
    assert_eq!(context.history[0].tool_outcomes[0].summary, "hit");
    assert_eq!(context.artifact.location, "scroll.png");
}
