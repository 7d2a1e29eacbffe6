//! Multi-stage runs and recovery from damaged checkpoints.

mod common;

use serde_json::{Value, json};

use common::{FnBackend, engine, ids, last_user, read_output, reasoned, text, transport_error, write_json};
use synth_dialogue::engine::StageJob;
use synth_dialogue::llm::InferenceRequest;
use synth_dialogue::pipeline::StageKind;
use synth_dialogue::store::{CollectionFormat, temp_path};

/// Answers every stage, telling them apart by model, temperature and prompt.
fn full_service(req: &InferenceRequest) -> synth_dialogue::error::GatewayResult<synth_dialogue::llm::Completion> {
    let prompt = last_user(req);
    if req.model == "deepseek-reasoner" {
        return reasoned(format!("I hear you: {prompt}"), "reflect feelings first");
    }
    if req.temperature == 0.0 {
        return text(r#"{"keep": true, "issues": [], "reason": "coherent and grounded"}"#);
    }
    if prompt.starts_with("Post content:") {
        return text("```json\n{\"rounds\": 2, \"info_by_round\": [\"sleep\", \"work stress\"]}\n```");
    }
    text(
        r#"Here you go: {"conversation": [
            {"round": 1, "patient": "I can't sleep at night", "counselor": "Tell me more."},
            {"round": 2, "patient": "Work keeps me up", "counselor": "That sounds draining."}
        ]}"#,
    )
}

#[test]
fn four_stages_chain_through_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = |name: &str| dir.path().join(name);
    write_json(
        &path("posts.json"),
        &json!([
            {"post_id": "p1", "content": "I lie awake every night worrying about my job."},
            {"post_id": "p2", "title": "post without body"}
        ]),
    );

    let jobs = [
        StageJob::new(StageKind::Extract, path("posts.json"), path("themes.jsonl")),
        StageJob::new(StageKind::Converse, path("themes.jsonl"), path("conversations.json")),
        StageJob::new(StageKind::Reply, path("conversations.json"), path("dialogues.json")),
        StageJob::new(StageKind::Filter, path("dialogues.json"), path("decisions.json")),
    ];

    let backend = FnBackend::new(full_service);
    let mut summaries = Vec::new();
    for job in &jobs {
        summaries.push(engine(backend.clone(), 2, 5, 2).run(job).unwrap());
    }
    // p2 has no `content`, so it never leaves the first stage.
    assert_eq!(summaries[0].skipped, 1);
    assert!(summaries.iter().all(|s| s.failed == 0));
    // extract + converse + two replies + filter
    assert_eq!(backend.calls(), 5);

    let themes = read_output(&path("themes.jsonl"));
    assert_eq!(ids(&themes), vec!["p1"]);
    assert_eq!(themes[0]["rounds"], json!(2));

    let dialogues = read_output(&path("dialogues.json"));
    let turns = dialogues[0]["conversation"].as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0]["counselor_content"], json!("I hear you: I can't sleep at night"));
    assert_eq!(turns[1]["counselor_think"], json!("reflect feelings first"));
    // Fields from earlier stages ride along.
    assert_eq!(dialogues[0]["info_by_round"], json!(["sleep", "work stress"]));
    assert_eq!(dialogues[0]["content"], themes[0]["content"]);

    let decisions = read_output(&path("decisions.json"));
    assert_eq!(
        decisions,
        vec![json!({"post_id": "p1", "keep": true, "issues": [], "reason": "coherent and grounded"})]
    );

    // A second pass over the whole chain sends nothing.
    let idle = FnBackend::new(full_service);
    for job in &jobs {
        let summary = engine(idle.clone(), 2, 5, 2).run(job).unwrap();
        assert_eq!(summary.succeeded, 0);
    }
    // p2 is still pending for extract but lacks input, so it is skipped again.
    assert_eq!(idle.calls(), 0);
}

#[test]
fn truncated_line_output_is_recovered() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("posts.json");
    let output = dir.path().join("themes.jsonl");
    write_json(
        &input,
        &json!([
            {"post_id": "p1", "content": "a"},
            {"post_id": "p2", "content": "b"},
            {"post_id": "p3", "content": "c"}
        ]),
    );
    // Killed half way through writing the second line.
    std::fs::write(
        &output,
        "{\"post_id\":\"p1\",\"content\":\"a\",\"rounds\":1,\"info_by_round\":[\"x\"]}\n{\"post_id\":\"p2\",\"conte",
    )
    .unwrap();

    let backend = FnBackend::new(|_| text(r#"{"rounds":1,"info_by_round":["y"]}"#));
    let summary = engine(backend.clone(), 2, 10, 1)
        .run(&StageJob::new(StageKind::Extract, &input, &output))
        .unwrap();

    assert_eq!(summary.already_done, 1);
    assert_eq!(backend.calls(), 2);
    let out = read_output(&output);
    assert_eq!(ids(&out), vec!["p1", "p2", "p3"]);
    assert_eq!(out[0]["info_by_round"], json!(["x"]));
}

#[test]
fn leftover_temp_checkpoint_is_resumed() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("posts.json");
    let output = dir.path().join("themes.json");
    write_json(
        &input,
        &json!([
            {"post_id": "p1", "content": "a"},
            {"post_id": "p2", "content": "b"},
            {"post_id": "p3", "content": "c"}
        ]),
    );
    // The rename never happened: the temp file is newer than the output.
    write_json(&output, &json!([{"post_id": "p1", "rounds": 1, "info_by_round": ["x"]}]));
    write_json(
        &temp_path(&output),
        &json!([
            {"post_id": "p1", "rounds": 1, "info_by_round": ["x"]},
            {"post_id": "p2", "rounds": 1, "info_by_round": ["x"]}
        ]),
    );

    let backend = FnBackend::new(|_| text(r#"{"rounds":1,"info_by_round":["y"]}"#));
    let job = StageJob::new(StageKind::Extract, &input, &output).with_format(CollectionFormat::Array);
    let summary = engine(backend.clone(), 1, 10, 1).run(&job).unwrap();

    assert_eq!(summary.already_done, 2);
    assert_eq!(backend.calls(), 1);
    assert!(backend.prompts()[0].contains("\"c\""));
    assert!(!temp_path(&output).exists());
    assert_eq!(ids(&read_output(&output)), vec!["p1", "p2", "p3"]);
}

#[test]
fn partly_answered_dialogue_resumes_from_output() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("conversations.json");
    let output = dir.path().join("dialogues.json");
    let conversation = |second: Value| {
        json!({
            "post_id": "p1",
            "conversation": [
                {"round": 1, "patient": "I feel stuck"},
                second
            ]
        })
    };
    write_json(&input, &json!([conversation(json!({"round": 2, "patient": "Nothing helps"}))]));
    // An earlier run answered the first turn, then failed on the second.
    let mut partial = conversation(json!({"round": 2, "patient": "Nothing helps"}));
    partial["conversation"][0]["counselor_content"] = json!("Stuck how?");
    partial["conversation"][0]["counselor_think"] = json!("open question");
    write_json(&output, &json!([partial]));

    let backend = FnBackend::new(|_| reasoned("Let's find one small step.", "behavioural activation"));
    let summary = engine(backend.clone(), 1, 10, 1)
        .run(&StageJob::new(StageKind::Reply, &input, &output))
        .unwrap();

    assert_eq!(summary.already_done, 0);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(backend.calls(), 1);
    // The history replays the earlier exchange before the open turn.
    {
        let requests = backend.requests.lock().unwrap();
        let contents: Vec<&str> = requests[0].messages.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["I feel stuck", "Stuck how?", "Nothing helps"]);
    }

    let out = read_output(&output);
    assert_eq!(out.len(), 1);
    let turns = out[0]["conversation"].as_array().unwrap();
    assert_eq!(turns[0]["counselor_content"], json!("Stuck how?"));
    assert_eq!(turns[0]["counselor_think"], json!("open question"));
    assert_eq!(turns[1]["counselor_content"], json!("Let's find one small step."));
    assert_eq!(turns[1]["counselor_think"], json!("behavioural activation"));
}

#[test]
fn filter_rejects_unparsable_verdicts_and_keeps_transport_failures_pending() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("dialogues.json");
    let output = dir.path().join("decisions.json");
    write_json(
        &input,
        &json!([
            {"post_id": "p1", "conversation": [{"patient": "hi", "counselor_content": "hello"}]},
            {"post_id": "p2", "conversation": [{"patient": "unreachable", "counselor_content": "..."}]}
        ]),
    );

    let backend = FnBackend::new(|req: &InferenceRequest| {
        if last_user(req).contains("unreachable") {
            transport_error()
        } else {
            text("Looks fine to me!")
        }
    });
    let summary = engine(backend.clone(), 2, 10, 2)
        .run(&StageJob::new(StageKind::Filter, &input, &output))
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    // One call for the bad verdict, two for the unreachable record.
    assert_eq!(backend.calls(), 3);

    let out = read_output(&output);
    assert_eq!(ids(&out), vec!["p1"]);
    assert_eq!(out[0]["keep"], json!(false));
    let reason = out[0]["reason"].as_str().unwrap();
    assert!(reason.starts_with("Invalid model response"));
    assert!(reason.contains("Looks fine to me!"));
    // The source dialogue is untouched.
    assert_eq!(read_output(&input).len(), 2);
}

#[test]
fn clean_prefix_temp_checkpoint_loses_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("posts.json");
    let output = dir.path().join("themes.jsonl");
    write_json(
        &input,
        &json!([
            {"post_id": "p1", "content": "a"},
            {"post_id": "p2", "content": "b"},
            {"post_id": "p3", "content": "c"}
        ]),
    );
    let line = |id: &str| format!("{{\"post_id\":\"{id}\",\"rounds\":1,\"info_by_round\":[\"x\"]}}\n");
    std::fs::write(&output, format!("{}{}{}", line("p1"), line("p2"), line("p3"))).unwrap();
    // Killed right after the first line of the next checkpoint hit the disk.
    std::fs::write(temp_path(&output), line("p1")).unwrap();

    let backend = FnBackend::new(|_| text(r#"{"rounds":1,"info_by_round":["y"]}"#));
    let summary = engine(backend.clone(), 2, 10, 1)
        .run(&StageJob::new(StageKind::Extract, &input, &output))
        .unwrap();

    assert_eq!(summary.already_done, 3);
    assert_eq!(backend.calls(), 0);
    assert!(!temp_path(&output).exists());
    let out = read_output(&output);
    assert_eq!(ids(&out), vec!["p1", "p2", "p3"]);
    assert!(out.iter().all(|v| v["info_by_round"] == json!(["x"])));
}

#[test]
fn reply_keeps_turns_answered_before_a_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("conversations.json");
    let output = dir.path().join("dialogues.json");
    let decisions = dir.path().join("decisions.json");
    write_json(
        &input,
        &json!([{
            "post_id": "p1",
            "conversation": [{"round": 1, "patient": "first"}, {"round": 2, "patient": "second"}]
        }]),
    );
    let job = StageJob::new(StageKind::Reply, &input, &output);

    let flaky = FnBackend::new(|req: &InferenceRequest| {
        if last_user(req) == "second" {
            transport_error()
        } else {
            reasoned("answer to first", "think first")
        }
    });
    let summary = engine(flaky.clone(), 1, 10, 2).run(&job).unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(flaky.prompts(), vec!["first", "second", "second"]);

    let saved = read_output(&output);
    assert_eq!(saved[0]["conversation"][0]["counselor_content"], json!("answer to first"));
    assert!(saved[0]["conversation"][1].get("counselor_content").is_none());

    // The half-answered dialogue is not ready for review.
    let reviewer = FnBackend::new(|_| text(r#"{"keep": true, "issues": [], "reason": "ok"}"#));
    let review = engine(reviewer.clone(), 1, 10, 1)
        .run(&StageJob::new(StageKind::Filter, &output, &decisions))
        .unwrap();
    assert_eq!(review.skipped, 1);
    assert_eq!(reviewer.calls(), 0);

    let steady = FnBackend::new(|_| reasoned("answer to second", "think second"));
    let summary = engine(steady.clone(), 1, 10, 2).run(&job).unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(steady.prompts(), vec!["second"]);

    let turns = read_output(&output)[0]["conversation"].clone();
    assert_eq!(turns[0]["counselor_content"], json!("answer to first"));
    assert_eq!(turns[0]["counselor_think"], json!("think first"));
    assert_eq!(turns[1]["counselor_content"], json!("answer to second"));
}

#[test]
fn counselor_only_closing_turn_needs_no_reply() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("conversations.json");
    let output = dir.path().join("dialogues.json");
    write_json(
        &input,
        &json!([{
            "post_id": "p1",
            "conversation": [{"patient": "first"}, {"counselor": "closing remark"}]
        }]),
    );

    let backend = FnBackend::new(|_| reasoned("I'm listening.", "invite detail"));
    let summary = engine(backend.clone(), 1, 10, 1)
        .run(&StageJob::new(StageKind::Reply, &input, &output))
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(backend.calls(), 1);
    let turns = read_output(&output)[0]["conversation"].clone();
    assert_eq!(turns[1], json!({"counselor": "closing remark"}));

    let rerun = FnBackend::new(|_| reasoned("unused", "unused"));
    let summary = engine(rerun.clone(), 1, 10, 1)
        .run(&StageJob::new(StageKind::Reply, &input, &output))
        .unwrap();
    assert_eq!(summary.already_done, 1);
    assert_eq!(rerun.calls(), 0);
}
