use lorarl::agent::LogprobSink;
use lorarl::prelude::*;
use lorarl::testing::tiny_lora_model;
use tch::Tensor;

fn history(text: &str) -> ChatHistory {
    vec![ChatHistoryItem::new(Role::User, text)]
}

fn adapter_snapshot(model: &LoraLanguageModel) -> Vec<(String, Tensor)> {
    model
        .trainable_parameters()
        .into_iter()
        .map(|(name, t)| (name, t.detach().copy()))
        .collect()
}

fn run_session(
    agent: &mut LoraRlAgent<LoraLanguageModel>,
    callback: &mut RlTrainingCallback,
    index: &str,
    outcome: SessionEvaluationOutcome,
) -> UpdateOutcome {
    let session = Session::new(index)
        .with_status(SampleStatus::Completed)
        .with_outcome(outcome);
    callback
        .on_session_create(&session, agent.model_mut())
        .unwrap();
    assert_eq!(agent.model().mode(), ModelMode::Train);

    let sink: &mut dyn LogprobSink = callback;
    agent
        .inference(&history("count the rows ?"), Some(sink))
        .unwrap();
    assert!(callback.pending_logprob().unwrap().requires_grad());

    callback
        .on_task_complete(&session, agent.model_mut())
        .unwrap()
}

#[test]
fn test_session_updates_adapter_only_when_window_fills() {
    let dir = tempfile::tempdir().unwrap();
    let model = tiny_lora_model(3, LoraConfig::default().with_dropout(0.0)).unwrap();
    let mut agent =
        LoraRlAgent::new(model).with_options(GenerationOptions::default().with_max_new_tokens(4));
    let config = RlTrainingConfig::default()
        .with_lr(1e-2)
        .with_accumulation_steps(2);
    let mut callback = RlTrainingCallback::new(config, dir.path());

    let before = adapter_snapshot(agent.model());
    let first = run_session(&mut agent, &mut callback, "0", SessionEvaluationOutcome::Correct);
    assert!(matches!(first, UpdateOutcome::Accumulated { accumulated: 1, .. }));
    assert_eq!(agent.model().mode(), ModelMode::Eval);
    for ((_, a), (_, b)) in before.iter().zip(adapter_snapshot(agent.model()).iter()) {
        assert!(a.equal(b));
    }

    let second = run_session(&mut agent, &mut callback, "1", SessionEvaluationOutcome::Correct);
    assert!(matches!(second, UpdateOutcome::Stepped { training_step: 1, .. }));

    let after = adapter_snapshot(agent.model());
    let changed = before
        .iter()
        .zip(after.iter())
        .filter(|((name, _), _)| name.contains("lora_B"))
        .any(|((_, a), (_, b))| !a.equal(b));
    assert!(changed, "lora_B weights should move after an optimizer step");
}

#[test]
fn test_inference_without_sink_leaves_engine_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let model = tiny_lora_model(4, LoraConfig::default()).unwrap();
    let mut agent =
        LoraRlAgent::new(model).with_options(GenerationOptions::default().with_max_new_tokens(3));
    let mut callback = RlTrainingCallback::new(RlTrainingConfig::default(), dir.path());
    let session = Session::new("0").with_status(SampleStatus::Completed);

    callback
        .on_session_create(&session, agent.model_mut())
        .unwrap();
    let reply = agent.inference(&history("hello"), None).unwrap();
    assert_eq!(reply.role, Role::Agent);
    assert!(callback.pending_logprob().is_none());

    let outcome = callback
        .on_task_complete(&session, agent.model_mut())
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Skipped(SkipReason::MissingLogprob));
}

#[test]
fn test_checkpoint_restores_adapter_optimizer_and_step() {
    let dir = tempfile::tempdir().unwrap();
    let model = tiny_lora_model(5, LoraConfig::default().with_dropout(0.0)).unwrap();
    let mut agent =
        LoraRlAgent::new(model).with_options(GenerationOptions::default().with_max_new_tokens(3));
    let config = RlTrainingConfig::default().with_lr(1e-2);
    let mut callback = RlTrainingCallback::new(config.clone(), dir.path());

    for i in 0..2 {
        run_session(&mut agent, &mut callback, &i.to_string(), SessionEvaluationOutcome::Incorrect);
    }
    callback.on_state_save(agent.model()).unwrap();
    let saved = adapter_snapshot(agent.model());

    let layout = StateLayout::new(dir.path());
    assert!(layout.lora_weights().join(lorarl::model::ADAPTER_WEIGHTS_FILE).exists());
    assert!(layout.optimizer_state().exists());
    assert_eq!(
        TrainingStepRecord::load(layout.training_step()).unwrap(),
        TrainingStepRecord::new(2)
    );

    // a fresh process: new random adapter, same seed for the base
    let mut restored_model = tiny_lora_model(5, LoraConfig::default().with_dropout(0.0)).unwrap();
    let mut restored = RlTrainingCallback::new(config, dir.path());
    let report = restored.restore_state(&mut restored_model).unwrap();

    assert!(report.adapter_restored);
    assert!(report.optimizer_restored);
    assert_eq!(report.training_step, 2);
    assert!(report.warnings.is_empty());
    assert_eq!(restored.accumulation_counter(), 0);
    assert_eq!(restored.optimizer().unwrap().step_count(), 2);
    for ((name, a), (_, b)) in saved.iter().zip(adapter_snapshot(&restored_model).iter()) {
        assert!(a.equal(b), "{} differs after restore", name);
    }
}

#[test]
fn test_restore_with_different_rank_keeps_fresh_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let model = tiny_lora_model(6, LoraConfig::default().with_rank(4)).unwrap();
    let mut callback = RlTrainingCallback::new(RlTrainingConfig::default(), dir.path());
    callback.on_state_save(&model).unwrap();

    let mut other = tiny_lora_model(6, LoraConfig::default().with_rank(2)).unwrap();
    let mut restored = RlTrainingCallback::new(RlTrainingConfig::default(), dir.path());
    let report = restored.restore_state(&mut other).unwrap();

    assert!(!report.adapter_restored);
    assert!(!report.warnings.is_empty());
    assert_eq!(other.lora_config().r, 2);
}

#[test]
fn test_restore_with_different_alpha_keeps_fresh_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let model = tiny_lora_model(19, LoraConfig::default().with_rank(4).with_alpha(8.0)).unwrap();
    let mut callback = RlTrainingCallback::new(RlTrainingConfig::default(), dir.path());
    callback.on_state_save(&model).unwrap();

    let mut other = tiny_lora_model(19, LoraConfig::default().with_rank(4)).unwrap();
    let mut restored = RlTrainingCallback::new(RlTrainingConfig::default(), dir.path());
    let report = restored.restore_state(&mut other).unwrap();

    assert!(!report.adapter_restored);
    assert!(report.warnings.iter().any(|w| w.contains("lora_alpha")));
    assert_eq!(other.lora_config().lora_alpha, 32.0);
}
