//! Session reward and REINFORCE loss.

use super::config::RlTrainingConfig;
use crate::session::{SampleStatus, Session, SessionEvaluationOutcome};
use crate::Result;
use tch::Tensor;

/// Reward for a finished session.
///
/// A correct, completed session earns `reward_correct`; hitting the task limit earns
/// `reward_timeout` whatever the outcome; every other combination earns `reward_incorrect`.
pub fn compute_reward(
    outcome: SessionEvaluationOutcome,
    status: SampleStatus,
    config: &RlTrainingConfig,
) -> f64 {
    match (outcome, status) {
        (SessionEvaluationOutcome::Correct, SampleStatus::Completed) => config.reward_correct,
        (_, SampleStatus::TaskLimitReached) => config.reward_timeout,
        _ => config.reward_incorrect,
    }
}

/// Reward of `session`.
pub fn session_reward(session: &Session, config: &RlTrainingConfig) -> f64 {
    compute_reward(
        session.evaluation_record.outcome,
        session.sample_status,
        config,
    )
}

/// `-(logprob) * reward * reward_weight / accumulation_steps`
pub fn reinforce_loss(logprob: &Tensor, reward: f64, config: &RlTrainingConfig) -> Result<Tensor> {
    let scale = reward * config.reward_weight / config.accumulation_steps() as f64;
    Ok(logprob.f_neg()?.f_mul_scalar(scale)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_table_is_total() {
        let config = RlTrainingConfig::default();
        for outcome in SessionEvaluationOutcome::ALL {
            for status in SampleStatus::ALL {
                let reward = compute_reward(outcome, status, &config);
                let expected = match (outcome, status) {
                    (SessionEvaluationOutcome::Correct, SampleStatus::Completed) => 1.0,
                    (_, SampleStatus::TaskLimitReached) => -0.3,
                    _ => -0.1,
                };
                assert_eq!(reward, expected, "{:?} / {:?}", outcome, status);
            }
        }
    }

    #[test]
    fn test_timeout_ignores_outcome() {
        let config = RlTrainingConfig::default();
        let session = Session::new("7")
            .with_status(SampleStatus::TaskLimitReached)
            .with_outcome(SessionEvaluationOutcome::Correct);
        assert_eq!(session_reward(&session, &config), -0.3);
    }

    #[test]
    fn test_loss_value_and_sign() {
        let config = RlTrainingConfig::default();
        let logprob = Tensor::from(-2.0f32);
        let loss = reinforce_loss(&logprob, 1.0, &config).unwrap();
        assert_eq!(loss.double_value(&[]), 2.0);

        // positive reward: lower logprob means larger loss
        let worse = reinforce_loss(&Tensor::from(-3.0f32), 1.0, &config).unwrap();
        assert!(worse.double_value(&[]) > loss.double_value(&[]));

        // negative reward inverts the relation
        let a = reinforce_loss(&Tensor::from(-2.0f32), -0.1, &config).unwrap();
        let b = reinforce_loss(&Tensor::from(-3.0f32), -0.1, &config).unwrap();
        assert!(b.double_value(&[]) < a.double_value(&[]));
    }

    #[test]
    fn test_loss_is_divided_by_accumulation_steps() {
        let config = RlTrainingConfig::default()
            .with_accumulation_steps(4)
            .with_reward_weight(2.0);
        let logprob = Tensor::from(-1.0f32);
        let loss = reinforce_loss(&logprob, 1.0, &config).unwrap();
        assert!((loss.double_value(&[]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_loss_backpropagates() {
        let config = RlTrainingConfig::default();
        let x = Tensor::from(-2.0f32).set_requires_grad(true);
        let logprob = &x * 1.0;
        reinforce_loss(&logprob, 1.0, &config).unwrap().backward();
        assert_eq!(x.grad().double_value(&[]), -1.0);
    }
}
