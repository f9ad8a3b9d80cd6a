//! Stepping contract over a glucose-metabolism simulator.
//!
//! A simulator only becomes steppable after `reset`: [`PendingEnvironment`]
//! is what a factory hands out, and [`PendingEnvironment::reset`] is the only
//! way to obtain an [`Environment`].

use super::error::Result;
use super::types::{Action, Observation, PatientId, StepOutcome};

/// A simulator whose whole state is captured by `Clone`.
pub trait GlucoseSimulator: Clone + Send + 'static {
    fn reset(&mut self) -> Observation;
    fn step(&mut self, action: Action) -> StepOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentRequest {
    pub patient: PatientId,
    pub initial_glucose: f64,
    /// Carbohydrate grams per step, starting at the first simulated step.
    pub reference_meals: Vec<f64>,
}

pub trait SimulatorFactory {
    type Simulator: GlucoseSimulator;

    /// Fails with `PatientNotFound` when no parameters exist for the patient.
    fn create(&self, request: &EnvironmentRequest)
    -> Result<PendingEnvironment<Self::Simulator>>;
}

#[derive(Debug)]
pub struct PendingEnvironment<S> {
    simulator: S,
}

impl<S: GlucoseSimulator> PendingEnvironment<S> {
    pub fn new(simulator: S) -> Self {
        Self { simulator }
    }

    pub fn reset(mut self) -> (Environment<S>, Observation) {
        let observation = self.simulator.reset();
        let env = Environment {
            simulator: self.simulator,
            steps_taken: 0,
        };
        (env, observation)
    }
}

#[derive(Debug)]
pub struct Environment<S> {
    simulator: S,
    steps_taken: usize,
}

impl<S: GlucoseSimulator> Environment<S> {
    pub fn step(&mut self, basal: f64, bolus: f64) -> StepOutcome {
        self.steps_taken += 1;
        self.simulator.step(Action { basal, bolus })
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn snapshot(&self) -> Snapshot<S> {
        Snapshot {
            simulator: self.simulator.clone(),
            steps_taken: self.steps_taken,
        }
    }
}

/// Owned, independent copy of an environment's full state.
#[derive(Debug, Clone)]
pub struct Snapshot<S> {
    simulator: S,
    steps_taken: usize,
}

impl<S: GlucoseSimulator> Snapshot<S> {
    pub fn restore(&self) -> Environment<S> {
        Environment {
            simulator: self.simulator.clone(),
            steps_taken: self.steps_taken,
        }
    }

    pub fn into_environment(self) -> Environment<S> {
        Environment {
            simulator: self.simulator,
            steps_taken: self.steps_taken,
        }
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::types::StepInfo;

    /// Linear toy simulator: glucose drifts by `meal - 100*insulin` per step and
    /// never reads below the 39 mg/dL sensor floor.
    #[derive(Debug, Clone)]
    pub struct LinearSimulator {
        pub initial: f64,
        pub glucose: f64,
        pub meals: Vec<f64>,
        pub elapsed: usize,
        pub resets: usize,
    }

    impl LinearSimulator {
        pub fn new(initial: f64, meals: Vec<f64>) -> Self {
            Self {
                initial,
                glucose: initial,
                meals,
                elapsed: 0,
                resets: 0,
            }
        }
    }

    impl GlucoseSimulator for LinearSimulator {
        fn reset(&mut self) -> Observation {
            self.glucose = self.initial;
            self.elapsed = 0;
            self.resets += 1;
            Observation {
                glucose: self.glucose,
            }
        }

        fn step(&mut self, action: Action) -> StepOutcome {
            let meal = self.meals.get(self.elapsed).copied().unwrap_or(0.0);
            let insulin = action.basal * 3.0 + action.bolus;
            self.glucose = (self.glucose + meal - 100.0 * insulin).max(39.0);
            self.elapsed += 1;
            StepOutcome {
                observation: Observation {
                    glucose: self.glucose,
                },
                reward: 0.0,
                done: false,
                info: StepInfo {
                    elapsed_minutes: self.elapsed as u32 * 3,
                    blood_glucose: self.glucose,
                    meal_grams: meal,
                    delivered_insulin: insulin,
                    risk: 0.0,
                },
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct LinearFactory {
        pub known: Vec<PatientId>,
    }

    impl SimulatorFactory for LinearFactory {
        type Simulator = LinearSimulator;

        fn create(
            &self,
            request: &EnvironmentRequest,
        ) -> Result<PendingEnvironment<LinearSimulator>> {
            if !self.known.contains(&request.patient) {
                return Err(crate::core::error::WizardError::PatientNotFound(
                    request.patient.to_string(),
                ));
            }
            Ok(PendingEnvironment::new(LinearSimulator::new(
                request.initial_glucose,
                request.reference_meals.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::LinearSimulator;
    use super::*;

    #[test]
    fn reset_returns_initial_observation_and_counts_from_zero() {
        let (env, obs) = PendingEnvironment::new(LinearSimulator::new(140.0, vec![])).reset();
        assert_eq!(obs.glucose, 140.0);
        assert_eq!(env.steps_taken(), 0);
    }

    #[test]
    fn snapshot_is_independent_of_original() {
        let (mut env, _) = PendingEnvironment::new(LinearSimulator::new(150.0, vec![])).reset();
        env.step(0.0, 0.1);
        let snapshot = env.snapshot();

        env.step(0.0, 0.2);
        env.step(0.0, 0.2);

        let mut restored = snapshot.restore();
        assert_eq!(restored.steps_taken(), 1);
        let out = restored.step(0.0, 0.0);
        assert_eq!(out.observation.glucose, 140.0);
        assert_eq!(env.steps_taken(), 3);

        let again = snapshot.restore();
        assert_eq!(again.steps_taken(), 1);
    }

    #[test]
    fn restored_and_original_produce_identical_sequences() {
        let meals = (0..40).map(|i| (i % 7) as f64).collect::<Vec<_>>();
        let (mut env, _) = PendingEnvironment::new(LinearSimulator::new(120.0, meals)).reset();
        env.step(0.01, 0.0);
        let snapshot = env.snapshot();
        let mut restored = snapshot.into_environment();

        for t in 0..30 {
            let bolus = if t == 5 { 0.3 } else { 0.0 };
            let a = env.step(0.02, bolus);
            let b = restored.step(0.02, bolus);
            assert_eq!(a.observation.glucose.to_bits(), b.observation.glucose.to_bits());
        }
    }
}
