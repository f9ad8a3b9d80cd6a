use tracing::info;

use super::data::PatientTable;
use super::environment::{
    EnvironmentRequest, GlucoseSimulator, PendingEnvironment, SimulatorFactory,
};
use super::error::{Result, WizardError};
use super::types::{
    Action, Observation, PatientId, PatientParams, SEGMENT_COUNT, SEGMENT_STEPS, StepInfo,
    StepOutcome,
};

const SAMPLE_MINUTES: u32 = 3;
const SENSOR_MIN: f64 = 39.0;
const SENSOR_MAX: f64 = 400.0;
const SENSOR_NOISE_PERSISTENCE: f64 = 0.7;
const DONE_LOW: f64 = 70.0;
const DONE_HIGH: f64 = 350.0;
const DAY_STEPS: usize = SEGMENT_STEPS * SEGMENT_COUNT as usize;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScenarioSource {
    Reference,
    Seeded(u64),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulatorSettings {
    pub sensor_noise_sd: f64,
    pub sensor_seed: u64,
    pub max_basal: f64,
    pub max_bolus: f64,
    pub scenario: ScenarioSource,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            sensor_noise_sd: 2.0,
            sensor_seed: 42,
            max_basal: 0.05,
            max_bolus: 5.0,
            scenario: ScenarioSource::Reference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PatientState {
    depot_fast: f64,
    depot_slow: f64,
    plasma_insulin: f64,
    insulin_action: f64,
    gut: f64,
    glucose: f64,
}

impl PatientState {
    fn offset(&self, k: &PatientState, h: f64) -> PatientState {
        PatientState {
            depot_fast: self.depot_fast + h * k.depot_fast,
            depot_slow: self.depot_slow + h * k.depot_slow,
            plasma_insulin: self.plasma_insulin + h * k.plasma_insulin,
            insulin_action: self.insulin_action + h * k.insulin_action,
            gut: self.gut + h * k.gut,
            glucose: self.glucose + h * k.glucose,
        }
    }

    fn rk4_combine(&self, k1: &Self, k2: &Self, k3: &Self, k4: &Self) -> PatientState {
        let blend = |a: f64, b: f64, c: f64, d: f64| (a + 2.0 * b + 2.0 * c + d) / 6.0;
        PatientState {
            depot_fast: self.depot_fast
                + blend(k1.depot_fast, k2.depot_fast, k3.depot_fast, k4.depot_fast),
            depot_slow: self.depot_slow
                + blend(k1.depot_slow, k2.depot_slow, k3.depot_slow, k4.depot_slow),
            plasma_insulin: self.plasma_insulin
                + blend(
                    k1.plasma_insulin,
                    k2.plasma_insulin,
                    k3.plasma_insulin,
                    k4.plasma_insulin,
                ),
            insulin_action: self.insulin_action
                + blend(
                    k1.insulin_action,
                    k2.insulin_action,
                    k3.insulin_action,
                    k4.insulin_action,
                ),
            gut: self.gut + blend(k1.gut, k2.gut, k3.gut, k4.gut),
            glucose: self.glucose + blend(k1.glucose, k2.glucose, k3.glucose, k4.glucose),
        }
    }
}

/// Minimal-model patient: two subcutaneous insulin depots feeding plasma
/// insulin, remote insulin action, and a single gut compartment.
#[derive(Debug, Clone)]
struct PatientModel {
    params: PatientParams,
    initial_glucose: f64,
    state: PatientState,
}

impl PatientModel {
    fn new(params: PatientParams, initial_glucose: f64) -> Self {
        let mut model = Self {
            params,
            initial_glucose,
            state: PatientState {
                depot_fast: 0.0,
                depot_slow: 0.0,
                plasma_insulin: 0.0,
                insulin_action: 0.0,
                gut: 0.0,
                glucose: initial_glucose,
            },
        };
        model.reset();
        model
    }

    /// Insulin delivery (U/min) that holds plasma insulin at its basal level.
    fn equilibrium_insulin_rate(&self) -> f64 {
        let p = &self.params;
        p.basal_insulin * p.insulin_clearance * p.insulin_volume * p.body_weight / 1000.0
    }

    fn reset(&mut self) {
        let depot = self.equilibrium_insulin_rate() / self.params.insulin_absorption;
        self.state = PatientState {
            depot_fast: depot,
            depot_slow: depot,
            plasma_insulin: self.params.basal_insulin,
            insulin_action: 0.0,
            gut: 0.0,
            glucose: self.initial_glucose,
        };
    }

    fn derivatives(&self, s: &PatientState, insulin_rate: f64, meal_rate: f64) -> PatientState {
        let p = &self.params;
        let kd = p.insulin_absorption;
        let appearance = kd * s.depot_slow * 1000.0 / (p.insulin_volume * p.body_weight);
        let glucose_appearance = p.meal_absorption * s.gut * 1000.0 / (p.glucose_volume * p.body_weight);
        let glucose = s.glucose.max(0.0);

        PatientState {
            depot_fast: insulin_rate - kd * s.depot_fast,
            depot_slow: kd * s.depot_fast - kd * s.depot_slow,
            plasma_insulin: appearance - p.insulin_clearance * s.plasma_insulin,
            insulin_action: -p.p2 * s.insulin_action + p.p3 * (s.plasma_insulin - p.basal_insulin),
            gut: meal_rate - p.meal_absorption * s.gut,
            glucose: -(p.p1 + s.insulin_action) * glucose + p.p1 * p.basal_glucose + glucose_appearance,
        }
    }

    fn advance_minute(&mut self, insulin_rate: f64, meal_rate: f64) {
        let s = self.state;
        let k1 = self.derivatives(&s, insulin_rate, meal_rate);
        let k2 = self.derivatives(&s.offset(&k1, 0.5), insulin_rate, meal_rate);
        let k3 = self.derivatives(&s.offset(&k2, 0.5), insulin_rate, meal_rate);
        let k4 = self.derivatives(&s.offset(&k3, 1.0), insulin_rate, meal_rate);
        let mut next = s.rk4_combine(&k1, &k2, &k3, &k4);
        next.glucose = next.glucose.max(0.0);
        next.gut = next.gut.max(0.0);
        next.depot_fast = next.depot_fast.max(0.0);
        next.depot_slow = next.depot_slow.max(0.0);
        next.plasma_insulin = next.plasma_insulin.max(0.0);
        self.state = next;
    }

    fn blood_glucose(&self) -> f64 {
        self.state.glucose
    }
}

/// CGM with AR(1) noise. `reset` rewinds the noise to its first draw.
#[derive(Debug, Clone)]
struct CgmSensor {
    noise_sd: f64,
    origin: DrawStream,
    draws: DrawStream,
    noise: f64,
}

impl CgmSensor {
    fn new(noise_sd: f64, draws: DrawStream) -> Self {
        Self {
            noise_sd,
            origin: draws.clone(),
            draws,
            noise: 0.0,
        }
    }

    fn reset(&mut self) {
        self.draws = self.origin.clone();
        self.noise = 0.0;
    }

    fn measure(&mut self, blood_glucose: f64) -> f64 {
        if self.noise_sd > 0.0 {
            let innovation_sd = self.noise_sd
                * (1.0 - SENSOR_NOISE_PERSISTENCE * SENSOR_NOISE_PERSISTENCE).sqrt();
            self.noise =
                SENSOR_NOISE_PERSISTENCE * self.noise + self.draws.gaussian(innovation_sd);
        }
        (blood_glucose + self.noise).clamp(SENSOR_MIN, SENSOR_MAX)
    }
}

#[derive(Debug, Clone, Copy)]
struct InsulinPump {
    max_basal: f64,
    max_bolus: f64,
}

impl InsulinPump {
    fn deliver(&self, action: Action) -> Action {
        Action {
            basal: clamp_dose(action.basal, self.max_basal),
            bolus: clamp_dose(action.bolus, self.max_bolus),
        }
    }
}

fn clamp_dose(value: f64, max: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, max)
    } else {
        0.0
    }
}

/// Carbohydrate grams ingested during each simulator step.
#[derive(Debug, Clone, PartialEq)]
pub struct MealScenario {
    grams_per_step: Vec<f64>,
}

impl MealScenario {
    pub fn from_steps(grams_per_step: Vec<f64>) -> Self {
        Self { grams_per_step }
    }

    /// Pure function of `(patient, seed)`: four meal windows over a day of
    /// three segments, the afternoon and late snacks drawn with a coin flip.
    pub fn seeded(patient: &PatientId, seed: u64) -> Self {
        let mut draws = DrawStream::for_patient(seed, patient);
        let mut grams_per_step = vec![0.0; DAY_STEPS];
        let windows: [(usize, usize, f64, f64, f64); 5] = [
            (10, 40, 35.0, 60.0, 1.0),
            (90, 130, 50.0, 80.0, 1.0),
            (180, 220, 10.0, 25.0, 0.5),
            (260, 310, 55.0, 90.0, 1.0),
            (400, 450, 10.0, 20.0, 0.3),
        ];
        for (first, last, min_g, max_g, probability) in windows {
            let eaten = draws.chance(probability);
            let step = draws.between(first as f64, last as f64) as usize;
            let grams = draws.between(min_g, max_g);
            if eaten {
                grams_per_step[step] += (grams * 10.0).round() / 10.0;
            }
        }
        Self { grams_per_step }
    }

    pub fn meal_at(&self, step: usize) -> f64 {
        self.grams_per_step.get(step).copied().unwrap_or(0.0)
    }

    pub fn total_grams(&self) -> f64 {
        self.grams_per_step.iter().sum()
    }
}

#[derive(Debug, Clone)]
pub struct T1dSimulator {
    patient: PatientModel,
    sensor: CgmSensor,
    pump: InsulinPump,
    scenario: MealScenario,
    elapsed_steps: usize,
    last_risk: f64,
}

impl T1dSimulator {
    pub fn new(
        params: PatientParams,
        initial_glucose: f64,
        scenario: MealScenario,
        settings: &SimulatorSettings,
    ) -> Self {
        let sensor_draws = DrawStream::for_patient(settings.sensor_seed, &params.name);
        Self {
            patient: PatientModel::new(params, initial_glucose),
            sensor: CgmSensor::new(settings.sensor_noise_sd, sensor_draws),
            pump: InsulinPump {
                max_basal: settings.max_basal,
                max_bolus: settings.max_bolus,
            },
            scenario,
            elapsed_steps: 0,
            last_risk: 0.0,
        }
    }

    pub fn blood_glucose(&self) -> f64 {
        self.patient.blood_glucose()
    }
}

impl GlucoseSimulator for T1dSimulator {
    fn reset(&mut self) -> Observation {
        self.patient.reset();
        self.sensor.reset();
        self.elapsed_steps = 0;
        let bg = self.patient.blood_glucose();
        self.last_risk = risk_index(bg);
        Observation {
            glucose: self.sensor.measure(bg),
        }
    }

    fn step(&mut self, action: Action) -> StepOutcome {
        let delivered = self.pump.deliver(action);
        let meal_grams = self.scenario.meal_at(self.elapsed_steps);
        let minutes = SAMPLE_MINUTES as f64;
        let insulin_rate = delivered.basal + delivered.bolus / minutes;
        let meal_rate = meal_grams / minutes;
        for _ in 0..SAMPLE_MINUTES {
            self.patient.advance_minute(insulin_rate, meal_rate);
        }
        self.elapsed_steps += 1;

        let bg = self.patient.blood_glucose();
        let risk = risk_index(bg);
        let reward = self.last_risk - risk;
        self.last_risk = risk;

        StepOutcome {
            observation: Observation {
                glucose: self.sensor.measure(bg),
            },
            reward,
            done: !(DONE_LOW..=DONE_HIGH).contains(&bg),
            info: StepInfo {
                elapsed_minutes: self.elapsed_steps as u32 * SAMPLE_MINUTES,
                blood_glucose: bg,
                meal_grams,
                delivered_insulin: delivered.basal * minutes + delivered.bolus,
                risk,
            },
        }
    }
}

/// Kovatchev symmetric glucose risk.
fn risk_index(blood_glucose: f64) -> f64 {
    let f = 1.509 * (blood_glucose.max(1.0).ln().powf(1.084) - 5.381);
    10.0 * f * f
}

#[derive(Debug, Clone)]
pub struct T1dFactory {
    table: PatientTable,
    settings: SimulatorSettings,
}

impl T1dFactory {
    pub fn new(table: PatientTable, settings: SimulatorSettings) -> Self {
        Self { table, settings }
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }
}

impl SimulatorFactory for T1dFactory {
    type Simulator = T1dSimulator;

    fn create(&self, request: &EnvironmentRequest) -> Result<PendingEnvironment<T1dSimulator>> {
        let params = self
            .table
            .get(&request.patient)
            .cloned()
            .ok_or_else(|| WizardError::PatientNotFound(request.patient.to_string()))?;
        let scenario = match self.settings.scenario {
            ScenarioSource::Reference => MealScenario::from_steps(request.reference_meals.clone()),
            ScenarioSource::Seeded(seed) => MealScenario::seeded(&request.patient, seed),
        };
        info!(
            patient = %request.patient,
            initial_glucose = request.initial_glucose,
            scenario_grams = scenario.total_grams(),
            "simulator created"
        );
        Ok(PendingEnvironment::new(T1dSimulator::new(
            params,
            request.initial_glucose,
            scenario,
            &self.settings,
        )))
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// SplitMix64 output function.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Reproducible random draws owned by one patient. Two streams built from the
/// same seed and patient name yield the same sequence; cloning one forks it.
#[derive(Debug, Clone, PartialEq)]
struct DrawStream {
    counter: u64,
    spare_gaussian: Option<f64>,
}

impl DrawStream {
    fn for_patient(seed: u64, patient: &PatientId) -> Self {
        Self {
            counter: mix64(seed ^ fnv1a(patient.as_str())),
            spare_gaussian: None,
        }
    }

    fn next_bits(&mut self) -> u64 {
        self.counter = self.counter.wrapping_add(GOLDEN_GAMMA);
        mix64(self.counter)
    }

    /// Uniform in the open interval (0, 1).
    fn unit(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / (1_u64 << 53) as f64;
        ((self.next_bits() >> 11) as f64 + 0.5) * SCALE
    }

    fn between(&mut self, low: f64, high: f64) -> f64 {
        low + self.unit() * (high - low)
    }

    fn chance(&mut self, probability: f64) -> bool {
        self.unit() < probability
    }

    /// Zero-mean normal draw (Marsaglia polar method, second value kept).
    fn gaussian(&mut self, sd: f64) -> f64 {
        if let Some(z) = self.spare_gaussian.take() {
            return sd * z;
        }
        loop {
            let u = self.between(-1.0, 1.0);
            let v = self.between(-1.0, 1.0);
            let s = u * u + v * v;
            if s > 0.0 && s < 1.0 {
                let scale = (-2.0 * s.ln() / s).sqrt();
                self.spare_gaussian = Some(v * scale);
                return sd * u * scale;
            }
        }
    }
}
