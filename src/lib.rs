use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

#[derive(Clone, Copy, Debug)]
struct Reactant {
    species: usize,
    count: i32,
}

#[derive(Clone, Copy, Debug)]
struct SpeciesDelta {
    species: usize,
    delta: i32,
}

#[derive(Clone, Copy, Debug)]
struct Term {
    coefficient: i32,
    species: usize,
}

/// A reaction network compiled from its textual description.
///
/// The grammar is a comma-separated list of reactions of the form
/// `2X1+X2->X3`: sides separated by one `->`, terms separated by `+`,
/// each term an optional integer coefficient followed by `X` and a
/// 1-based species index. A bare `0` stands for an empty side.
#[derive(Clone, Debug)]
pub struct ReactionNetwork {
    n_species: usize,
    n_reactions: usize,
    substrate_stoich: Vec<i32>,
    product_stoich: Vec<i32>,
    reactants: Vec<Vec<Reactant>>,
    reaction_deltas: Vec<Vec<SpeciesDelta>>,
}

impl ReactionNetwork {
    pub fn parse(text: &str) -> Result<Self, SimError> {
        let mut parsed = Vec::new();
        let mut n_species = 0usize;
        for (reaction_idx, reaction_text) in text.split(',').enumerate() {
            let mut sides = reaction_text.split("->");
            let (lhs, rhs) = match (sides.next(), sides.next(), sides.next()) {
                (Some(lhs), Some(rhs), None) => (lhs, rhs),
                (_, None, _) => {
                    return Err(SimError::Parse(format!(
                        "reaction {} ('{}') is missing '->'",
                        reaction_idx, reaction_text
                    )));
                }
                _ => {
                    return Err(SimError::Parse(format!(
                        "reaction {} ('{}') contains more than one '->'",
                        reaction_idx, reaction_text
                    )));
                }
            };
            let substrates = parse_side(lhs, reaction_idx)?;
            let products = parse_side(rhs, reaction_idx)?;
            for term in substrates.iter().chain(products.iter()) {
                n_species = n_species.max(term.species + 1);
            }
            parsed.push((substrates, products));
        }
        if n_species == 0 {
            return Err(SimError::Parse(
                "network does not reference any species".into(),
            ));
        }

        let n_reactions = parsed.len();
        let mut substrate_stoich = vec![0i32; n_reactions * n_species];
        let mut product_stoich = vec![0i32; n_reactions * n_species];
        for (r, (substrates, products)) in parsed.iter().enumerate() {
            for term in substrates {
                substrate_stoich[r * n_species + term.species] = -term.coefficient;
            }
            for term in products {
                product_stoich[r * n_species + term.species] = term.coefficient;
            }
        }

        let reactants = substrate_stoich
            .chunks_exact(n_species)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter_map(|(species, &entry)| {
                        (entry < 0).then_some(Reactant {
                            species,
                            count: -entry,
                        })
                    })
                    .collect()
            })
            .collect();

        let combined: Vec<i32> = substrate_stoich
            .iter()
            .zip(product_stoich.iter())
            .map(|(&s, &p)| s + p)
            .collect();
        let reaction_deltas = build_reaction_deltas(n_species, &combined);

        Ok(Self {
            n_species,
            n_reactions,
            substrate_stoich,
            product_stoich,
            reactants,
            reaction_deltas,
        })
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_reactions(&self) -> usize {
        self.n_reactions
    }

    /// Substrate stoichiometry, row-major n_reactions × n_species, entries ≤ 0.
    pub fn substrate_stoich(&self) -> &[i32] {
        &self.substrate_stoich
    }

    /// Product stoichiometry, row-major n_reactions × n_species, entries ≥ 0.
    pub fn product_stoich(&self) -> &[i32] {
        &self.product_stoich
    }

    #[inline]
    fn propensity(&self, reaction: usize, rate_constant: f64, state: &[f64]) -> f64 {
        let mut value = rate_constant;
        for reactant in &self.reactants[reaction] {
            let available = state[reactant.species].floor() as i64;
            if available <= 0 {
                return 0.0;
            }
            value *= ordered_combinations(available, reactant.count);
        }
        value
    }
}

fn parse_side(side: &str, reaction_idx: usize) -> Result<Vec<Term>, SimError> {
    let mut terms = Vec::new();
    for token in side.split('+') {
        let token = token.trim();
        // A bare `0` (or nothing at all) is the empty-side placeholder.
        if token.is_empty() || token == "0" {
            continue;
        }
        let Some((coefficient_text, species_text)) = token.split_once('X') else {
            return Err(SimError::Parse(format!(
                "reaction {}: term '{}' has no species reference",
                reaction_idx, token
            )));
        };
        let coefficient = if coefficient_text.is_empty() {
            1
        } else {
            coefficient_text.parse::<i32>().map_err(|_| {
                SimError::Parse(format!(
                    "reaction {}: coefficient '{}' in term '{}' is not an integer",
                    reaction_idx, coefficient_text, token
                ))
            })?
        };
        if coefficient < 0 {
            return Err(SimError::Parse(format!(
                "reaction {}: coefficient '{}' in term '{}' is negative",
                reaction_idx, coefficient_text, token
            )));
        }
        let index = species_text.parse::<usize>().map_err(|_| {
            SimError::Parse(format!(
                "reaction {}: species index '{}' in term '{}' is not an integer",
                reaction_idx, species_text, token
            ))
        })?;
        if index == 0 {
            return Err(SimError::Parse(format!(
                "reaction {}: species indices are 1-based, found '{}'",
                reaction_idx, token
            )));
        }
        terms.push(Term {
            coefficient,
            species: index - 1,
        });
    }
    Ok(terms)
}

fn build_reaction_deltas(n_species: usize, stoich: &[i32]) -> Vec<Vec<SpeciesDelta>> {
    stoich
        .chunks_exact(n_species)
        .map(|row| {
            row.iter()
                .enumerate()
                .filter_map(|(species, &delta)| {
                    (delta != 0).then_some(SpeciesDelta { species, delta })
                })
                .collect()
        })
        .collect()
}

/// Number of distinct ordered ways to pick `m` molecules out of `n`:
/// C(n, m) × m!. Computed by additive binomial-row accumulation rather
/// than a factorial ratio.
fn ordered_combinations(n: i64, m: i32) -> f64 {
    if m <= 0 {
        return 1.0;
    }
    if n < m as i64 {
        return 0.0;
    }
    let width = m as usize;
    let mut row = vec![0u128; width + 1];
    row[0] = 1;
    for i in 1..=(n as usize) {
        for j in (1..=width.min(i)).rev() {
            row[j] = row[j].saturating_add(row[j - 1]);
        }
    }
    let mut factorial = 1.0f64;
    for k in 2..=width {
        factorial *= k as f64;
    }
    row[width] as f64 * factorial
}

fn recompute_propensities(
    network: &ReactionNetwork,
    rate_constants: &[f64],
    state: &[f64],
    propensities: &mut [f64],
) -> f64 {
    let mut total = 0.0;
    for reaction in 0..network.n_reactions {
        let value = network.propensity(reaction, rate_constants[reaction], state);
        total += value;
        propensities[reaction] = value;
    }
    total
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NextEvent {
    pub wait: f64,
    pub reaction: usize,
}

/// Draw the next event from the current propensity vector. `r1` drives
/// the exponential waiting time, `r2` the reaction selection. Returns
/// `None` when the total propensity is zero (no reaction can fire).
pub fn next_event(propensities: &[f64], r1: f64, r2: f64) -> Option<NextEvent> {
    let total: f64 = propensities.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let wait = (1.0 / r1).ln() / total;
    Some(NextEvent {
        wait,
        reaction: select_reaction(propensities, total, r2),
    })
}

fn select_reaction(propensities: &[f64], total: f64, r2: f64) -> usize {
    let mut deficit = r2 * total;
    for (reaction, &value) in propensities.iter().enumerate() {
        deficit -= value;
        if deficit <= 0.0 {
            return reaction;
        }
    }
    // Round-off can leave a sliver of deficit after the full scan.
    propensities.len() - 1
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    HorizonReached,
    StepBudgetExhausted,
    Stalled,
}

#[derive(Clone, Debug)]
pub struct SimulationOptions {
    pub t_max: f64,
    pub max_steps: usize,
}

/// Piecewise-constant trajectory: one record per fired event, holding
/// the elapsed time at which the state began, the state itself, and the
/// time until the next event.
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    n_species: usize,
    times: Vec<f64>,
    waits: Vec<f64>,
    states: Vec<f64>,
}

impl Trajectory {
    fn with_capacity(n_species: usize, capacity: usize) -> Self {
        Self {
            n_species,
            times: Vec::with_capacity(capacity),
            waits: Vec::with_capacity(capacity),
            states: Vec::with_capacity(capacity * n_species),
        }
    }

    fn record(&mut self, time: f64, wait: f64, state: &[f64]) {
        debug_assert_eq!(state.len(), self.n_species);
        self.times.push(time);
        self.waits.push(wait);
        self.states.extend_from_slice(state);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn waits(&self) -> &[f64] {
        &self.waits
    }

    /// State snapshot held during step `step`.
    pub fn state(&self, step: usize) -> &[f64] {
        &self.states[step * self.n_species..(step + 1) * self.n_species]
    }

    pub fn total_elapsed(&self) -> f64 {
        self.waits.iter().sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationResult {
    pub trajectory: Trajectory,
    pub termination: Termination,
    pub final_state: Vec<f64>,
    pub final_time: f64,
}

/// Run one stochastic trajectory of `network` from `initial_state`.
///
/// Two uniform draw streams of length `max_steps` are taken from `rng`
/// up front (waiting times first, then reaction selection) and consumed
/// in lockstep with the step index, so a seed fully determines the run.
pub fn simulate(
    network: &ReactionNetwork,
    rate_constants: &[f64],
    initial_state: &[f64],
    options: &SimulationOptions,
    rng: &mut ChaCha8Rng,
) -> Result<SimulationResult, SimError> {
    if rate_constants.len() != network.n_reactions {
        return Err(SimError::Shape(format!(
            "rate constant length {} does not match reaction count {}",
            rate_constants.len(),
            network.n_reactions
        )));
    }
    if initial_state.len() != network.n_species {
        return Err(SimError::Shape(format!(
            "initial state length {} does not match number of species {}",
            initial_state.len(),
            network.n_species
        )));
    }
    if options.t_max <= 0.0 {
        return Err(SimError::InvalidArgument("t_max must be positive".into()));
    }
    if options.max_steps == 0 {
        return Err(SimError::InvalidArgument(
            "max_steps must be greater than zero".into(),
        ));
    }

    let wait_draws: Vec<f64> = (0..options.max_steps).map(|_| rng.r#gen()).collect();
    let select_draws: Vec<f64> = (0..options.max_steps).map(|_| rng.r#gen()).collect();

    let mut state = initial_state.to_vec();
    let mut propensities = vec![0.0; network.n_reactions];
    let mut trajectory = Trajectory::with_capacity(network.n_species, options.max_steps.min(1024));
    let mut current_time = 0.0;
    let mut steps = 0usize;

    let termination = loop {
        if current_time >= options.t_max {
            break Termination::HorizonReached;
        }
        if steps >= options.max_steps {
            break Termination::StepBudgetExhausted;
        }
        recompute_propensities(network, rate_constants, &state, &mut propensities);
        let Some(event) = next_event(&propensities, wait_draws[steps], select_draws[steps]) else {
            break Termination::Stalled;
        };
        // Snapshot before the update: this state is held for `event.wait`.
        trajectory.record(current_time, event.wait, &state);
        current_time += event.wait;
        for delta in &network.reaction_deltas[event.reaction] {
            state[delta.species] += delta.delta as f64;
        }
        steps += 1;
    };

    Ok(SimulationResult {
        trajectory,
        termination,
        final_state: state,
        final_time: current_time,
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CvOutcome {
    Value(f64),
    Undefined(CvUndefined),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CvUndefined {
    ZeroElapsedTime,
    ZeroWeightedMean,
}

/// Time-weighted mean of one species column, or `None` when the species
/// index is out of range or no time has elapsed.
pub fn time_weighted_mean(trajectory: &Trajectory, species: usize) -> Option<f64> {
    if species >= trajectory.n_species {
        return None;
    }
    let total = trajectory.total_elapsed();
    if trajectory.is_empty() || total <= 0.0 {
        return None;
    }
    let weighted: f64 = (0..trajectory.len())
        .map(|step| trajectory.waits[step] * trajectory.state(step)[species])
        .sum();
    Some(weighted / total)
}

/// Time-weighted coefficient of variation, in percent, for each tracked
/// species column. Each step's value is held constant for its wait-time
/// duration; weights are normalized by the truncated trajectory's total
/// elapsed time.
pub fn coefficient_of_variation(
    trajectory: &Trajectory,
    tracked: &[usize],
) -> Result<Vec<CvOutcome>, SimError> {
    for &species in tracked {
        if species >= trajectory.n_species {
            return Err(SimError::InvalidArgument(format!(
                "tracked species index {} exceeds number of species {}",
                species, trajectory.n_species
            )));
        }
    }
    let total = trajectory.total_elapsed();
    if trajectory.is_empty() || total <= 0.0 {
        return Ok(vec![
            CvOutcome::Undefined(CvUndefined::ZeroElapsedTime);
            tracked.len()
        ]);
    }
    Ok(tracked
        .iter()
        .map(|&species| {
            let mean = (0..trajectory.len())
                .map(|step| trajectory.waits[step] * trajectory.state(step)[species])
                .sum::<f64>()
                / total;
            if mean == 0.0 {
                return CvOutcome::Undefined(CvUndefined::ZeroWeightedMean);
            }
            let variance = (0..trajectory.len())
                .map(|step| {
                    let value = trajectory.state(step)[species];
                    (value - mean) * (value - mean) * (trajectory.waits[step] / total)
                })
                .sum::<f64>();
            CvOutcome::Value(100.0 * variance.sqrt() / mean)
        })
        .collect())
}

fn derive_seed(seed: Option<u64>, run: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let z = base ^ (run.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    let mut result = z.wrapping_add(GOLDEN_GAMMA);
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

/// Run `n_runs` independent trajectories in parallel. Each run gets its
/// own state, trajectory, and seed derived from `seed` and the run index.
pub fn run_ensemble(
    network: &ReactionNetwork,
    rate_constants: &[f64],
    initial_state: &[f64],
    options: &SimulationOptions,
    n_runs: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
) -> Result<Vec<SimulationResult>, SimError> {
    if n_runs == 0 {
        return Err(SimError::InvalidArgument(
            "number of runs must be greater than zero".into(),
        ));
    }
    let simulate_all = || {
        (0..n_runs)
            .into_par_iter()
            .map(|run| {
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, run as u64));
                simulate(network, rate_constants, initial_state, options, &mut rng)
            })
            .collect::<Result<Vec<_>, SimError>>()
    };
    match n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(simulate_all),
        None => simulate_all(),
    }
}

/// Average the per-species CV over an ensemble. A species that is
/// undefined in any run keeps that undefined marker in the average.
pub fn average_cv(
    results: &[SimulationResult],
    tracked: &[usize],
) -> Result<Vec<CvOutcome>, SimError> {
    if results.is_empty() {
        return Err(SimError::InvalidArgument(
            "cannot average CV over an empty ensemble".into(),
        ));
    }
    let mut sums = vec![0.0f64; tracked.len()];
    let mut undefined: Vec<Option<CvUndefined>> = vec![None; tracked.len()];
    for result in results {
        let outcomes = coefficient_of_variation(&result.trajectory, tracked)?;
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                CvOutcome::Value(value) => sums[idx] += value,
                CvOutcome::Undefined(reason) => {
                    undefined[idx].get_or_insert(reason);
                }
            }
        }
    }
    Ok(sums
        .into_iter()
        .zip(undefined)
        .map(|(sum, reason)| match reason {
            Some(reason) => CvOutcome::Undefined(reason),
            None => CvOutcome::Value(sum / results.len() as f64),
        })
        .collect())
}

/// Parameters of the receptor-trafficking network: one binding and one
/// unbinding reaction per synapse, plus decay and zero-order synthesis
/// of the free receptor pool.
#[derive(Clone, Debug)]
pub struct ReceptorParams {
    /// Slot count per synapse.
    pub slots: Vec<u32>,
    /// Receptors per slot at full occupancy.
    pub phi: f64,
    /// Target filling fraction F, strictly between 0 and 1.
    pub filling_fraction: f64,
    /// Unbinding rate β.
    pub unbinding_rate: f64,
    /// Pool decay rate δ.
    pub decay_rate: f64,
    /// Free receptors in the pool at t = 0.
    pub initial_free_receptors: u32,
}

impl Default for ReceptorParams {
    fn default() -> Self {
        Self {
            slots: vec![20, 40, 60, 80],
            phi: 2.67,
            filling_fraction: 0.9,
            unbinding_rate: 60.0 / 43.0,
            decay_rate: 1.0 / 14.0,
            initial_free_receptors: 0,
        }
    }
}

/// A compiled receptor-trafficking system ready to simulate.
///
/// Species layout: columns `0..n` are bound receptors per synapse,
/// `n..2n` are empty slots, and column `2n` is the free receptor pool.
#[derive(Clone, Debug)]
pub struct ReceptorSystem {
    pub network: ReactionNetwork,
    pub rate_constants: Vec<f64>,
    pub initial_state: Vec<f64>,
    pub bound_species: Vec<usize>,
    pub pool_species: usize,
}

pub fn receptor_trafficking_system(params: &ReceptorParams) -> Result<ReceptorSystem, SimError> {
    if params.slots.is_empty() {
        return Err(SimError::InvalidArgument(
            "at least one synapse is required".into(),
        ));
    }
    if params.slots.iter().any(|&s| s == 0) {
        return Err(SimError::InvalidArgument(
            "every synapse needs a positive slot count".into(),
        ));
    }
    if params.phi <= 0.0 {
        return Err(SimError::InvalidArgument("phi must be positive".into()));
    }
    if params.filling_fraction <= 0.0 || params.filling_fraction >= 1.0 {
        return Err(SimError::InvalidArgument(
            "filling fraction must lie strictly between 0 and 1".into(),
        ));
    }
    if params.unbinding_rate <= 0.0 || params.decay_rate <= 0.0 {
        return Err(SimError::InvalidArgument(
            "unbinding and decay rates must be positive".into(),
        ));
    }

    let n_synapses = params.slots.len();
    let pool = 2 * n_synapses + 1;
    let total_slots: u32 = params.slots.iter().sum();
    let s = total_slots as f64;
    let beta = params.unbinding_rate;
    let delta = params.decay_rate;
    let alpha = beta / (params.phi * s * (1.0 - params.filling_fraction));
    let gamma = delta * (s * params.phi - beta / alpha);

    // Binding X{n+i}+X{pool}->X{i}, then unbinding X{i}->X{n+i}+X{pool},
    // then pool decay and zero-order synthesis.
    let mut text = String::new();
    for i in 1..=n_synapses {
        text.push_str(&format!("X{}+X{}->X{},", n_synapses + i, pool, i));
    }
    for i in 1..=n_synapses {
        text.push_str(&format!("X{}->X{}+X{},", i, n_synapses + i, pool));
    }
    text.push_str(&format!("X{pool}->0X{pool},0X{pool}->X{pool}"));
    let network = ReactionNetwork::parse(&text)?;

    let mut rate_constants = vec![alpha; n_synapses];
    rate_constants.extend(std::iter::repeat(beta).take(n_synapses));
    rate_constants.push(delta);
    rate_constants.push(gamma);

    let mut initial_state = vec![0.0; n_synapses];
    initial_state.extend(params.slots.iter().map(|&count| count as f64));
    initial_state.push(params.initial_free_receptors as f64);

    Ok(ReceptorSystem {
        network,
        rate_constants,
        initial_state,
        bound_species: (0..n_synapses).collect(),
        pool_species: pool - 1,
    })
}
