use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared_models::Genome;
use tracing::debug;

use crate::param_mapper::{snap_to_step, ParamSpec};

/// Mutation intensity selected from the strategy's current fitness. A
/// struggling strategy explores hard; a strong one only fine-tunes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationTier {
    Aggressive,
    Moderate,
    FineTune,
}

impl MutationTier {
    pub fn for_fitness(fitness: f64) -> Self {
        if fitness < 0.3 {
            MutationTier::Aggressive
        } else if fitness < 0.6 {
            MutationTier::Moderate
        } else {
            MutationTier::FineTune
        }
    }

    pub fn mutation_rate(&self) -> f64 {
        match self {
            MutationTier::Aggressive => 0.30,
            MutationTier::Moderate => 0.15,
            MutationTier::FineTune => 0.05,
        }
    }

    pub fn candidate_count(&self) -> usize {
        match self {
            MutationTier::Aggressive => 8,
            MutationTier::Moderate => 5,
            MutationTier::FineTune => 3,
        }
    }

    pub fn params_to_mutate(&self) -> usize {
        match self {
            MutationTier::Aggressive => 6,
            MutationTier::Moderate => 4,
            MutationTier::FineTune => 2,
        }
    }
}

/// Later candidates in a batch explore progressively further out.
const ESCALATION_PER_CANDIDATE: f64 = 0.15;

pub struct CandidateGenerator {
    rng: StdRng,
}

impl CandidateGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded constructor so test runs are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Produce mutated candidate genomes for the given parameter specs at
    /// the intensity tier implied by `fitness`. Every candidate is a full
    /// genome copy with only the selected high-importance subset altered;
    /// mutated values are clamped to range and snapped to step size.
    pub fn generate(&mut self, specs: &[ParamSpec], fitness: f64) -> Vec<Genome> {
        let tier = MutationTier::for_fitness(fitness);
        let rate = tier.mutation_rate();

        // Highest-importance parameters first; ties broken by name so the
        // selection is stable.
        let mut ranked: Vec<&ParamSpec> = specs.iter().collect();
        ranked.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        let targets: Vec<&ParamSpec> =
            ranked.into_iter().take(tier.params_to_mutate()).collect();

        let base: Genome = specs
            .iter()
            .map(|s| (s.name.clone(), s.current))
            .collect();

        let mut candidates = Vec::with_capacity(tier.candidate_count());
        for i in 0..tier.candidate_count() {
            let escalation = 1.0 + i as f64 * ESCALATION_PER_CANDIDATE;
            let mut genome = base.clone();
            for spec in &targets {
                let perturbation = self.rng.gen_range(-1.0..=1.0)
                    * rate
                    * spec.range()
                    * spec.importance
                    * escalation;
                let mutated = (spec.current + perturbation).clamp(spec.min, spec.max);
                genome.insert(spec.name.clone(), snap_to_step(mutated, spec));
            }
            candidates.push(genome);
        }

        debug!(
            tier = ?tier,
            candidates = candidates.len(),
            mutated_params = targets.len(),
            "generated candidate batch"
        );

        candidates
    }

    /// Uniform crossover of two parent genomes: each parameter is taken
    /// whole from one parent or the other. Parameters present in only one
    /// parent carry over unchanged.
    pub fn crossover(&mut self, a: &Genome, b: &Genome) -> Genome {
        let mut child = Genome::new();
        for (name, &value_a) in a {
            match b.get(name) {
                Some(&value_b) => {
                    let pick = if self.rng.gen::<bool>() { value_a } else { value_b };
                    child.insert(name.clone(), pick);
                }
                None => {
                    child.insert(name.clone(), value_a);
                }
            }
        }
        for (name, &value_b) in b {
            child.entry(name.clone()).or_insert(value_b);
        }
        child
    }
}

impl Default for CandidateGenerator {
    fn default() -> Self {
        Self::new()
    }
}
