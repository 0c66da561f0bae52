//! Dempster-Shafer evidence fusion over object-class hypotheses.
//!
//! # Frame of discernment
//! The atoms are the mutually exclusive classes `pedestrian`, `bicycle`,
//! `vehicle` and `other`. A hypothesis is a set of atoms stored as a bitmask;
//! the lattice holds the focal hypotheses a belief assignment (BBA) may put
//! mass on:
//!
//! | hypothesis   | atoms                         |
//! |--------------|-------------------------------|
//! | `pedestrian` | {ped}                         |
//! | `bicycle`    | {bic}                         |
//! | `vehicle`    | {veh}                         |
//! | `other`      | {oth}                         |
//! | `vru`        | {ped, bic}                    |
//! | `movable`    | {ped, bic, veh}               |
//! | `unknown`    | {ped, bic, veh, oth} (universe) |
//!
//! The lattice must be closed under intersection so every pairwise product
//! lands either on a focal hypothesis or on the empty set (conflict).
//!
//! # Initialization
//! [`BeliefLatticeContext::initialize`] builds the intersection lookup table
//! once. It is idempotent and thread-safe; every fusion call checks for it and
//! fails with [`FusionError::UninitializedFusionState`] otherwise.
//!
//! # Combination
//! Dempster's rule: m(C) = Σ_{A∩B=C} m₁(A)·m₂(B) / (1 − K), with K the mass
//! landing on ∅. K ≥ 1 (to [`CONFLICT_EPS`]) is reported as
//! [`FusionError::FusionConflict`].

use crate::{
    config::BeliefConfig,
    error::FusionError,
    types::{ClassProbs, ObjectClass},
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Normalisation constants below this are treated as total conflict.
pub const CONFLICT_EPS: f64 = 1e-9;

const PED: u32 = 0b0001;
const BIC: u32 = 0b0010;
const VEH: u32 = 0b0100;
const OTH: u32 = 0b1000;

/// Atom set that a detector class maps to.
pub fn class_mask(class: ObjectClass) -> u32 {
    match class {
        ObjectClass::Pedestrian => PED,
        ObjectClass::Bicycle => BIC,
        ObjectClass::Vehicle => VEH,
        ObjectClass::Other => OTH,
        ObjectClass::Unknown => PED | BIC | VEH | OTH,
    }
}

/// A named focal set of the frame of discernment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub name: String,
    pub mask: u32,
}

impl Hypothesis {
    pub fn new(name: &str, mask: u32) -> Self {
        Self {
            name: name.to_owned(),
            mask,
        }
    }

    pub fn cardinality(&self) -> u32 {
        self.mask.count_ones()
    }
}

// ---------------------------------------------------------------------------
// Lattice
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LatticeTables {
    /// `intersection[i * n + j]` = index of hypothesis `h_i ∩ h_j`, `None` if empty.
    intersection: Vec<Option<usize>>,
    universe: usize,
    class_index: [usize; ObjectClass::COUNT],
}

/// Hypothesis lattice plus its lazily built combination tables.
///
/// Constructed once by the process entry point and shared (through `Arc`) by
/// every engine and track.
#[derive(Debug)]
pub struct BeliefLatticeContext {
    hypotheses: Vec<Hypothesis>,
    tables: OnceLock<LatticeTables>,
}

impl BeliefLatticeContext {
    /// Validate a hypothesis list. Tables are not built until [`Self::initialize`].
    pub fn new(hypotheses: Vec<Hypothesis>) -> Result<Self, FusionError> {
        if hypotheses.is_empty() {
            return Err(FusionError::InvalidLattice("no hypotheses".into()));
        }
        let mut universe = 0u32;
        for (i, h) in hypotheses.iter().enumerate() {
            if h.mask == 0 {
                return Err(FusionError::InvalidLattice(format!(
                    "hypothesis '{}' is the empty set",
                    h.name
                )));
            }
            if hypotheses[..i].iter().any(|o| o.mask == h.mask) {
                return Err(FusionError::InvalidLattice(format!(
                    "duplicate hypothesis mask {:#b} ('{}')",
                    h.mask, h.name
                )));
            }
            universe |= h.mask;
        }
        let lookup = |mask: u32| hypotheses.iter().position(|h| h.mask == mask);
        if lookup(universe).is_none() {
            return Err(FusionError::InvalidLattice(
                "universal hypothesis missing".into(),
            ));
        }
        for a in &hypotheses {
            for b in &hypotheses {
                let meet = a.mask & b.mask;
                if meet != 0 && lookup(meet).is_none() {
                    return Err(FusionError::InvalidLattice(format!(
                        "not closed under intersection: '{}' ∩ '{}'",
                        a.name, b.name
                    )));
                }
            }
        }
        for class in ObjectClass::ALL {
            let mask = class_mask(class) & universe;
            if lookup(mask).is_none() {
                return Err(FusionError::InvalidLattice(format!(
                    "class '{class}' has no hypothesis"
                )));
            }
        }
        Ok(Self {
            hypotheses,
            tables: OnceLock::new(),
        })
    }

    /// The default object-class lattice (see module docs).
    pub fn object_classes() -> Self {
        let hypotheses = vec![
            Hypothesis::new("pedestrian", PED),
            Hypothesis::new("bicycle", BIC),
            Hypothesis::new("vehicle", VEH),
            Hypothesis::new("other", OTH),
            Hypothesis::new("vru", PED | BIC),
            Hypothesis::new("movable", PED | BIC | VEH),
            Hypothesis::new("unknown", PED | BIC | VEH | OTH),
        ];
        Self {
            hypotheses,
            tables: OnceLock::new(),
        }
    }

    /// Build and initialize the default lattice, ready to share.
    pub fn initialized_object_classes() -> Arc<Self> {
        let lattice = Self::object_classes();
        lattice.initialize();
        Arc::new(lattice)
    }

    /// Build the lookup tables. Calling it again, from any thread, is a no-op.
    pub fn initialize(&self) {
        self.tables.get_or_init(|| self.build_tables());
    }

    pub fn is_initialized(&self) -> bool {
        self.tables.get().is_some()
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.hypotheses.iter().position(|h| h.name == name)
    }

    /// Index of the universal ("unknown") hypothesis.
    pub fn universe(&self) -> Result<usize, FusionError> {
        Ok(self.tables()?.universe)
    }

    /// Index of the hypothesis a detector class maps to.
    pub fn class_hypothesis(&self, class: ObjectClass) -> Result<usize, FusionError> {
        Ok(self.tables()?.class_index[class.index()])
    }

    fn tables(&self) -> Result<&LatticeTables, FusionError> {
        self.tables
            .get()
            .ok_or(FusionError::UninitializedFusionState)
    }

    fn build_tables(&self) -> LatticeTables {
        let n = self.hypotheses.len();
        let lookup = |mask: u32| self.hypotheses.iter().position(|h| h.mask == mask);
        let universe_mask = self.hypotheses.iter().fold(0, |acc, h| acc | h.mask);
        let mut intersection = Vec::with_capacity(n * n);
        for a in &self.hypotheses {
            for b in &self.hypotheses {
                let meet = a.mask & b.mask;
                intersection.push(if meet == 0 { None } else { lookup(meet) });
            }
        }
        // `new` guarantees both lookups below succeed.
        let universe = lookup(universe_mask).unwrap_or(n - 1);
        let class_index =
            ObjectClass::ALL.map(|c| lookup(class_mask(c) & universe_mask).unwrap_or(universe));
        LatticeTables {
            intersection,
            universe,
            class_index,
        }
    }
}

// ---------------------------------------------------------------------------
// Belief assignment
// ---------------------------------------------------------------------------

/// Basic belief assignment: one mass per lattice hypothesis, summing to 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bba {
    masses: Vec<f64>,
}

impl Bba {
    /// All mass on the universal hypothesis: total ignorance.
    pub fn vacuous(lattice: &BeliefLatticeContext) -> Result<Self, FusionError> {
        let universe = lattice.universe()?;
        let mut masses = vec![0.0; lattice.len()];
        masses[universe] = 1.0;
        Ok(Self { masses })
    }

    /// Raw masses; must match the lattice length and be normalisable.
    pub fn from_masses(
        lattice: &BeliefLatticeContext,
        masses: Vec<f64>,
    ) -> Result<Self, FusionError> {
        if masses.len() != lattice.len() {
            return Err(FusionError::InvalidLattice(format!(
                "assignment has {} masses, lattice has {} hypotheses",
                masses.len(),
                lattice.len()
            )));
        }
        if masses.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err(FusionError::InvalidLattice(
                "masses must be finite and non-negative".into(),
            ));
        }
        let total: f64 = masses.iter().sum();
        if total <= CONFLICT_EPS {
            return Err(FusionError::InvalidLattice("masses sum to zero".into()));
        }
        Ok(Self {
            masses: masses.into_iter().map(|m| m / total).collect(),
        })
    }

    pub fn mass(&self, hypothesis: usize) -> f64 {
        self.masses.get(hypothesis).copied().unwrap_or(0.0)
    }

    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    /// Index of the hypothesis carrying the most mass (lowest index on ties).
    pub fn dominant(&self) -> usize {
        let mut best = 0;
        for (i, m) in self.masses.iter().enumerate() {
            if *m > self.masses[best] {
                best = i;
            }
        }
        best
    }

    /// Largest absolute per-hypothesis difference.
    pub fn max_abs_diff(&self, other: &Bba) -> f64 {
        self.masses
            .iter()
            .zip(&other.masses)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Combines belief assignments over a shared, initialized lattice.
#[derive(Clone, Debug)]
pub struct BeliefFusionEngine {
    lattice: Arc<BeliefLatticeContext>,
    config: BeliefConfig,
}

impl BeliefFusionEngine {
    pub fn new(lattice: Arc<BeliefLatticeContext>, config: BeliefConfig) -> Result<Self, FusionError> {
        if !config.decay_rate.is_finite() || config.decay_rate < 0.0 {
            return Err(FusionError::ConfigurationError(format!(
                "belief decay rate must be finite and >= 0, got {}",
                config.decay_rate
            )));
        }
        Ok(Self { lattice, config })
    }

    pub fn lattice(&self) -> &BeliefLatticeContext {
        &self.lattice
    }

    /// Convert a detector's class probabilities into evidence, discounted by
    /// the sensor family's reliability: `reliability · p(c)` goes to the class
    /// hypothesis and `1 − reliability` to the universe.
    pub fn evidence_from_probs(
        &self,
        probs: &ClassProbs,
        reliability: f64,
    ) -> Result<Bba, FusionError> {
        let tables = self.lattice.tables()?;
        probs.validate()?;
        let reliability = reliability.clamp(0.0, 1.0);
        let total: f64 = probs.0.iter().sum();
        let mut masses = vec![0.0; self.lattice.len()];
        for class in ObjectClass::ALL {
            masses[tables.class_index[class.index()]] += reliability * probs.get(class) / total;
        }
        masses[tables.universe] += 1.0 - reliability;
        Ok(Bba { masses })
    }

    /// Dempster's rule of combination.
    pub fn combine(&self, prior: &Bba, evidence: &Bba) -> Result<Bba, FusionError> {
        let tables = self.lattice.tables()?;
        let n = self.lattice.len();
        if prior.masses.len() != n || evidence.masses.len() != n {
            return Err(FusionError::InvalidLattice(
                "assignment does not match the lattice".into(),
            ));
        }

        let mut combined = vec![0.0; n];
        let mut conflict = 0.0;
        for (i, &a) in prior.masses.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            for (j, &b) in evidence.masses.iter().enumerate() {
                if b == 0.0 {
                    continue;
                }
                match tables.intersection[i * n + j] {
                    Some(k) => combined[k] += a * b,
                    None => conflict += a * b,
                }
            }
        }

        // Normalise by the surviving mass rather than 1 − K: equal in exact
        // arithmetic, and keeps the sum at 1 under rounding.
        let norm: f64 = combined.iter().sum();
        if norm <= CONFLICT_EPS {
            return Err(FusionError::FusionConflict { conflict });
        }
        combined.iter_mut().for_each(|m| *m /= norm);
        Ok(Bba { masses: combined })
    }

    /// Move mass from specific hypotheses to the universe. The retained
    /// fraction is `exp(-decay_rate · elapsed)`; `elapsed <= 0` is a no-op.
    pub fn decay_toward_unknown(&self, prior: &Bba, elapsed: f64) -> Result<Bba, FusionError> {
        let universe = self.lattice.universe()?;
        if prior.masses.len() != self.lattice.len() {
            return Err(FusionError::InvalidLattice(
                "assignment does not match the lattice".into(),
            ));
        }
        if elapsed.is_nan() || elapsed <= 0.0 {
            return Ok(prior.clone());
        }
        let keep = (-self.config.decay_rate * elapsed).exp();
        let mut masses = prior.masses.clone();
        let mut released = 0.0;
        for (i, m) in masses.iter_mut().enumerate() {
            if i != universe {
                released += *m * (1.0 - keep);
                *m *= keep;
            }
        }
        masses[universe] += released;
        Ok(Bba { masses })
    }

    /// Pignistic transform: each hypothesis' mass is shared equally among its
    /// atoms. `Unknown` receives nothing.
    pub fn pignistic(&self, bba: &Bba) -> Result<ClassProbs, FusionError> {
        self.lattice.tables()?;
        let mut probs = ClassProbs([0.0; ObjectClass::COUNT]);
        for (h, m) in self.lattice.hypotheses.iter().zip(&bba.masses) {
            let share = m / f64::from(h.cardinality());
            for class in ObjectClass::ALL {
                if class != ObjectClass::Unknown && h.mask & class_mask(class) != 0 {
                    probs.0[class.index()] += share;
                }
            }
        }
        Ok(probs)
    }

    /// Most probable class. `Unknown` when the universe outweighs every
    /// pignistic class probability.
    pub fn dominant_class(&self, bba: &Bba) -> Result<ObjectClass, FusionError> {
        let probs = self.pignistic(bba)?;
        let best = probs.argmax();
        if bba.mass(self.lattice.universe()?) >= probs.get(best) {
            Ok(ObjectClass::Unknown)
        } else {
            Ok(best)
        }
    }

    /// `(hypothesis name, mass)` pairs for output.
    pub fn describe(&self, bba: &Bba) -> Vec<(String, f64)> {
        self.lattice
            .hypotheses
            .iter()
            .zip(&bba.masses)
            .map(|(h, m)| (h.name.clone(), *m))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn engine() -> BeliefFusionEngine {
        BeliefFusionEngine::new(
            BeliefLatticeContext::initialized_object_classes(),
            BeliefConfig::default(),
        )
        .unwrap()
    }

    fn bba(engine: &BeliefFusionEngine, named: &[(&str, f64)]) -> Bba {
        let lattice = engine.lattice();
        let mut masses = vec![0.0; lattice.len()];
        for (name, m) in named {
            masses[lattice.index_of(name).unwrap()] = *m;
        }
        Bba::from_masses(lattice, masses).unwrap()
    }

    #[test]
    fn uninitialized_lattice_fails_fast() {
        let engine = BeliefFusionEngine::new(
            Arc::new(BeliefLatticeContext::object_classes()),
            BeliefConfig::default(),
        )
        .unwrap();
        let probs = ClassProbs::certain(ObjectClass::Vehicle);
        assert_eq!(
            engine.evidence_from_probs(&probs, 0.9),
            Err(FusionError::UninitializedFusionState)
        );
    }

    #[test]
    fn initialize_is_idempotent_across_threads() {
        let lattice = Arc::new(BeliefLatticeContext::object_classes());
        std::thread::scope(|s| {
            for _ in 0..4 {
                let lattice = &lattice;
                s.spawn(move || lattice.initialize());
            }
        });
        assert!(lattice.is_initialized());
        lattice.initialize();
        assert_eq!(lattice.universe().unwrap(), 6);
    }

    #[test]
    fn lattice_must_be_closed_under_intersection() {
        let res = BeliefLatticeContext::new(vec![
            Hypothesis::new("pedestrian", PED),
            Hypothesis::new("bicycle", BIC),
            Hypothesis::new("vehicle", VEH),
            Hypothesis::new("other", OTH),
            Hypothesis::new("ped_or_veh", PED | VEH),
            Hypothesis::new("veh_or_bic", VEH | BIC),
            Hypothesis::new("unknown", PED | BIC | VEH | OTH),
        ]);
        assert!(res.is_ok(), "intersections are singletons, so closed");

        let res = BeliefLatticeContext::new(vec![
            Hypothesis::new("pedestrian", PED),
            Hypothesis::new("bicycle", BIC),
            Hypothesis::new("vehicle", VEH),
            Hypothesis::new("other", OTH),
            Hypothesis::new("a", PED | BIC | VEH),
            Hypothesis::new("b", BIC | VEH | OTH),
            Hypothesis::new("unknown", PED | BIC | VEH | OTH),
        ]);
        assert!(matches!(res, Err(FusionError::InvalidLattice(_))));
    }

    #[test]
    fn combine_agreeing_evidence_sharpens_belief() {
        let engine = engine();
        let a = bba(&engine, &[("pedestrian", 0.6), ("unknown", 0.4)]);
        let b = bba(&engine, &[("vru", 0.7), ("unknown", 0.3)]);
        let c = engine.combine(&a, &b).unwrap();
        // ped: .6*.7 + .6*.3 = .6, vru: .4*.7 = .28, unknown: .4*.3 = .12
        let ped = engine.lattice().index_of("pedestrian").unwrap();
        let vru = engine.lattice().index_of("vru").unwrap();
        assert_abs_diff_eq!(c.mass(ped), 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(c.mass(vru), 0.28, epsilon = 1e-12);
        assert_abs_diff_eq!(c.masses().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn combine_renormalises_partial_conflict() {
        let engine = engine();
        let a = bba(&engine, &[("pedestrian", 0.8), ("unknown", 0.2)]);
        let b = bba(&engine, &[("vehicle", 0.5), ("unknown", 0.5)]);
        let c = engine.combine(&a, &b).unwrap();
        // K = .4; ped = .4/.6, veh = .1/.6, unknown = .1/.6
        let ped = engine.lattice().index_of("pedestrian").unwrap();
        let veh = engine.lattice().index_of("vehicle").unwrap();
        assert_abs_diff_eq!(c.mass(ped), 0.4 / 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(c.mass(veh), 0.1 / 0.6, epsilon = 1e-12);
    }

    #[test]
    fn total_conflict_is_reported() {
        let engine = engine();
        let a = bba(&engine, &[("pedestrian", 1.0)]);
        let b = bba(&engine, &[("vehicle", 1.0)]);
        match engine.combine(&a, &b) {
            Err(FusionError::FusionConflict { conflict }) => {
                assert_abs_diff_eq!(conflict, 1.0, epsilon = 1e-12)
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn combination_is_order_independent() {
        let engine = engine();
        let a = bba(&engine, &[("pedestrian", 0.5), ("vru", 0.2), ("unknown", 0.3)]);
        let b = bba(&engine, &[("bicycle", 0.3), ("movable", 0.4), ("unknown", 0.3)]);
        let c = bba(&engine, &[("vehicle", 0.1), ("vru", 0.6), ("unknown", 0.3)]);

        let ab = engine.combine(&a, &b).unwrap();
        let ba = engine.combine(&b, &a).unwrap();
        assert!(ab.max_abs_diff(&ba) < 1e-12);

        let ab_c = engine.combine(&ab, &c).unwrap();
        let a_bc = engine.combine(&a, &engine.combine(&b, &c).unwrap()).unwrap();
        let ca_b = engine.combine(&engine.combine(&c, &a).unwrap(), &b).unwrap();
        assert!(ab_c.max_abs_diff(&a_bc) < 1e-12);
        assert!(ab_c.max_abs_diff(&ca_b) < 1e-12);
    }

    #[test]
    fn decay_is_identity_at_zero_and_erodes_monotonically() {
        let engine = engine();
        let a = bba(&engine, &[("vehicle", 0.9), ("unknown", 0.1)]);
        assert_eq!(engine.decay_toward_unknown(&a, 0.0).unwrap(), a);

        let veh = engine.lattice().index_of("vehicle").unwrap();
        let mut prev = a.clone();
        for _ in 0..5 {
            let next = engine.decay_toward_unknown(&prev, 0.1).unwrap();
            assert!(next.mass(veh) < prev.mass(veh));
            assert_abs_diff_eq!(next.masses().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            prev = next;
        }
        assert_eq!(prev.dominant(), veh);
    }

    #[test]
    fn decay_rejects_assignment_of_wrong_length() {
        let engine = engine();
        let short = Bba {
            masses: vec![0.5, 0.5],
        };
        assert!(matches!(
            engine.decay_toward_unknown(&short, 0.1),
            Err(FusionError::InvalidLattice(_))
        ));
        assert!(matches!(
            engine.decay_toward_unknown(&short, 0.0),
            Err(FusionError::InvalidLattice(_))
        ));
    }

    #[test]
    fn evidence_is_discounted_by_reliability() {
        let engine = engine();
        let e = engine
            .evidence_from_probs(&ClassProbs::certain(ObjectClass::Bicycle), 0.7)
            .unwrap();
        let bic = engine.lattice().index_of("bicycle").unwrap();
        let unk = engine.lattice().universe().unwrap();
        assert_abs_diff_eq!(e.mass(bic), 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(e.mass(unk), 0.3, epsilon = 1e-12);
        assert_eq!(engine.dominant_class(&e).unwrap(), ObjectClass::Bicycle);
    }

    #[test]
    fn vacuous_belief_reports_unknown_class() {
        let engine = engine();
        let v = Bba::vacuous(engine.lattice()).unwrap();
        assert_eq!(engine.dominant_class(&v).unwrap(), ObjectClass::Unknown);
        let p = engine.pignistic(&v).unwrap();
        assert_abs_diff_eq!(p.get(ObjectClass::Vehicle), 0.25, epsilon = 1e-12);
    }
}
