//! Sampling functions and run-table generation.
//!
//! A [`FunctionRegistry`] maps sampling-function names to typed
//! implementations.  Templates are validated against the registry before any
//! value is drawn, so an unknown function name or a wrong argument count is
//! a configuration error, never a mid-batch surprise.
//!
//! [`generate_runs`] resolves a [`ParameterTable`] into a rectangular
//! [`RunTable`]: rows are runs, columns are parameters in declaration order.
//! Back-referenced arguments substitute the referenced parameter's realized
//! value from the *same run*.
use crate::config::{Argument, ParameterSpec, ParameterTable};
use crate::errors::BatchError;
use rand::RngCore;
use rand_distr::{Distribution, Exp, LogNormal, Normal, Open01, Uniform};
use std::collections::HashMap;
use std::path::Path;

/// A named sampling operation: draws one value from `args`.
pub trait SampleFn: Send + Sync {
    /// Number of arguments the function requires.
    fn arity(&self) -> usize;
    /// Draw one value.  `args.len()` is guaranteed to equal `arity()`.
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError>;
}

/// `unif(a, b)` — uniform on `[a, b)`.
struct Unif;

impl SampleFn for Unif {
    fn arity(&self) -> usize {
        2
    }
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        if args[1] < args[0] {
            return Err(BatchError::Distribution(format!(
                "unif bounds out of order: [{}, {})",
                args[0], args[1]
            )));
        }
        if args[0] == args[1] {
            return Ok(args[0]);
        }
        Ok(Uniform::new(args[0], args[1]).sample(rng))
    }
}

/// `norm(loc, scale)` — normal with mean `loc` and standard deviation `scale`.
struct Norm;

impl SampleFn for Norm {
    fn arity(&self) -> usize {
        2
    }
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        Ok(Normal::new(args[0], args[1])?.sample(rng))
    }
}

/// `lognorm(mu, sigma)` — log-normal with underlying normal `(mu, sigma)`.
struct LogNorm;

impl SampleFn for LogNorm {
    fn arity(&self) -> usize {
        2
    }
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        Ok(LogNormal::new(args[0], args[1])?.sample(rng))
    }
}

/// `exp(rate)` — exponential with lambda `rate`.
struct Exponential;

impl SampleFn for Exponential {
    fn arity(&self) -> usize {
        1
    }
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        Ok(Exp::new(args[0])?.sample(rng))
    }
}

/// `pow10_norm(loc, scale)` — `10^N(loc, scale)`, the daily explosion-rate
/// model for impulsive phases.
struct Pow10Norm;

impl SampleFn for Pow10Norm {
    fn arity(&self) -> usize {
        2
    }
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        Ok(10f64.powf(Normal::new(args[0], args[1])?.sample(rng)))
    }
}

/// `trunc_norm(loc, scale, lo, hi)` — normal resampled into `[lo, hi]`.
struct TruncNorm;

/// Resample attempts before a truncation window counts as unreachable.
const TRUNC_NORM_MAX_DRAWS: usize = 10_000;

impl SampleFn for TruncNorm {
    fn arity(&self) -> usize {
        4
    }
    fn sample(&self, args: &[f64], rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        let (lo, hi) = (args[2], args[3]);
        if hi <= lo {
            return Err(BatchError::Distribution(format!(
                "trunc_norm bounds out of order: [{}, {}]",
                lo, hi
            )));
        }
        let dist = Normal::new(args[0], args[1])?;
        for _ in 0..TRUNC_NORM_MAX_DRAWS {
            let draw = dist.sample(rng);
            if draw >= lo && draw <= hi {
                return Ok(draw);
            }
        }
        Err(BatchError::Distribution(format!(
            "trunc_norm window [{}, {}] rejected {} draws from N({}, {})",
            lo, hi, TRUNC_NORM_MAX_DRAWS, args[0], args[1]
        )))
    }
}

/// Phi threshold above which particles take the lithic density.
const LITHIC_DIAMETER_THRESHOLD: f64 = 7.0;
/// Phi threshold below which particles take the pumice density.
const PUMICE_DIAMETER_THRESHOLD: f64 = -1.0;

/// `mastin_mass(height, lithic_density, pumice_density, max_phi, min_phi,
/// median_phi, std_phi, steps)` — deterministic total erupted mass from the
/// plume height after Mastin et al. (2009), weighting the grain-size pdf
/// used by Tephra2.  `height` is in meters and is normally supplied as a
/// `|PLUME_HEIGHT|` back-reference.
struct MastinMass;

impl SampleFn for MastinMass {
    fn arity(&self) -> usize {
        8
    }
    fn sample(&self, args: &[f64], _rng: &mut dyn RngCore) -> Result<f64, BatchError> {
        let (height, lithic, pumice) = (args[0], args[1], args[2]);
        let (max_phi, min_phi, median_phi, std_phi) = (args[3], args[4], args[5], args[6]);
        let steps = args[7] as usize;
        if steps == 0 || std_phi <= 0.0 {
            return Err(BatchError::Distribution(format!(
                "mastin_mass needs steps > 0 and std_phi > 0, got {} and {}",
                args[7], std_phi
            )));
        }
        // Erupted volume in km^3 from column height in km.
        let volume = 10f64.powf((height / 1000.0 - 25.9) / 6.64);
        let step_width = (min_phi - max_phi) / steps as f64;
        let mut phi = max_phi;
        let mut total_mass = 0.0;
        for _ in 0..steps {
            let density = if phi >= LITHIC_DIAMETER_THRESHOLD {
                lithic
            } else if phi <= PUMICE_DIAMETER_THRESHOLD {
                pumice
            } else {
                lithic
                    - (lithic - pumice) * (phi - LITHIC_DIAMETER_THRESHOLD)
                        / (PUMICE_DIAMETER_THRESHOLD - LITHIC_DIAMETER_THRESHOLD)
            };
            let prob = pdf_grainsize(median_phi, std_phi, phi, step_width);
            // Volume converts from km^3 to m^3.
            total_mass += volume * 1e9 * prob * density;
            phi += step_width;
        }
        Ok(total_mass)
    }
}

/// Grain-size probability mass over one phi slice, as Tephra2 computes it.
fn pdf_grainsize(mean: f64, sigma: f64, phi: f64, step_width: f64) -> f64 {
    let temp1 = 1.0 / (2.506628 * sigma);
    let temp2 = (-(phi - mean).powi(2) / (2.0 * sigma * sigma)).exp();
    temp1 * temp2 * step_width
}

/// Draw from a log-logistic (fisk) distribution with shape `c`, location
/// `loc` and scale `scale`, by inverse CDF.
pub(crate) fn fisk(c: f64, loc: f64, scale: f64, rng: &mut dyn RngCore) -> f64 {
    let u: f64 = Open01.sample(rng);
    loc + scale * (u / (1.0 - u)).powf(1.0 / c)
}

/// Explicit name-to-function table for sampling operations.
///
/// Well-known distributions are installed by [`with_defaults`]; user
/// extensions register under their own names.  Lookup failures are rejected
/// when a table is validated, before any value is drawn.
///
/// [`with_defaults`]: FunctionRegistry::with_defaults
pub struct FunctionRegistry {
    table: HashMap<String, Box<dyn SampleFn>>,
}

impl FunctionRegistry {
    /// An empty registry, for callers that want full control.
    pub fn new() -> Self {
        FunctionRegistry {
            table: HashMap::new(),
        }
    }

    /// A registry holding the well-known distributions.
    pub fn with_defaults() -> Self {
        let mut reg = FunctionRegistry::new();
        reg.register("unif", Box::new(Unif));
        reg.register("norm", Box::new(Norm));
        reg.register("lognorm", Box::new(LogNorm));
        reg.register("exp", Box::new(Exponential));
        reg.register("pow10_norm", Box::new(Pow10Norm));
        reg.register("trunc_norm", Box::new(TruncNorm));
        reg.register("mastin_mass", Box::new(MastinMass));
        reg
    }

    /// Register (or replace) a sampling function under `name`.
    pub fn register(&mut self, name: &str, f: Box<dyn SampleFn>) {
        self.table.insert(name.to_string(), f);
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&dyn SampleFn> {
        self.table.get(name).map(|f| f.as_ref())
    }

    /// Check every sampled spec in `table` against the registry: the
    /// function must exist and the argument count must match its arity.
    pub fn validate(&self, table: &ParameterTable) -> Result<(), BatchError> {
        for (name, spec) in table.iter() {
            if let ParameterSpec::Sampled { function, args } = spec {
                let f = self.get(function).ok_or_else(|| BatchError::UnknownFunction {
                    function: function.clone(),
                    parameter: name.clone(),
                })?;
                if args.len() != f.arity() {
                    return Err(BatchError::BadArity {
                        function: function.clone(),
                        expected: f.arity(),
                        got: args.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        FunctionRegistry::with_defaults()
    }
}

/// One fully resolved parameter assignment for one simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    columns: Vec<String>,
    values: Vec<f64>,
}

impl RunRecord {
    /// Parameter names in run-table column order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Realized value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| self.values[i])
    }

    /// Overwrite the value of `name`.  Fails when the parameter is absent,
    /// since a record's shape is fixed by its template.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), BatchError> {
        match self.columns.iter().position(|c| c == name) {
            Some(i) => {
                self.values[i] = value;
                Ok(())
            }
            None => Err(BatchError::Validation(format!(
                "Parameter {} not present in run record.",
                name
            ))),
        }
    }

    /// Iterate `(name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.columns
            .iter()
            .map(|c| c.as_str())
            .zip(self.values.iter().copied())
    }
}

/// A rectangular table of generated runs: rows are runs, columns follow the
/// template's declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTable {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl RunTable {
    /// Column names in declaration order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of runs.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table holds no runs.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at `(run, name)`, if present.
    pub fn get(&self, run: usize, name: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == name)?;
        self.rows.get(run).map(|r| r[col])
    }

    /// The `run`-th row as an owned [`RunRecord`].
    pub fn record(&self, run: usize) -> Option<RunRecord> {
        self.rows.get(run).map(|r| RunRecord {
            columns: self.columns.clone(),
            values: r.clone(),
        })
    }

    /// Export the table as csv with a leading `run` index column, the shape
    /// the downstream plotting utilities expect.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), BatchError> {
        let mut wtr = csv::Writer::from_path(path)?;
        let mut header = vec!["run".to_string()];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header)?;
        for (i, row) in self.rows.iter().enumerate() {
            let mut rec = vec![i.to_string()];
            rec.extend(row.iter().map(|v| v.to_string()));
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Resolve a parameter table into `runs` concrete run records.
///
/// Fixed parameters replicate; sampled parameters draw `runs` independent
/// values; back-referenced arguments substitute the referenced column's
/// value for the same run.  Evaluation walks the table in declaration order,
/// which the parser guarantees is a valid dependency order.
pub fn generate_runs(
    table: &ParameterTable,
    runs: usize,
    registry: &FunctionRegistry,
    rng: &mut dyn RngCore,
) -> Result<RunTable, BatchError> {
    registry.validate(table)?;
    let mut columns: Vec<String> = Vec::with_capacity(table.len());
    let mut generated: Vec<Vec<f64>> = Vec::with_capacity(table.len());
    for (name, spec) in table.iter() {
        let values = match spec {
            ParameterSpec::Fixed(value) => vec![*value; runs],
            ParameterSpec::Sampled { function, args } => {
                // Registry validation above makes this lookup infallible.
                let f = registry.get(function).ok_or_else(|| {
                    BatchError::UnknownFunction {
                        function: function.clone(),
                        parameter: name.clone(),
                    }
                })?;
                let mut values = Vec::with_capacity(runs);
                let mut realized = vec![0.0; args.len()];
                for run in 0..runs {
                    for (slot, arg) in args.iter().enumerate() {
                        realized[slot] = match arg {
                            Argument::Literal(v) => *v,
                            Argument::Reference(dep) => {
                                let col = columns
                                    .iter()
                                    .position(|c| c == dep)
                                    .ok_or_else(|| BatchError::BadReference {
                                        parameter: name.clone(),
                                        reference: dep.clone(),
                                    })?;
                                generated[col][run]
                            }
                        };
                    }
                    values.push(f.sample(&realized, rng)?);
                }
                values
            }
        };
        columns.push(name.clone());
        generated.push(values);
    }
    let rows = (0..runs)
        .map(|run| generated.iter().map(|col| col[run]).collect())
        .collect();
    Ok(RunTable { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::with_defaults()
    }

    #[test]
    fn fixed_parameters_replicate() {
        let table =
            ParameterTable::parse("PLUME_HEIGHT 15000.0\nALPHA 2.4\n").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let runs = generate_runs(&table, 12, &registry(), &mut rng).unwrap();
        assert_eq!(runs.len(), 12);
        for i in 0..12 {
            assert_eq!(runs.get(i, "PLUME_HEIGHT"), Some(15000.0));
            assert_eq!(runs.get(i, "ALPHA"), Some(2.4));
        }
    }

    #[test]
    fn sampled_values_stay_in_support() {
        let table =
            ParameterTable::parse("PLUME_HEIGHT {unif} [10000, 25000]\n").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let runs = generate_runs(&table, 100, &registry(), &mut rng).unwrap();
        for i in 0..100 {
            let h = runs.get(i, "PLUME_HEIGHT").unwrap();
            assert!((10000.0..25000.0).contains(&h));
        }
    }

    #[test]
    fn norm_draws_track_the_location() {
        let reg = registry();
        let f = reg.get("norm").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let v = f.sample(&[50.0, 0.5], &mut rng).unwrap();
            // Ten sigmas either side of the mean.
            assert!((45.0..55.0).contains(&v));
        }
    }

    #[test]
    fn lognorm_draws_are_positive() {
        let reg = registry();
        let f = reg.get("lognorm").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            assert!(f.sample(&[0.0, 1.0], &mut rng).unwrap() > 0.0);
        }
    }

    #[test]
    fn exp_draws_are_positive() {
        let reg = registry();
        let f = reg.get("exp").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            assert!(f.sample(&[1.5], &mut rng).unwrap() > 0.0);
        }
    }

    #[test]
    fn pow10_norm_draws_are_positive() {
        let reg = registry();
        let f = reg.get("pow10_norm").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            assert!(f.sample(&[-0.4772, 1.92], &mut rng).unwrap() > 0.0);
        }
    }

    #[test]
    fn trunc_norm_draws_respect_bounds() {
        let reg = registry();
        let f = reg.get("trunc_norm").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let v = f.sample(&[0.0, 2.0, -1.0, 1.0], &mut rng).unwrap();
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn unreachable_trunc_norm_window_errors_out() {
        let reg = registry();
        let f = reg.get("trunc_norm").unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        // A window fifty sigmas out will never accept a draw.
        let err = f.sample(&[0.0, 1.0, 50.0, 51.0], &mut rng).unwrap_err();
        assert!(matches!(err, BatchError::Distribution(_)));
    }

    #[test]
    fn seeded_generation_reproduces() {
        let table = ParameterTable::parse(
            "PLUME_HEIGHT {unif} [10000, 25000]\nALPHA {norm} [2.0, 0.5]\n",
        )
        .unwrap();
        let mut a = StdRng::seed_from_u64(99);
        let mut b = StdRng::seed_from_u64(99);
        let ra = generate_runs(&table, 20, &registry(), &mut a).unwrap();
        let rb = generate_runs(&table, 20, &registry(), &mut b).unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn references_resolve_within_run() {
        let table = ParameterTable::parse(
            "PLUME_HEIGHT {unif} [10000, 25000]\n\
             ERUPTION_MASS {mastin_mass} [|PLUME_HEIGHT|, 2700, 1000, -5, 5, 0, 1.5, 10]\n",
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let reg = registry();
        let runs = generate_runs(&table, 25, &reg, &mut rng).unwrap();
        let mastin = reg.get("mastin_mass").unwrap();
        let mut dummy = StdRng::seed_from_u64(0);
        for i in 0..25 {
            let h = runs.get(i, "PLUME_HEIGHT").unwrap();
            let expected = mastin
                .sample(&[h, 2700.0, 1000.0, -5.0, 5.0, 0.0, 1.5, 10.0], &mut dummy)
                .unwrap();
            let got = runs.get(i, "ERUPTION_MASS").unwrap();
            assert!((got - expected).abs() < 1e-9 * expected.abs().max(1.0));
        }
    }

    #[test]
    fn unknown_function_is_fatal() {
        let table = ParameterTable::parse("ALPHA {bogus} [1, 2]\n").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let err = generate_runs(&table, 1, &registry(), &mut rng).unwrap_err();
        match err {
            BatchError::UnknownFunction { function, parameter } => {
                assert_eq!(function, "bogus");
                assert_eq!(parameter, "ALPHA");
            }
            other => panic!("expected unknown function, got {:?}", other),
        }
    }

    #[test]
    fn wrong_arity_is_fatal() {
        let table = ParameterTable::parse("ALPHA {unif} [1, 2, 3]\n").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            generate_runs(&table, 1, &registry(), &mut rng),
            Err(BatchError::BadArity { .. })
        ));
    }

    #[test]
    fn extension_registry_resolves() {
        struct AlwaysSeven;
        impl SampleFn for AlwaysSeven {
            fn arity(&self) -> usize {
                0
            }
            fn sample(&self, _: &[f64], _: &mut dyn RngCore) -> Result<f64, BatchError> {
                Ok(7.0)
            }
        }
        let mut reg = registry();
        reg.register("seven", Box::new(AlwaysSeven));
        let table = ParameterTable::parse("LUCKY {seven} []\n").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let runs = generate_runs(&table, 3, &reg, &mut rng).unwrap();
        for i in 0..3 {
            assert_eq!(runs.get(i, "LUCKY"), Some(7.0));
        }
    }

    #[test]
    fn run_records_round_trip() {
        let table = ParameterTable::parse("ALPHA 1.5\nBETA 2.5\n").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let runs = generate_runs(&table, 2, &registry(), &mut rng).unwrap();
        let mut rec = runs.record(0).unwrap();
        assert_eq!(rec.get("BETA"), Some(2.5));
        rec.set("BETA", 5.0).unwrap();
        assert_eq!(rec.get("BETA"), Some(5.0));
        assert!(rec.set("GAMMA", 1.0).is_err());
    }

    #[test]
    fn run_table_exports_csv() {
        let table = ParameterTable::parse("ALPHA 1.5\nBETA 2.5\n").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let runs = generate_runs(&table, 2, &registry(), &mut rng).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.csv");
        runs.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "run,ALPHA,BETA");
        assert_eq!(lines[1], "0,1.5,2.5");
        assert_eq!(lines[2], "1,1.5,2.5");
    }

    #[test]
    fn mastin_mass_grows_with_height() {
        let reg = registry();
        let f = reg.get("mastin_mass").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let low = f
            .sample(&[10000.0, 2700.0, 1000.0, -5.0, 5.0, 0.0, 1.5, 10.0], &mut rng)
            .unwrap();
        let high = f
            .sample(&[25000.0, 2700.0, 1000.0, -5.0, 5.0, 0.0, 1.5, 10.0], &mut rng)
            .unwrap();
        assert!(high > low);
        assert!(low > 0.0);
    }
}
