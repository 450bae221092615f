//! Scenario runner.
//!
//! Drives a gravity code and a hydro code through their storages the way a
//! simulation script would, checking the storage guarantees as it goes and
//! collecting a [`ScenarioReport`].

use glam::DVec3;
use serde::Serialize;
use tracing::info;

use incode_storage::{
    DimSelection, EntityKey, GridSelection, InCodeGridStorage, InCodeParticleStorage, KeyAllocator, KeyLookup,
    Quantity,
};

use crate::config::DemoConfig;
use crate::error::{DemoError, DemoResult};
use crate::gravity::{GravityCode, GravityParameters};
use crate::hydro::HydroCode;

/// What a scenario run observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub particles: usize,
    pub removed: usize,
    pub reused_indices: usize,
    pub binaries: usize,
    pub neighbour_links: usize,
    pub in_sphere: usize,
    pub escapers: usize,
    pub adopted: usize,
    pub disowned: usize,
    pub energy_error: f64,
    pub particle_snapshot_bytes: usize,
    pub grid_shape: Vec<usize>,
    pub grid_mass: f64,
    pub grid_snapshot_bytes: usize,
}

fn check(condition: bool, message: impl FnOnce() -> String) -> DemoResult<()> {
    if condition { Ok(()) } else { Err(DemoError::Check(message())) }
}

/// Positions on a Fibonacci sphere of unit radius, inward-spiralling.
fn initial_positions(n: usize) -> Vec<DVec3> {
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    (0..n)
        .map(|i| {
            let t = (i as f64 + 0.5) / n as f64;
            let z = 1.0 - 2.0 * t;
            let r = (1.0 - z * z).sqrt();
            let phi = golden * i as f64;
            DVec3::new(r * phi.cos(), r * phi.sin(), z) * (0.25 + 0.75 * t)
        })
        .collect()
}

fn particle_values(masses: &[f64], positions: &[DVec3]) -> Vec<Quantity> {
    let column = |f: fn(DVec3) -> f64| Quantity::floats(positions.iter().copied().map(f).collect());
    let zeros = Quantity::floats(vec![0.0; positions.len()]);
    vec![
        Quantity::floats(masses.to_vec()),
        column(|p| p.x),
        column(|p| p.y),
        column(|p| p.z),
        zeros.clone(),
        zeros.clone(),
        zeros,
    ]
}

const PARTICLE_ATTRIBUTES: [&str; 7] = ["mass", "x", "y", "z", "vx", "vy", "vz"];

/// Runs the demo scenario for one configuration.
#[derive(Debug)]
pub struct Scenario {
    config: DemoConfig,
    gravity: GravityCode,
    particles: InCodeParticleStorage,
    hydro: HydroCode,
    grid: InCodeGridStorage,
    report: ScenarioReport,
}

impl Scenario {
    #[must_use]
    pub fn new(config: DemoConfig) -> Self {
        let gravity = GravityCode::new(GravityParameters {
            softening: config.softening,
            escape_radius: config.escape_radius,
            neighbour_radius: config.neighbour_radius,
        });
        let particles = gravity.particle_storage(KeyAllocator::new());
        let hydro = HydroCode::new(config.grid_size);
        let grid = hydro.grid_storage();
        Self {
            config,
            gravity,
            particles,
            hydro,
            grid,
            report: ScenarioReport::default(),
        }
    }

    /// Run every step and return the report.
    ///
    /// # Errors
    ///
    /// Returns the first storage error or failed check.
    pub fn run(mut self) -> DemoResult<ScenarioReport> {
        info!(particles = self.config.particles, grid_size = self.config.grid_size, "scenario starting");
        let keys = self.create_particles()?;
        let keys = self.churn(keys)?;
        self.link_binaries(&keys)?;
        self.select()?;
        self.evolve()?;
        self.code_side_changes()?;
        self.snapshot_particles()?;
        self.fill_grid()?;
        info!("scenario finished");
        Ok(self.report)
    }

    fn create_particles(&mut self) -> DemoResult<Vec<EntityKey>> {
        let n = self.config.particles;
        let masses = vec![1.0 / n.max(1) as f64; n];
        let keys = self
            .particles
            .add_new(n, &PARTICLE_ATTRIBUTES, &particle_values(&masses, &initial_positions(n)))?;
        check(self.particles.count()? == n, || "code count differs from particles added".into())?;
        self.report.particles = n;
        info!(count = n, "particles created");
        Ok(keys)
    }

    fn churn(&mut self, mut keys: Vec<EntityKey>) -> DemoResult<Vec<EntityKey>> {
        let churn = self.config.churn.min(keys.len());
        if churn == 0 {
            return Ok(keys);
        }
        let removed: Vec<EntityKey> = keys.drain(..churn).collect();
        let freed = self.particles.indices_of(&removed)?;
        let masses: Vec<f64> = self
            .particles
            .get_values(&removed, &["mass"])?
            .first()
            .and_then(Quantity::as_floats)
            .map(<[f64]>::to_vec)
            .unwrap_or_default();
        self.particles.remove_particles(&removed)?;

        let positions = initial_positions(churn);
        let added = self.particles.add_new(churn, &PARTICLE_ATTRIBUTES, &particle_values(&masses, &positions))?;
        let reused = self
            .particles
            .indices_of(&added)?
            .iter()
            .filter(|&index| freed.contains(index))
            .count();

        for &key in &removed {
            check(!self.particles.has_key(key), || format!("{key} survived removal"))?;
        }
        for &key in self.particles.all_keys() {
            let index = self.particles.index_of(key)?;
            check(self.particles.key_of(index) == key, || format!("{key} does not round trip"))?;
        }

        keys.extend(added);
        self.report.removed = churn;
        self.report.reused_indices = reused;
        info!(removed = churn, reused, "particles churned");
        Ok(keys)
    }

    fn link_binaries(&mut self, keys: &[EntityKey]) -> DemoResult<()> {
        let mut parents = Vec::new();
        let mut first = Vec::new();
        let mut second = Vec::new();
        for triple in keys.chunks_exact(3) {
            let indices = self.particles.indices_of(&triple[1..])?;
            parents.push(triple[0]);
            first.push(indices[0]);
            second.push(indices[1]);
        }
        self.particles.set_values(
            &parents,
            &["child1", "child2"],
            &[Quantity::indices(first), Quantity::indices(second)],
        )?;

        let children = self.gravity.children().apply_on_all(&self.particles)?;
        let binaries = children.iter().filter(|c| c.len() == 2).count();
        check(binaries == parents.len(), || {
            format!("{binaries} binaries found, {} linked", parents.len())
        })?;
        self.report.binaries = binaries;
        info!(binaries, "binaries linked");
        Ok(())
    }

    fn select(&mut self) -> DemoResult<()> {
        let neighbours = self.gravity.neighbours().apply_on_all(&self.particles)?;
        self.report.neighbour_links = neighbours.iter().map(Vec::len).sum();

        let sphere = [0.0, 0.0, 0.0, self.config.selection_radius].map(|v| Quantity::floats(vec![v]));
        self.report.in_sphere = self.gravity.in_sphere().apply_on_all(&self.particles, &sphere)?.len();

        let potential = self.gravity.potential().apply_on_all(&self.particles, &[])?;
        let deepest = potential
            .first()
            .and_then(Quantity::as_floats)
            .map_or(0.0, |p| p.iter().copied().fold(0.0, f64::min));
        info!(
            neighbour_links = self.report.neighbour_links,
            in_sphere = self.report.in_sphere,
            deepest_potential = deepest,
            "selections done"
        );
        Ok(())
    }

    fn evolve(&mut self) -> DemoResult<()> {
        let before = self.gravity.total_energy()?;
        self.gravity.evolve(self.config.time_step, self.config.steps);
        let after = self.gravity.total_energy()?;
        self.report.energy_error = if before == 0.0 { 0.0 } else { ((after - before) / before).abs() };

        self.report.escapers = self.gravity.escapers().apply(&self.particles, &[])?.len();
        info!(
            time = self.gravity.time(),
            energy_error = self.report.energy_error,
            escapers = self.report.escapers,
            "evolved"
        );
        Ok(())
    }

    fn code_side_changes(&mut self) -> DemoResult<()> {
        if let Some(&first) = self.particles.all_keys().first() {
            let index = self.particles.index_of(first)?;
            let half = self.gravity.split(index, DVec3::new(0.01, 0.0, 0.0))?;
            self.report.adopted = self.particles.adopt_indices(&[half])?.len();
        }

        let escaped = self.gravity.remove_escapers();
        self.report.disowned = self.particles.disown_indices(&escaped).len();
        check(self.particles.count()? == self.particles.key_count(), || {
            "storage and code disagree after code-side changes".into()
        })?;
        info!(adopted = self.report.adopted, disowned = self.report.disowned, "code-side changes tracked");
        Ok(())
    }

    fn snapshot_particles(&mut self) -> DemoResult<()> {
        let snapshot = self.particles.snapshot()?;
        self.report.particle_snapshot_bytes = snapshot.to_bytes()?.len();
        info!(
            particles = snapshot.len(),
            bytes = self.report.particle_snapshot_bytes,
            "particle snapshot taken"
        );
        Ok(())
    }

    fn fill_grid(&mut self) -> DemoResult<()> {
        let shape = self.grid.shape()?;
        let positions = self.grid.get_values(&GridSelection::All, &["x", "y", "z"])?;
        let coordinates: Vec<&[f64]> = positions.iter().filter_map(Quantity::as_floats).collect();
        let density: Vec<f64> = (0..self.grid.len()?)
            .map(|cell| {
                let r2: f64 = coordinates.iter().map(|c| (c[cell] - 0.5).powi(2)).sum();
                1.0 + (-r2 / 0.02).exp()
            })
            .collect();
        self.grid.set_values(&GridSelection::All, &["rho"], &[Quantity::floats(density)])?;

        let middle = i64::try_from(shape.first().copied().unwrap_or(0) / 2).unwrap_or(0);
        let plane = GridSelection::Slices(vec![DimSelection::Index(middle)]);
        let values = self.grid.get_values(&plane, &["rho"])?;
        check(values[0].shape() == &shape[1..], || "middle plane has the wrong shape".into())?;

        let snapshot = self.grid.snapshot()?;
        self.report.grid_snapshot_bytes = snapshot.to_bytes()?.len();
        self.report.grid_mass = self.hydro.total_mass();
        self.report.grid_shape = shape;
        info!(
            shape = ?self.report.grid_shape,
            mass = self.report.grid_mass,
            bytes = self.report.grid_snapshot_bytes,
            "grid filled"
        );
        Ok(())
    }
}
