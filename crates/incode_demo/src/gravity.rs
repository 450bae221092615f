//! A small in-process gravity code.
//!
//! Bodies live in the code, addressed by integer indices that are handed out
//! again after deletion. The code exposes the usual array functions
//! (`new_particle`, `get_position`, `set_mass`, ...) plus queries, and
//! [`GravityCode::particle_storage`] wires them into an
//! [`InCodeParticleStorage`].
//!
//! Units are N-body units (G = 1).

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use glam::DVec3;
use tracing::debug;

use incode_storage::{
    CodeError, CodeIndex, CodeResult, ComputeMethod, CountMethod, DeleteMethod, GetAttributesMethod,
    InCodeParticleStorage, KeyAllocator, MethodSpecification, NewParticleMethod, Quantity, QueryMethod,
    SetAttributesMethod, SpecificSelectMethod, SpecificSelectSubsetMethod, SubsetSelectMethod,
};

/// Name of the index parameter in the code's functions.
pub const INDEX_NAME: &str = "index_of_the_body";

/// Index value meaning "no body" in link attributes.
pub const NO_BODY: CodeIndex = -1;

pub const ERROR_UNKNOWN_BODY: i32 = -1;
pub const ERROR_BAD_ARGUMENT: i32 = -2;
pub const ERROR_UNKNOWN_SELECTION: i32 = -3;

const CREATE_INPUTS: [&str; 8] = ["mass", "x", "y", "z", "vx", "vy", "vz", "radius"];

/// Physical parameters of the code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GravityParameters {
    pub softening: f64,
    pub escape_radius: f64,
    pub neighbour_radius: f64,
}

impl Default for GravityParameters {
    fn default() -> Self {
        Self {
            softening: 0.01,
            escape_radius: 2.0,
            neighbour_radius: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Body {
    mass: f64,
    position: DVec3,
    velocity: DVec3,
    radius: f64,
    children: [CodeIndex; 2],
}

#[derive(Debug, Default)]
struct GravityState {
    parameters: GravityParameters,
    bodies: BTreeMap<CodeIndex, Body>,
    free: BTreeSet<CodeIndex>,
    next_index: CodeIndex,
    /// Latest sphere selection and its query id; older ids are stale.
    selection: Option<(i64, Vec<CodeIndex>)>,
    queries: i64,
    time: f64,
}

impl GravityState {
    fn body(&self, index: CodeIndex) -> CodeResult<&Body> {
        self.bodies
            .get(&index)
            .ok_or_else(|| CodeError::new(ERROR_UNKNOWN_BODY, format!("no body at index {index}")))
    }

    fn body_mut(&mut self, index: CodeIndex) -> CodeResult<&mut Body> {
        self.bodies
            .get_mut(&index)
            .ok_or_else(|| CodeError::new(ERROR_UNKNOWN_BODY, format!("no body at index {index}")))
    }

    fn allocate(&mut self) -> CodeIndex {
        if let Some(index) = self.free.pop_first() {
            return index;
        }
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn release(&mut self, index: CodeIndex) {
        self.bodies.remove(&index);
        self.free.insert(index);
        for body in self.bodies.values_mut() {
            for child in &mut body.children {
                if *child == index {
                    *child = NO_BODY;
                }
            }
        }
    }

    fn read<const N: usize>(
        &self,
        indices: &[CodeIndex],
        field: impl Fn(&Body) -> [f64; N],
    ) -> CodeResult<Vec<Quantity>> {
        let mut columns: [Vec<f64>; N] = std::array::from_fn(|_| Vec::with_capacity(indices.len()));
        for &index in indices {
            for (column, value) in columns.iter_mut().zip(field(self.body(index)?)) {
                column.push(value);
            }
        }
        Ok(columns.into_iter().map(Quantity::floats).collect())
    }

    fn write<const N: usize>(
        &mut self,
        indices: &[CodeIndex],
        values: &[Quantity],
        field: impl Fn(&mut Body, [f64; N]),
    ) -> CodeResult<()> {
        let columns = (0..N)
            .map(|position| rows(floats(values, position)?, indices.len()))
            .collect::<CodeResult<Vec<_>>>()?;
        if let Some(index) = indices.iter().find(|&&i| !self.bodies.contains_key(&i)) {
            return Err(CodeError::new(ERROR_UNKNOWN_BODY, format!("no body at index {index}")));
        }
        for (row, index) in indices.iter().enumerate() {
            let body = self.body_mut(*index)?;
            field(body, std::array::from_fn(|position| columns[position][row]));
        }
        Ok(())
    }

    fn accelerations(&self) -> BTreeMap<CodeIndex, DVec3> {
        let eps2 = self.parameters.softening * self.parameters.softening;
        self.bodies
            .iter()
            .map(|(&index, body)| {
                let acceleration: DVec3 = self
                    .bodies
                    .iter()
                    .filter(|&(&other, _)| other != index)
                    .map(|(_, other)| {
                        let separation = other.position - body.position;
                        let r2 = separation.length_squared() + eps2;
                        separation * (other.mass / (r2 * r2.sqrt()))
                    })
                    .sum();
                (index, acceleration)
            })
            .collect()
    }

    fn potential(&self, index: CodeIndex, softening: f64) -> CodeResult<f64> {
        let body = self.body(index)?;
        let eps2 = softening * softening;
        Ok(self
            .bodies
            .iter()
            .filter(|&(&other, _)| other != index)
            .map(|(_, other)| -other.mass / (body.position.distance_squared(other.position) + eps2).sqrt())
            .sum())
    }

    fn neighbours(&self, index: CodeIndex) -> CodeResult<Vec<CodeIndex>> {
        let body = self.body(index)?;
        let radius = self.parameters.neighbour_radius;
        let mut found: Vec<(f64, CodeIndex)> = self
            .bodies
            .iter()
            .filter(|&(&other, _)| other != index)
            .map(|(&other, b)| (body.position.distance(b.position), other))
            .filter(|&(distance, _)| distance < radius)
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(found.into_iter().map(|(_, other)| other).collect())
    }

    fn selection(&self, id: i64) -> CodeResult<&Vec<CodeIndex>> {
        match &self.selection {
            Some((current, selected)) if *current == id => Ok(selected),
            _ => Err(CodeError::new(ERROR_UNKNOWN_SELECTION, format!("no selection {id}"))),
        }
    }
}

fn floats(values: &[Quantity], position: usize) -> CodeResult<&[f64]> {
    values
        .get(position)
        .and_then(Quantity::as_floats)
        .ok_or_else(|| CodeError::new(ERROR_BAD_ARGUMENT, format!("argument {position} must be a float array")))
}

fn rows<T>(column: &[T], count: usize) -> CodeResult<&[T]> {
    if column.len() < count {
        return Err(CodeError::new(
            ERROR_BAD_ARGUMENT,
            format!("expected {count} values, got {}", column.len()),
        ));
    }
    Ok(column)
}

fn ints(values: &[Quantity], position: usize) -> CodeResult<&[i64]> {
    values
        .get(position)
        .and_then(Quantity::as_ints)
        .ok_or_else(|| CodeError::new(ERROR_BAD_ARGUMENT, format!("argument {position} must be an integer array")))
}

fn scalar(values: &[Quantity], position: usize) -> CodeResult<f64> {
    floats(values, position)?
        .first()
        .copied()
        .ok_or_else(|| CodeError::new(ERROR_BAD_ARGUMENT, format!("argument {position} is empty")))
}

/// An in-process gravity code. Clones share the same bodies.
#[derive(Debug, Clone, Default)]
pub struct GravityCode {
    state: Rc<RefCell<GravityState>>,
}

impl GravityCode {
    #[must_use]
    pub fn new(parameters: GravityParameters) -> Self {
        let state = GravityState {
            parameters,
            ..GravityState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Model time reached so far.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.state.borrow().time
    }

    /// Total energy (kinetic plus potential) of all bodies.
    ///
    /// # Errors
    ///
    /// Never fails for a consistent code; errors are propagated from body lookups.
    pub fn total_energy(&self) -> CodeResult<f64> {
        let state = self.state.borrow();
        let softening = state.parameters.softening;
        let mut kinetic = 0.0;
        let mut potential = 0.0;
        for (&index, body) in &state.bodies {
            kinetic += 0.5 * body.mass * body.velocity.length_squared();
            potential += 0.5 * body.mass * state.potential(index, softening)?;
        }
        Ok(kinetic + potential)
    }

    /// Advance all bodies by `steps` leapfrog steps of size `dt`.
    pub fn evolve(&self, dt: f64, steps: usize) {
        let mut state = self.state.borrow_mut();
        for _ in 0..steps {
            let accelerations = state.accelerations();
            for (index, body) in &mut state.bodies {
                body.velocity += accelerations[index] * (0.5 * dt);
                body.position += body.velocity * dt;
            }
            let accelerations = state.accelerations();
            for (index, body) in &mut state.bodies {
                body.velocity += accelerations[index] * (0.5 * dt);
            }
            state.time += dt;
        }
        debug!(time = state.time, bodies = state.bodies.len(), "evolved");
    }

    /// Delete every body beyond the escape radius, the way codes drop
    /// escapers on their own. Returns the freed indices.
    pub fn remove_escapers(&self) -> Vec<CodeIndex> {
        let mut state = self.state.borrow_mut();
        let radius = state.parameters.escape_radius;
        let escaped: Vec<CodeIndex> = state
            .bodies
            .iter()
            .filter(|(_, body)| body.position.length() > radius)
            .map(|(&index, _)| index)
            .collect();
        for &index in &escaped {
            state.release(index);
        }
        escaped
    }

    /// Split a body into two halves, the way codes create bodies on their
    /// own. Returns the index of the new half.
    ///
    /// # Errors
    ///
    /// Returns [`ERROR_UNKNOWN_BODY`] if there is no body at `index`.
    pub fn split(&self, index: CodeIndex, offset: DVec3) -> CodeResult<CodeIndex> {
        let mut state = self.state.borrow_mut();
        let body = state.body_mut(index)?;
        body.mass *= 0.5;
        body.position -= offset * 0.5;
        let mut half = *body;
        half.position += offset;
        half.children = [NO_BODY; 2];
        let new_index = state.allocate();
        state.bodies.insert(new_index, half);
        Ok(new_index)
    }

    fn new_particle(&self) -> NewParticleMethod {
        let state = Rc::clone(&self.state);
        NewParticleMethod::new(
            MethodSpecification::new("new_particle")
                .inputs(CREATE_INPUTS)
                .optional(["radius"]),
            move |count, values| {
                let columns = (0..7)
                    .map(|p| rows(floats(values, p)?, count))
                    .collect::<CodeResult<Vec<_>>>()?;
                let radius = if values.len() > 7 {
                    Some(rows(floats(values, 7)?, count)?)
                } else {
                    None
                };
                let mut state = state.borrow_mut();
                let mut indices = Vec::with_capacity(count);
                for row in 0..count {
                    let body = Body {
                        mass: columns[0][row],
                        position: DVec3::new(columns[1][row], columns[2][row], columns[3][row]),
                        velocity: DVec3::new(columns[4][row], columns[5][row], columns[6][row]),
                        radius: radius.map_or(0.0, |r| r[row]),
                        children: [NO_BODY; 2],
                    };
                    let index = state.allocate();
                    state.bodies.insert(index, body);
                    indices.push(index);
                }
                Ok(indices)
            },
        )
    }

    fn delete_particle(&self) -> DeleteMethod {
        let state = Rc::clone(&self.state);
        DeleteMethod::new("delete_particle", move |indices| {
            let mut state = state.borrow_mut();
            for &index in indices {
                state.body(index)?;
            }
            for &index in indices {
                state.release(index);
            }
            Ok(())
        })
    }

    fn get_number_of_particles(&self) -> CountMethod {
        let state = Rc::clone(&self.state);
        CountMethod::new("get_number_of_particles", move || Ok(state.borrow().bodies.len()))
    }

    fn getter<const N: usize>(
        &self,
        name: &str,
        outputs: [&str; N],
        field: impl Fn(&Body) -> [f64; N] + 'static,
    ) -> GetAttributesMethod {
        let state = Rc::clone(&self.state);
        GetAttributesMethod::new(
            MethodSpecification::new(name).inputs([INDEX_NAME]).outputs(outputs),
            move |indices, _| state.borrow().read(&indices[0], &field),
        )
    }

    fn setter<const N: usize>(
        &self,
        name: &str,
        inputs: [&str; N],
        field: impl Fn(&mut Body, [f64; N]) + 'static,
    ) -> SetAttributesMethod {
        let state = Rc::clone(&self.state);
        SetAttributesMethod::new(
            MethodSpecification::new(name).inputs(std::iter::once(INDEX_NAME).chain(inputs)),
            move |indices, values, _| state.borrow_mut().write(&indices[0], values, &field),
        )
    }

    fn get_children(&self) -> GetAttributesMethod {
        let state = Rc::clone(&self.state);
        GetAttributesMethod::new(
            MethodSpecification::new("get_children")
                .inputs([INDEX_NAME])
                .outputs(["child1", "child2"]),
            move |indices, _| {
                let state = state.borrow();
                let mut columns = [Vec::new(), Vec::new()];
                for &index in &indices[0] {
                    let body = state.body(index)?;
                    columns[0].push(body.children[0]);
                    columns[1].push(body.children[1]);
                }
                Ok(columns.into_iter().map(Quantity::indices).collect())
            },
        )
        .with_index_outputs(vec![true, true])
    }

    fn set_children(&self) -> SetAttributesMethod {
        let state = Rc::clone(&self.state);
        SetAttributesMethod::new(
            MethodSpecification::new("set_children").inputs([INDEX_NAME, "child1", "child2"]),
            move |indices, values, _| {
                let count = indices[0].len();
                let (first, second) = (rows(ints(values, 0)?, count)?, rows(ints(values, 1)?, count)?);
                let mut state = state.borrow_mut();
                for (row, &index) in indices[0].iter().enumerate() {
                    state.body_mut(index)?.children = [first[row], second[row]];
                }
                Ok(())
            },
        )
    }

    /// Build a particle storage over this code.
    #[must_use]
    pub fn particle_storage(&self, allocator: KeyAllocator) -> InCodeParticleStorage {
        InCodeParticleStorage::builder(self.new_particle(), self.delete_particle(), self.get_number_of_particles())
            .index_name(INDEX_NAME)
            .allocator(allocator)
            .getter(self.getter("get_mass", ["mass"], |b| [b.mass]))
            .getter(self.getter("get_position", ["x", "y", "z"], |b| b.position.to_array()))
            .getter(self.getter("get_velocity", ["vx", "vy", "vz"], |b| b.velocity.to_array()))
            .getter(self.getter("get_radius", ["radius"], |b| [b.radius]))
            .getter(self.getter(
                "get_state",
                ["mass", "x", "y", "z", "vx", "vy", "vz", "radius"],
                |b| {
                    let (p, v) = (b.position, b.velocity);
                    [b.mass, p.x, p.y, p.z, v.x, v.y, v.z, b.radius]
                },
            ))
            .getter(self.get_children())
            .setter(self.setter("set_mass", ["mass"], |b, [m]| b.mass = m))
            .setter(self.setter("set_position", ["x", "y", "z"], |b, p| b.position = DVec3::from_array(p)))
            .setter(self.setter("set_velocity", ["vx", "vy", "vz"], |b, v| b.velocity = DVec3::from_array(v)))
            .setter(self.setter("set_radius", ["radius"], |b, [r]| b.radius = r))
            .setter(self.set_children())
            .build()
    }

    /// `get_escapers()`: bodies beyond the escape radius.
    #[must_use]
    pub fn escapers(&self) -> QueryMethod {
        let state = Rc::clone(&self.state);
        QueryMethod::new("get_escapers", move |_| {
            let state = state.borrow();
            let radius = state.parameters.escape_radius;
            Ok(state
                .bodies
                .iter()
                .filter(|(_, body)| body.position.length() > radius)
                .map(|(&index, _)| index)
                .collect())
        })
    }

    /// `child1, child2 = get_children(index)`.
    #[must_use]
    pub fn children(&self) -> SpecificSelectMethod {
        let getter = self.get_children_indices();
        SpecificSelectMethod::new(
            MethodSpecification::new("get_children")
                .inputs([INDEX_NAME])
                .outputs(["child1", "child2"]),
            getter,
        )
    }

    fn get_children_indices(&self) -> impl Fn(&[CodeIndex]) -> CodeResult<Vec<Vec<CodeIndex>>> + 'static {
        let state = Rc::clone(&self.state);
        move |indices| {
            let state = state.borrow();
            let mut columns = vec![Vec::with_capacity(indices.len()); 2];
            for &index in indices {
                let body = state.body(index)?;
                columns[0].push(body.children[0]);
                columns[1].push(body.children[1]);
            }
            Ok(columns)
        }
    }

    /// `get_neighbour(index, rank)` with `get_number_of_neighbours(index)`,
    /// nearest first.
    #[must_use]
    pub fn neighbours(&self) -> SpecificSelectSubsetMethod {
        let lookup_state = Rc::clone(&self.state);
        let count_state = Rc::clone(&self.state);
        SpecificSelectSubsetMethod::new("get_neighbour", move |indices, ranks| {
            let state = lookup_state.borrow();
            indices
                .iter()
                .zip(ranks)
                .map(|(&index, &rank)| -> CodeResult<CodeIndex> {
                    Ok(state.neighbours(index)?.get(rank).copied().unwrap_or(NO_BODY))
                })
                .collect()
        })
        .with_count(move |indices| {
            let state = count_state.borrow();
            indices
                .iter()
                .map(|&index| -> CodeResult<usize> { Ok(state.neighbours(index)?.len()) })
                .collect()
        })
    }

    /// Staged sphere selection: `select_in_sphere(x, y, z, r)`, then
    /// `get_number_of_selected(id)` and `get_selected(id, rank)`.
    #[must_use]
    pub fn in_sphere(&self) -> SubsetSelectMethod {
        let lookup_state = Rc::clone(&self.state);
        let query_state = Rc::clone(&self.state);
        let count_state = Rc::clone(&self.state);
        SubsetSelectMethod::new("get_selected", move |ids, ranks| {
            let state = lookup_state.borrow();
            let id = ids.first().copied().unwrap_or(-1);
            let selection = state.selection(id)?;
            ranks
                .iter()
                .map(|&rank| {
                    selection.get(rank).copied().ok_or_else(|| {
                        CodeError::new(ERROR_BAD_ARGUMENT, format!("selection {id} has no rank {rank}"))
                    })
                })
                .collect()
        })
        .with_query(move |arguments| {
            let center = DVec3::new(scalar(arguments, 0)?, scalar(arguments, 1)?, scalar(arguments, 2)?);
            let radius = scalar(arguments, 3)?;
            let mut state = query_state.borrow_mut();
            let selected = state
                .bodies
                .iter()
                .filter(|(_, body)| body.position.distance(center) <= radius)
                .map(|(&index, _)| index)
                .collect();
            let id = state.queries;
            state.queries += 1;
            state.selection = Some((id, selected));
            Ok(vec![id])
        })
        .with_count(move |ids| {
            let state = count_state.borrow();
            Ok(state.selection(ids.first().copied().unwrap_or(-1))?.len())
        })
    }

    /// `potential = get_potential(index, softening)`. The softening argument
    /// is optional and defaults to the code's own.
    #[must_use]
    pub fn potential(&self) -> ComputeMethod {
        let state = Rc::clone(&self.state);
        ComputeMethod::new("get_potential", move |indices, arguments| {
            let state = state.borrow();
            let softening = if arguments.is_empty() {
                state.parameters.softening
            } else {
                scalar(arguments, 0)?
            };
            let potentials = indices
                .iter()
                .map(|&index| state.potential(index, softening))
                .collect::<CodeResult<Vec<_>>>()?;
            Ok(vec![Quantity::floats(potentials)])
        })
    }
}

#[cfg(test)]
mod tests {
    use incode_storage::{EntityKey, StorageError};

    use super::*;

    fn add_bodies(storage: &mut InCodeParticleStorage, masses: &[f64], positions: &[DVec3]) -> Vec<EntityKey> {
        let n = masses.len();
        let column = |f: fn(&DVec3) -> f64| Quantity::floats(positions.iter().map(f).collect());
        storage
            .add_new(
                n,
                &["mass", "x", "y", "z", "vx", "vy", "vz"],
                &[
                    Quantity::floats(masses.to_vec()),
                    column(|p| p.x),
                    column(|p| p.y),
                    column(|p| p.z),
                    Quantity::floats(vec![0.0; n]),
                    Quantity::floats(vec![0.0; n]),
                    Quantity::floats(vec![0.0; n]),
                ],
            )
            .unwrap()
    }

    fn line(n: usize, spacing: f64) -> Vec<DVec3> {
        (0..n).map(|i| DVec3::new(i as f64 * spacing, 0.0, 0.0)).collect()
    }

    #[test]
    fn test_children_as_object_keys() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let masses: Vec<f64> = (0..10).map(f64::from).collect();
        let keys = add_bodies(&mut storage, &masses, &line(10, 0.1));

        let indices = storage.indices_of(&keys[1..3]).unwrap();
        storage
            .set_values(
                &keys[..1],
                &["child1", "child2"],
                &[Quantity::indices(vec![indices[0]]), Quantity::indices(vec![indices[1]])],
            )
            .unwrap();

        let children = storage.get_values(&[keys[0], keys[1]], &["child1", "child2"]).unwrap();
        assert!(children[0].is_object_key());
        assert_eq!(children[0].as_keys(), Some(&[keys[1], EntityKey::NONE][..]));
        assert_eq!(children[1].as_keys(), Some(&[keys[2], EntityKey::NONE][..]));

        let child_mass = storage.get_values(&[children[0].as_keys().unwrap()[0]], &["mass"]).unwrap();
        assert_eq!(child_mass[0].as_floats(), Some(&[1.0][..]));

        let linked: Vec<EntityKey> = code.children().apply_on_all(&storage).unwrap().concat();
        let roots = keys.iter().filter(|k| !linked.contains(k)).count();
        assert_eq!(roots, 8);
        assert_eq!(linked.len(), 2);
    }

    #[test]
    fn test_deleted_child_link_is_cleared() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let keys = add_bodies(&mut storage, &[1.0, 1.0], &line(2, 0.5));
        let child = storage.index_of(keys[1]).unwrap();
        storage
            .set_values(
                &keys[..1],
                &["child1", "child2"],
                &[Quantity::indices(vec![child]), Quantity::indices(vec![NO_BODY])],
            )
            .unwrap();
        storage.remove_particles(&keys[1..]).unwrap();

        let children = code.children().apply_on_one(&storage, keys[0]).unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn test_reused_index_gets_new_key() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let first = add_bodies(&mut storage, &[1.0, 2.0, 3.0], &line(3, 0.5));
        let freed = storage.index_of(first[0]).unwrap();
        storage.remove_particles(&first[..1]).unwrap();

        let second = add_bodies(&mut storage, &[4.0], &line(1, 0.5));
        assert_eq!(storage.index_of(second[0]).unwrap(), freed);
        assert_ne!(second[0], first[0]);
        assert!(matches!(storage.index_of(first[0]), Err(StorageError::UnknownKey(_))));
        let mass = storage.get_values(&second, &["mass"]).unwrap();
        assert_eq!(mass[0].as_floats(), Some(&[4.0][..]));
    }

    #[test]
    fn test_state_getter_serves_mixed_request_in_one_call() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let keys = add_bodies(&mut storage, &[1.0, 2.0], &line(2, 0.5));
        let values = storage.get_values(&keys, &["radius", "x", "mass", "vz", "y", "z", "vx", "vy"]).unwrap();
        assert_eq!(values[1].as_floats(), Some(&[0.0, 0.5][..]));
        assert_eq!(values[2].as_floats(), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn test_index_parameter_is_not_an_attribute() {
        let code = GravityCode::default();
        let storage = code.particle_storage(KeyAllocator::new());
        let writable = storage.writable_attribute_names();
        assert!(!writable.iter().any(|n| n == INDEX_NAME));
        assert!(writable.contains(&"child1".to_string()));
    }

    #[test]
    fn test_queries_map_back_to_keys() {
        let code = GravityCode::new(GravityParameters {
            escape_radius: 1.0,
            neighbour_radius: 0.6,
            ..GravityParameters::default()
        });
        let mut storage = code.particle_storage(KeyAllocator::new());
        let keys = add_bodies(&mut storage, &[1.0; 4], &line(4, 0.5));

        assert_eq!(code.escapers().apply(&storage, &[]).unwrap(), vec![keys[3]]);
        assert_eq!(code.neighbours().apply_on_one(&storage, keys[1]).unwrap(), vec![keys[0], keys[2]]);

        let sphere = [0.0, 0.0, 0.0, 0.6].map(|v| Quantity::floats(vec![v]));
        assert_eq!(code.in_sphere().apply_on_all(&storage, &sphere).unwrap(), vec![keys[0], keys[1]]);

        let potential = code.potential().apply_on_all(&storage, &[]).unwrap();
        let values = potential[0].as_floats().unwrap();
        assert!(values.iter().all(|&p| p < 0.0));
        assert!(values[1] < values[0]);
    }

    #[test]
    fn test_sphere_selection_keeps_only_latest_query() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let keys = add_bodies(&mut storage, &[1.0; 3], &line(3, 0.5));
        let in_sphere = code.in_sphere();
        for radius in [0.1, 0.6, 2.0] {
            let sphere = [0.0, 0.0, 0.0, radius].map(|v| Quantity::floats(vec![v]));
            in_sphere.apply_on_all(&storage, &sphere).unwrap();
        }

        let state = code.state.borrow();
        let (id, selected) = state.selection.as_ref().unwrap();
        assert_eq!(*id, 2);
        assert_eq!(selected.len(), keys.len());
        assert_eq!(state.selection(0).unwrap_err().code, ERROR_UNKNOWN_SELECTION);
    }

    #[test]
    fn test_code_side_changes_are_adopted_and_disowned() {
        let code = GravityCode::new(GravityParameters {
            escape_radius: 1.0,
            ..GravityParameters::default()
        });
        let mut storage = code.particle_storage(KeyAllocator::new());
        let keys = add_bodies(&mut storage, &[2.0, 1.0], &[DVec3::ZERO, DVec3::new(3.0, 0.0, 0.0)]);

        let half = code.split(storage.index_of(keys[0]).unwrap(), DVec3::new(0.1, 0.0, 0.0)).unwrap();
        let adopted = storage.adopt_indices(&[half]).unwrap();
        let masses = storage.get_values(&[keys[0], adopted[0]], &["mass"]).unwrap();
        assert_eq!(masses[0].as_floats(), Some(&[1.0, 1.0][..]));

        let escaped = code.remove_escapers();
        assert_eq!(storage.disown_indices(&escaped), vec![keys[1]]);
        assert_eq!(storage.count().unwrap(), storage.key_count());
    }

    #[test]
    fn test_evolve_conserves_energy() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let keys = add_bodies(&mut storage, &[1.0, 1.0], &[DVec3::new(-0.5, 0.0, 0.0), DVec3::new(0.5, 0.0, 0.0)]);
        storage
            .set_values(&keys, &["vx", "vy", "vz"], &[
                Quantity::floats(vec![0.0, 0.0]),
                Quantity::floats(vec![-0.7, 0.7]),
                Quantity::floats(vec![0.0, 0.0]),
            ])
            .unwrap();

        let before = code.total_energy().unwrap();
        code.evolve(0.001, 100);
        let after = code.total_energy().unwrap();
        assert!(((after - before) / before).abs() < 1e-4);
        assert!((code.time() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_bad_arguments_surface_as_code_errors() {
        let code = GravityCode::default();
        let mut storage = code.particle_storage(KeyAllocator::new());
        let err = storage
            .add_new(1, &CREATE_INPUTS[..7], &[
                Quantity::ints(vec![1]),
                Quantity::floats(vec![0.0]),
                Quantity::floats(vec![0.0]),
                Quantity::floats(vec![0.0]),
                Quantity::floats(vec![0.0]),
                Quantity::floats(vec![0.0]),
                Quantity::floats(vec![0.0]),
            ])
            .unwrap_err();
        match err {
            StorageError::Code { source, .. } => assert_eq!(source.code, ERROR_BAD_ARGUMENT),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.key_count(), 0);
    }
}
