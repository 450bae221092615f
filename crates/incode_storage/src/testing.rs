//! In-memory stand-ins for external codes, used by the unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use crate::error::{CodeError, CodeResult};
use crate::method::{
    CountMethod, DeleteMethod, GetAttributesMethod, MethodSpecification, NewParticleMethod,
    RangeMethod, SetAttributesMethod,
};
use crate::value::{CodeIndex, Quantity};

#[derive(Default)]
struct ParticleState {
    particles: BTreeMap<CodeIndex, HashMap<String, f64>>,
    free: BTreeSet<CodeIndex>,
    next: CodeIndex,
    calls: usize,
    failing: bool,
    short_allocation: bool,
}

impl ParticleState {
    fn enter(&mut self, method: &str) -> CodeResult<()> {
        self.calls += 1;
        if self.failing {
            return Err(CodeError::new(-1, format!("{method} failed")));
        }
        Ok(())
    }

    fn allocate(&mut self) -> CodeIndex {
        if let Some(index) = self.free.pop_first() {
            return index;
        }
        let index = self.next;
        self.next += 1;
        index
    }
}

/// A particle code keeping one float per attribute per particle.
///
/// Freed indices are handed out again, lowest first.
#[derive(Clone, Default)]
pub(crate) struct TestCode {
    state: Rc<RefCell<ParticleState>>,
}

impl TestCode {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of code functions called so far.
    pub(crate) fn calls(&self) -> usize {
        self.state.borrow().calls
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.state.borrow_mut().failing = failing;
    }

    /// Make the creator return one index fewer than asked for.
    pub(crate) fn set_short_allocation(&self, short: bool) {
        self.state.borrow_mut().short_allocation = short;
    }

    /// Create a particle at `index` behind the storage's back.
    pub(crate) fn insert(&self, index: CodeIndex, values: &[(&str, f64)]) {
        let mut state = self.state.borrow_mut();
        let particle = values.iter().map(|&(n, v)| (n.to_string(), v)).collect();
        state.particles.insert(index, particle);
        state.free.remove(&index);
        state.next = state.next.max(index + 1);
    }

    pub(crate) fn value(&self, index: CodeIndex, attribute: &str) -> Option<f64> {
        let state = self.state.borrow();
        state.particles.get(&index)?.get(attribute).copied()
    }

    pub(crate) fn getter(&self, attributes: &[&str]) -> GetAttributesMethod {
        let name = format!("get_{}", attributes.join("_"));
        let spec = MethodSpecification::new(name.clone())
            .inputs(["index_of_the_particle"])
            .outputs(attributes.iter().copied());
        let outputs: Vec<String> = attributes.iter().map(|a| (*a).to_string()).collect();
        let state = Rc::clone(&self.state);
        GetAttributesMethod::new(spec, move |indices, _| {
            let mut state = state.borrow_mut();
            state.enter(&name)?;
            let mut result = Vec::with_capacity(outputs.len());
            for attribute in &outputs {
                let mut column = Vec::with_capacity(indices[0].len());
                for index in &indices[0] {
                    let value = state
                        .particles
                        .get(index)
                        .and_then(|p| p.get(attribute))
                        .ok_or_else(|| CodeError::new(-1, format!("no {attribute} at index {index}")))?;
                    column.push(*value);
                }
                result.push(Quantity::floats(column));
            }
            Ok(result)
        })
    }

    pub(crate) fn setter(&self, attributes: &[&str]) -> SetAttributesMethod {
        let name = format!("set_{}", attributes.join("_"));
        let spec = MethodSpecification::new(name.clone())
            .inputs(std::iter::once("index_of_the_particle").chain(attributes.iter().copied()));
        let inputs: Vec<String> = attributes.iter().map(|a| (*a).to_string()).collect();
        let state = Rc::clone(&self.state);
        SetAttributesMethod::new(spec, move |indices, values, _| {
            let mut state = state.borrow_mut();
            state.enter(&name)?;
            for (position, index) in indices[0].iter().enumerate() {
                let particle = state
                    .particles
                    .get_mut(index)
                    .ok_or_else(|| CodeError::new(-1, format!("no particle at index {index}")))?;
                for (attribute, value) in inputs.iter().zip(values) {
                    let column = value
                        .as_floats()
                        .ok_or_else(|| CodeError::new(-2, format!("{attribute} is not a float array")))?;
                    particle.insert(attribute.clone(), column[position]);
                }
            }
            Ok(())
        })
    }

    /// A creator taking `attributes`, of which `optional` default to zero.
    pub(crate) fn creator(&self, attributes: &[&str], optional: &[&str]) -> NewParticleMethod {
        let spec = MethodSpecification::new("new_particle")
            .inputs(attributes.iter().copied())
            .optional(optional.iter().copied());
        let inputs: Vec<String> = attributes.iter().map(|a| (*a).to_string()).collect();
        let state = Rc::clone(&self.state);
        NewParticleMethod::new(spec, move |count, values| {
            let mut state = state.borrow_mut();
            state.enter("new_particle")?;
            let count = if state.short_allocation {
                count.saturating_sub(1)
            } else {
                count
            };
            let mut indices = Vec::with_capacity(count);
            for position in 0..count {
                let index = state.allocate();
                let particle = inputs
                    .iter()
                    .enumerate()
                    .map(|(p, attribute)| {
                        let value = values
                            .get(p)
                            .and_then(Quantity::as_floats)
                            .map_or(0.0, |column| column[position]);
                        (attribute.clone(), value)
                    })
                    .collect();
                state.particles.insert(index, particle);
                indices.push(index);
            }
            Ok(indices)
        })
    }

    pub(crate) fn delete(&self) -> DeleteMethod {
        let state = Rc::clone(&self.state);
        DeleteMethod::new("delete_particle", move |indices| {
            let mut state = state.borrow_mut();
            state.enter("delete_particle")?;
            if let Some(index) = indices.iter().find(|&&i| !state.particles.contains_key(&i)) {
                return Err(CodeError::new(-1, format!("no particle at index {index}")));
            }
            for index in indices {
                state.particles.remove(index);
                state.free.insert(*index);
            }
            Ok(())
        })
    }

    pub(crate) fn count(&self) -> CountMethod {
        let state = Rc::clone(&self.state);
        CountMethod::new("get_number_of_particles", move || {
            let mut state = state.borrow_mut();
            state.enter("get_number_of_particles")?;
            Ok(state.particles.len())
        })
    }
}

#[derive(Default)]
struct GridState {
    ranges: Vec<(CodeIndex, CodeIndex)>,
    cells: HashMap<(String, Vec<CodeIndex>), f64>,
    calls: usize,
}

impl GridState {
    fn check(&self, point: &[CodeIndex]) -> CodeResult<()> {
        let inside = point.len() == self.ranges.len()
            && point
                .iter()
                .zip(&self.ranges)
                .all(|(&i, &(min, max))| (min..=max).contains(&i));
        if inside {
            Ok(())
        } else {
            Err(CodeError::new(-1, format!("point {point:?} outside grid")))
        }
    }
}

/// A grid code keeping one float per attribute per cell, zero until set.
#[derive(Clone, Default)]
pub(crate) struct TestGrid {
    state: Rc<RefCell<GridState>>,
}

const GRID_INPUTS: [&str; 3] = ["i", "j", "k"];

fn points(indices: &[Vec<CodeIndex>]) -> Vec<Vec<CodeIndex>> {
    let count = indices.first().map_or(0, Vec::len);
    (0..count)
        .map(|p| indices.iter().map(|dimension| dimension[p]).collect())
        .collect()
}

impl TestGrid {
    /// A grid spanning `min..=max` in each dimension.
    pub(crate) fn new(ranges: &[(CodeIndex, CodeIndex)]) -> Self {
        let state = GridState {
            ranges: ranges.to_vec(),
            ..GridState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.state.borrow().calls
    }

    pub(crate) fn value(&self, attribute: &str, point: &[CodeIndex]) -> f64 {
        let key = (attribute.to_string(), point.to_vec());
        self.state.borrow().cells.get(&key).copied().unwrap_or(0.0)
    }

    pub(crate) fn put(&self, attribute: &str, point: &[CodeIndex], value: f64) {
        let key = (attribute.to_string(), point.to_vec());
        self.state.borrow_mut().cells.insert(key, value);
    }

    pub(crate) fn range(&self) -> RangeMethod {
        let state = Rc::clone(&self.state);
        RangeMethod::new("get_index_range_inclusive", move |_| {
            let mut state = state.borrow_mut();
            state.calls += 1;
            Ok(state.ranges.iter().flat_map(|&(min, max)| [min, max]).collect())
        })
    }

    pub(crate) fn getter(&self, attributes: &[&str]) -> GetAttributesMethod {
        let dims = self.state.borrow().ranges.len();
        let spec = MethodSpecification::new(format!("get_{}", attributes.join("_")))
            .inputs(GRID_INPUTS[..dims].iter().copied())
            .outputs(attributes.iter().copied());
        let outputs: Vec<String> = attributes.iter().map(|a| (*a).to_string()).collect();
        let state = Rc::clone(&self.state);
        GetAttributesMethod::new(spec, move |indices, _| {
            let mut state = state.borrow_mut();
            state.calls += 1;
            let points = points(indices);
            for point in &points {
                state.check(point)?;
            }
            Ok(outputs
                .iter()
                .map(|attribute| {
                    let column = points
                        .iter()
                        .map(|point| {
                            let key = (attribute.clone(), point.clone());
                            state.cells.get(&key).copied().unwrap_or(0.0)
                        })
                        .collect();
                    Quantity::floats(column)
                })
                .collect())
        })
    }

    pub(crate) fn setter(&self, attributes: &[&str]) -> SetAttributesMethod {
        let dims = self.state.borrow().ranges.len();
        let spec = MethodSpecification::new(format!("set_{}", attributes.join("_")))
            .inputs(GRID_INPUTS[..dims].iter().chain(attributes).copied());
        let inputs: Vec<String> = attributes.iter().map(|a| (*a).to_string()).collect();
        let names = inputs.clone();
        let state = Rc::clone(&self.state);
        SetAttributesMethod::new(spec, move |indices, values, _| {
            let mut state = state.borrow_mut();
            state.calls += 1;
            let points = points(indices);
            for point in &points {
                state.check(point)?;
            }
            for (attribute, value) in inputs.iter().zip(values) {
                let column = value
                    .as_floats()
                    .ok_or_else(|| CodeError::new(-2, format!("{attribute} is not a float array")))?;
                for (point, v) in points.iter().zip(column) {
                    state.cells.insert((attribute.clone(), point.clone()), *v);
                }
            }
            Ok(())
        })
        .with_attribute_names(names)
    }
}
