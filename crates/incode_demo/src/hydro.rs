//! A small in-process hydro grid code.
//!
//! Holds conserved quantities on a regular 3-D grid of cells indexed
//! `1..=n` per dimension. Codes with several grids take the grid number as
//! the `index_of_grid` keyword; this one only has grid 1.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use incode_storage::{
    CodeError, CodeIndex, CodeResult, GetAttributesMethod, InCodeGridStorage, Keywords, MethodSpecification,
    Quantity, RangeMethod, SetAttributesMethod,
};

pub const ERROR_UNKNOWN_GRID: i32 = -1;
pub const ERROR_OUT_OF_RANGE: i32 = -2;
pub const ERROR_BAD_ARGUMENT: i32 = -3;

/// Keyword selecting the grid inside the code.
pub const GRID_KEYWORD: &str = "index_of_grid";

/// Conserved quantities stored per cell.
pub const FIELDS: [&str; 5] = ["rho", "rhovx", "rhovy", "rhovz", "energy"];

const INDEX_INPUTS: [&str; 3] = ["i", "j", "k"];

#[derive(Debug)]
struct HydroState {
    size: usize,
    fields: BTreeMap<&'static str, Vec<f64>>,
}

impl HydroState {
    fn check_grid(keywords: &Keywords) -> CodeResult<()> {
        let Some(grid) = keywords.get(GRID_KEYWORD) else {
            return Ok(());
        };
        if grid.as_ints() == Some(&[1][..]) {
            Ok(())
        } else {
            Err(CodeError::new(ERROR_UNKNOWN_GRID, format!("no grid {grid:?}")))
        }
    }

    fn offset(&self, i: CodeIndex, j: CodeIndex, k: CodeIndex) -> CodeResult<usize> {
        let n = self.size;
        let position = |index: CodeIndex| {
            usize::try_from(index - 1)
                .ok()
                .filter(|&p| p < n)
                .ok_or_else(|| CodeError::new(ERROR_OUT_OF_RANGE, format!("cell ({i}, {j}, {k}) outside grid")))
        };
        Ok((position(i)? * n + position(j)?) * n + position(k)?)
    }

    fn offsets(&self, indices: &[Vec<CodeIndex>]) -> CodeResult<Vec<usize>> {
        let [i, j, k] = indices else {
            return Err(CodeError::new(ERROR_BAD_ARGUMENT, "expected three index arrays"));
        };
        i.iter()
            .zip(j)
            .zip(k)
            .map(|((&i, &j), &k)| self.offset(i, j, k))
            .collect()
    }

    fn field(&self, name: &str) -> CodeResult<&Vec<f64>> {
        self.fields
            .get(name)
            .ok_or_else(|| CodeError::new(ERROR_BAD_ARGUMENT, format!("no field {name}")))
    }
}

/// An in-process hydro code. Clones share the same grid.
#[derive(Debug, Clone)]
pub struct HydroCode {
    state: Rc<RefCell<HydroState>>,
}

impl HydroCode {
    /// A grid of `size` cells per side, all quantities zero.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let cells = size * size * size;
        let fields = FIELDS.iter().map(|&name| (name, vec![0.0; cells])).collect();
        Self {
            state: Rc::new(RefCell::new(HydroState { size, fields })),
        }
    }

    /// Cell width; the grid spans the unit cube.
    #[must_use]
    pub fn cell_size(&self) -> f64 {
        1.0 / self.state.borrow().size as f64
    }

    /// Sum of density over all cells times the cell volume.
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        let state = self.state.borrow();
        let volume = self.cell_size().powi(3);
        state.fields.get("rho").map_or(0.0, |rho| rho.iter().sum::<f64>() * volume)
    }

    fn get_index_range_inclusive(&self) -> RangeMethod {
        let state = Rc::clone(&self.state);
        RangeMethod::new("get_index_range_inclusive", move |keywords| {
            HydroState::check_grid(keywords)?;
            let n = CodeIndex::try_from(state.borrow().size)
                .map_err(|_| CodeError::new(ERROR_OUT_OF_RANGE, "grid too large"))?;
            Ok(vec![1, n, 1, n, 1, n])
        })
    }

    fn getter(&self, name: &str, outputs: &[&'static str]) -> GetAttributesMethod {
        let state = Rc::clone(&self.state);
        let fields = outputs.to_vec();
        GetAttributesMethod::new(
            MethodSpecification::new(name).inputs(INDEX_INPUTS).outputs(outputs.iter().copied()),
            move |indices, keywords| {
                HydroState::check_grid(keywords)?;
                let state = state.borrow();
                let offsets = state.offsets(indices)?;
                fields
                    .iter()
                    .map(|&field| -> CodeResult<Quantity> {
                        let values = state.field(field)?;
                        Ok(Quantity::floats(offsets.iter().map(|&o| values[o]).collect()))
                    })
                    .collect()
            },
        )
    }

    fn setter(&self, name: &str, inputs: &[&'static str]) -> SetAttributesMethod {
        let state = Rc::clone(&self.state);
        let fields = inputs.to_vec();
        SetAttributesMethod::new(
            MethodSpecification::new(name).inputs(INDEX_INPUTS.iter().chain(inputs).copied()),
            move |indices, values, keywords| {
                HydroState::check_grid(keywords)?;
                let mut state = state.borrow_mut();
                let offsets = state.offsets(indices)?;
                for (&field, value) in fields.iter().zip(values) {
                    let column = value
                        .as_floats()
                        .filter(|c| c.len() == offsets.len())
                        .ok_or_else(|| CodeError::new(ERROR_BAD_ARGUMENT, format!("bad values for {field}")))?;
                    let target = state
                        .fields
                        .get_mut(field)
                        .ok_or_else(|| CodeError::new(ERROR_BAD_ARGUMENT, format!("no field {field}")))?;
                    for (&offset, &v) in offsets.iter().zip(column) {
                        target[offset] = v;
                    }
                }
                debug!(cells = offsets.len(), "grid values written");
                Ok(())
            },
        )
        .with_attribute_names(inputs.iter().copied())
    }

    fn get_position_of_index(&self) -> GetAttributesMethod {
        let state = Rc::clone(&self.state);
        GetAttributesMethod::new(
            MethodSpecification::new("get_position_of_index")
                .inputs(INDEX_INPUTS)
                .outputs(["x", "y", "z"]),
            move |indices, keywords| {
                HydroState::check_grid(keywords)?;
                let state = state.borrow();
                state.offsets(indices)?;
                let dx = 1.0 / state.size as f64;
                Ok(indices
                    .iter()
                    .map(|column| Quantity::floats(column.iter().map(|&i| (i as f64 - 0.5) * dx).collect()))
                    .collect())
            },
        )
    }

    /// Build a grid storage over grid 1 of this code.
    #[must_use]
    pub fn grid_storage(&self) -> InCodeGridStorage {
        InCodeGridStorage::builder(self.get_index_range_inclusive())
            .keyword(GRID_KEYWORD, Quantity::ints(vec![1]))
            .getter(self.getter("get_grid_density", &["rho"]))
            .getter(self.getter("get_grid_momentum_density", &["rhovx", "rhovy", "rhovz"]))
            .getter(self.getter("get_grid_energy_density", &["energy"]))
            .getter(self.getter("get_grid_state", &FIELDS))
            .getter(self.get_position_of_index())
            .setter(self.setter("set_grid_density", &["rho"]))
            .setter(self.setter("set_grid_momentum_density", &["rhovx", "rhovy", "rhovz"]))
            .setter(self.setter("set_grid_energy_density", &["energy"]))
            .build()
    }

    /// A storage addressing a grid number the code does not have.
    #[must_use]
    pub fn grid_storage_for(&self, grid: i64) -> InCodeGridStorage {
        InCodeGridStorage::builder(self.get_index_range_inclusive())
            .keyword(GRID_KEYWORD, Quantity::ints(vec![grid]))
            .getter(self.getter("get_grid_density", &["rho"]))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use incode_storage::{DimSelection, GridSelection, StorageError};

    use super::*;

    #[test]
    fn test_shape_and_len() {
        let grid = HydroCode::new(5).grid_storage();
        assert_eq!(grid.shape().unwrap(), vec![5, 5, 5]);
        assert_eq!(grid.len().unwrap(), 125);
        assert_eq!(grid.ranges().unwrap(), vec![(1, 5), (1, 5), (1, 5)]);
    }

    #[test]
    fn test_set_all_then_read_slices() {
        let code = HydroCode::new(4);
        let mut grid = code.grid_storage();
        let rho: Vec<f64> = (0..64).map(f64::from).collect();
        grid.set_values(&GridSelection::All, &["rho"], &[Quantity::floats(rho)]).unwrap();

        let plane = GridSelection::Slices(vec![DimSelection::Index(2)]);
        let values = grid.get_values(&plane, &["rho"]).unwrap();
        assert_eq!(values[0].shape(), &[4, 4]);
        assert_eq!(values[0].as_floats().unwrap()[0], 32.0);

        let corner = grid.get_values(&GridSelection::Point(vec![-1, -1, -1]), &["rho"]).unwrap();
        assert_eq!(corner[0].as_floats(), Some(&[63.0][..]));
        assert!((code.total_mass() - (0..64).sum::<i32>() as f64 / 64.0).abs() < 1e-12);
    }

    #[test]
    fn test_mixed_request_combines_getters() {
        let code = HydroCode::new(2);
        let mut grid = code.grid_storage();
        grid.set_values(
            &GridSelection::All,
            &["rhovx", "rhovy", "rhovz"],
            &[
                Quantity::floats(vec![1.0; 8]),
                Quantity::floats(vec![2.0; 8]),
                Quantity::floats(vec![3.0; 8]),
            ],
        )
        .unwrap();
        let values = grid.get_values(&GridSelection::All, &["energy", "rhovy", "rho"]).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[1].as_floats(), Some(&[2.0; 8][..]));
    }

    #[test]
    fn test_cell_positions() {
        let grid = HydroCode::new(2).grid_storage();
        let values = grid.get_values(&GridSelection::Point(vec![1, 0, 1]), &["x", "y", "z"]).unwrap();
        assert_eq!(values[0].as_floats(), Some(&[0.75][..]));
        assert_eq!(values[1].as_floats(), Some(&[0.25][..]));
    }

    #[test]
    fn test_position_is_read_only() {
        let mut grid = HydroCode::new(2).grid_storage();
        assert!(!grid.writable_attribute_names().contains(&"x".to_string()));
        let err = grid
            .set_values(&GridSelection::Point(vec![0, 0, 0]), &["x"], &[Quantity::floats(vec![0.0])])
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownWritableAttribute(_)));
    }

    #[test]
    fn test_unknown_grid_keyword_fails() {
        let grid = HydroCode::new(2).grid_storage_for(2);
        match grid.shape().unwrap_err() {
            StorageError::Code { source, .. } => assert_eq!(source.code, ERROR_UNKNOWN_GRID),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let code = HydroCode::new(3);
        let mut grid = code.grid_storage();
        grid.set_values(&GridSelection::Point(vec![1, 1, 1]), &["energy"], &[Quantity::floats(vec![5.0])])
            .unwrap();
        let snapshot = grid.snapshot().unwrap();
        let restored = incode_storage::GridSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.shape, vec![3, 3, 3]);
        assert_eq!(restored.get("energy").unwrap().as_floats().unwrap()[13], 5.0);
        assert_eq!(restored.attributes.len(), 8);
    }
}
