//! Grids stored inside a code.
//!
//! A grid has no keys: points are addressed by one index per dimension, in
//! the inclusive range the code reports for that dimension. Selections are
//! expressed in positions relative to the start of each range and are turned
//! into flat per-dimension index arrays before the code is called.

use std::collections::BTreeMap;

use tracing::{info, trace};

use crate::error::{StorageError, StorageResult};
use crate::key::EntityKey;
use crate::key_map::NoKeys;
use crate::method::{AttributeGetter, AttributeSetter, RangeMethod};
use crate::registry::AttributeRegistry;
use crate::snapshot::GridSnapshot;
use crate::value::{CodeIndex, Keywords, Quantity};

/// Selection along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimSelection {
    /// A single position. Negative values count from the end. The dimension
    /// is dropped from the result shape.
    Index(i64),
    /// Positions `start..stop` every `step`, with negative bounds counting
    /// from the end and missing bounds meaning "from the edge".
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    },
}

impl DimSelection {
    /// Every position along the dimension.
    #[must_use]
    pub fn full() -> Self {
        Self::Range {
            start: None,
            stop: None,
            step: 1,
        }
    }

    /// Positions `start..stop`.
    #[must_use]
    pub fn range(start: i64, stop: i64) -> Self {
        Self::Range {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }

    fn keeps_dimension(&self) -> bool {
        matches!(self, Self::Range { .. })
    }

    fn positions(&self, len: usize) -> StorageResult<Vec<usize>> {
        match *self {
            Self::Index(index) => Ok(vec![normalize_index(index, len)?]),
            Self::Range { start, stop, step } => slice_positions(start, stop, step, len),
        }
    }
}

/// Which points of a grid to read or write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GridSelection {
    /// The whole grid; results have the grid's shape.
    #[default]
    All,
    /// One point; results are scalars (shape `[]`).
    Point(Vec<i64>),
    /// One selection per leading dimension; trailing dimensions are taken
    /// whole.
    Slices(Vec<DimSelection>),
    /// A row-major flag per grid point; results are one-dimensional.
    Mask(Vec<bool>),
    /// Explicit points; results are one-dimensional.
    Coordinates(Vec<Vec<i64>>),
}

fn normalize_index(index: i64, len: usize) -> StorageResult<usize> {
    let len = i64::try_from(len).map_err(|_| StorageError::InvalidSelection("grid too large".into()))?;
    let position = if index < 0 { index + len } else { index };
    if (0..len).contains(&position) {
        Ok(position as usize)
    } else {
        Err(StorageError::InvalidSelection(format!(
            "index {index} out of bounds for dimension of size {len}"
        )))
    }
}

fn slice_positions(start: Option<i64>, stop: Option<i64>, step: i64, len: usize) -> StorageResult<Vec<usize>> {
    if step == 0 {
        return Err(StorageError::InvalidSelection("slice step cannot be zero".into()));
    }
    let len = i64::try_from(len).map_err(|_| StorageError::InvalidSelection("grid too large".into()))?;
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let clamp = |bound: i64| {
        if bound < 0 {
            (bound + len).max(lower)
        } else {
            bound.min(upper)
        }
    };
    let start = start.map_or(if step > 0 { lower } else { upper }, clamp);
    let stop = stop.map_or(if step > 0 { upper } else { lower }, clamp);

    let mut positions = Vec::new();
    let mut position = start;
    while (step > 0 && position < stop) || (step < 0 && position > stop) {
        positions.push(position as usize);
        position += step;
    }
    Ok(positions)
}

/// Positions per dimension (`columns[d][p]`) and the shape to read them as.
struct ResolvedSelection {
    columns: Vec<Vec<usize>>,
    shape: Vec<usize>,
}

impl ResolvedSelection {
    fn count(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    fn cartesian(lists: &[Vec<usize>], shape: Vec<usize>) -> Self {
        let total: usize = lists.iter().map(Vec::len).product();
        let mut columns: Vec<Vec<usize>> = vec![Vec::with_capacity(total); lists.len()];
        for flat in 0..total {
            let mut rest = flat;
            for (dimension, list) in lists.iter().enumerate().rev() {
                columns[dimension].push(list[rest % list.len()]);
                rest /= list.len();
            }
        }
        Self { columns, shape }
    }

    fn from_points(points: &[Vec<usize>], dims: usize, shape: Vec<usize>) -> Self {
        let columns = (0..dims)
            .map(|dimension| points.iter().map(|point| point[dimension]).collect())
            .collect();
        Self { columns, shape }
    }
}

/// Points per dimension for inclusive `(min, max)` ranges. Empty or inverted
/// ranges have no points.
fn shape_of(ranges: &[(CodeIndex, CodeIndex)]) -> StorageResult<Vec<usize>> {
    ranges
        .iter()
        .map(|&(min, max)| {
            let extent = max
                .checked_sub(min)
                .and_then(|d| d.checked_add(1))
                .ok_or_else(|| StorageError::InvalidSelection(format!("range ({min}, {max}) is too large")))?;
            Ok(usize::try_from(extent).unwrap_or(0))
        })
        .collect()
}

fn resolve(selection: &GridSelection, grid_shape: &[usize]) -> StorageResult<ResolvedSelection> {
    let dims = grid_shape.len();
    match selection {
        GridSelection::All => {
            let lists: Vec<Vec<usize>> = grid_shape.iter().map(|&n| (0..n).collect()).collect();
            Ok(ResolvedSelection::cartesian(&lists, grid_shape.to_vec()))
        }
        GridSelection::Point(point) => {
            let point = point_positions(point, grid_shape)?;
            Ok(ResolvedSelection::from_points(&[point], dims, Vec::new()))
        }
        GridSelection::Slices(slices) => {
            if slices.len() > dims {
                return Err(StorageError::InvalidSelection(format!(
                    "{} slices for a {dims}-dimensional grid",
                    slices.len()
                )));
            }
            let mut lists = Vec::with_capacity(dims);
            let mut shape = Vec::with_capacity(dims);
            for (dimension, &len) in grid_shape.iter().enumerate() {
                let slice = slices.get(dimension).copied().unwrap_or_else(DimSelection::full);
                let positions = slice.positions(len)?;
                if slice.keeps_dimension() {
                    shape.push(positions.len());
                }
                lists.push(positions);
            }
            Ok(ResolvedSelection::cartesian(&lists, shape))
        }
        GridSelection::Mask(mask) => {
            let size: usize = grid_shape.iter().product();
            if mask.len() != size {
                return Err(StorageError::InvalidSelection(format!(
                    "mask of {} flags for a grid of {size} points",
                    mask.len()
                )));
            }
            let points: Vec<Vec<usize>> = mask
                .iter()
                .enumerate()
                .filter(|&(_, &selected)| selected)
                .map(|(flat, _)| unravel(flat, grid_shape))
                .collect();
            let count = points.len();
            Ok(ResolvedSelection::from_points(&points, dims, vec![count]))
        }
        GridSelection::Coordinates(coordinates) => {
            let points = coordinates
                .iter()
                .map(|point| point_positions(point, grid_shape))
                .collect::<StorageResult<Vec<_>>>()?;
            let count = points.len();
            Ok(ResolvedSelection::from_points(&points, dims, vec![count]))
        }
    }
}

fn point_positions(point: &[i64], grid_shape: &[usize]) -> StorageResult<Vec<usize>> {
    if point.len() != grid_shape.len() {
        return Err(StorageError::InvalidSelection(format!(
            "point {point:?} does not address a {}-dimensional grid",
            grid_shape.len()
        )));
    }
    point
        .iter()
        .zip(grid_shape)
        .map(|(&index, &len)| normalize_index(index, len))
        .collect()
}

fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut point = vec![0; shape.len()];
    for (dimension, &len) in shape.iter().enumerate().rev() {
        point[dimension] = flat % len;
        flat /= len;
    }
    point
}

/// Builder for [`InCodeGridStorage`].
pub struct GridStorageBuilder {
    range_method: RangeMethod,
    getters: Vec<Box<dyn AttributeGetter>>,
    setters: Vec<Box<dyn AttributeSetter>>,
    keywords: Keywords,
}

impl GridStorageBuilder {
    #[must_use]
    pub fn getter(mut self, getter: impl AttributeGetter + 'static) -> Self {
        self.getters.push(Box::new(getter));
        self
    }

    #[must_use]
    pub fn setter(mut self, setter: impl AttributeSetter + 'static) -> Self {
        self.setters.push(Box::new(setter));
        self
    }

    /// Pass an extra keyword argument to every range, getter and setter call.
    #[must_use]
    pub fn keyword(mut self, name: impl Into<String>, value: Quantity) -> Self {
        self.keywords.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn build(self) -> InCodeGridStorage {
        let registry = AttributeRegistry::new(self.getters, self.setters, self.keywords);
        info!(
            method = self.range_method.name(),
            attributes = registry.defined_attribute_names().len(),
            "grid storage ready"
        );
        InCodeGridStorage {
            registry,
            range_method: self.range_method,
        }
    }
}

/// Manages a grid stored in a code.
#[derive(Debug)]
pub struct InCodeGridStorage {
    registry: AttributeRegistry,
    range_method: RangeMethod,
}

impl InCodeGridStorage {
    /// Start building a storage over the code's index range function.
    #[must_use]
    pub fn builder(range_method: RangeMethod) -> GridStorageBuilder {
        GridStorageBuilder {
            range_method,
            getters: Vec::new(),
            setters: Vec::new(),
            keywords: Keywords::new(),
        }
    }

    /// The inclusive `(min, max)` code index per dimension.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Code`] or [`StorageError::ResultArity`] if the
    /// range function fails.
    pub fn ranges(&self) -> StorageResult<Vec<(CodeIndex, CodeIndex)>> {
        self.range_method.call(self.registry.keywords())
    }

    /// Number of points per dimension, `max - min + 1` each.
    ///
    /// # Errors
    ///
    /// See [`Self::ranges`]; [`StorageError::InvalidSelection`] if a range
    /// does not fit in memory.
    pub fn shape(&self) -> StorageResult<Vec<usize>> {
        shape_of(&self.ranges()?)
    }

    /// Total number of grid points.
    ///
    /// # Errors
    ///
    /// See [`Self::ranges`].
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.shape()?.iter().product())
    }

    /// Returns `true` if the grid has no points.
    ///
    /// # Errors
    ///
    /// See [`Self::ranges`].
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    fn index_arrays(&self, selection: &GridSelection) -> StorageResult<(Vec<Vec<CodeIndex>>, Vec<usize>)> {
        let ranges = self.ranges()?;
        let shape = shape_of(&ranges)?;
        let resolved = resolve(selection, &shape)?;
        trace!(points = resolved.count(), shape = ?resolved.shape, "resolved grid selection");

        let indices = resolved
            .columns
            .iter()
            .zip(&ranges)
            .map(|(column, &(min, _))| column.iter().map(|&p| min + p as CodeIndex).collect())
            .collect();
        Ok((indices, resolved.shape))
    }

    /// Fetch `attributes` at the selected points, each shaped like the
    /// selection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSelection`], a getter selection error,
    /// or the code's error.
    pub fn get_values(&self, selection: &GridSelection, attributes: &[&str]) -> StorageResult<Vec<Quantity>> {
        let (indices, shape) = self.index_arrays(selection)?;
        if indices.first().is_none_or(Vec::is_empty) {
            return attributes
                .iter()
                .map(|_| Quantity::floats(Vec::new()).reshape(shape.clone()))
                .collect();
        }
        self.registry
            .get_values(&NoKeys, attributes, &indices)?
            .into_iter()
            .map(|value| value.reshape(shape.clone()))
            .collect()
    }

    /// Write `values` (parallel to `attributes`) at the selected points.
    ///
    /// Each value must hold one element per selected point, in row-major
    /// order; its own shape is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidSelection`],
    /// [`StorageError::LengthMismatch`], a setter selection error, or the
    /// code's error.
    pub fn set_values(
        &mut self,
        selection: &GridSelection,
        attributes: &[&str],
        values: &[Quantity],
    ) -> StorageResult<()> {
        let (indices, _) = self.index_arrays(selection)?;
        let count = indices.first().map_or(0, Vec::len);
        if count == 0 {
            return Ok(());
        }
        crate::particles::check_values(count, attributes, values)?;
        let values: Vec<Quantity> = values.iter().cloned().map(Quantity::flattened).collect();
        self.registry.set_values(attributes, &values, &indices)
    }

    /// Grids have a fixed set of points.
    ///
    /// # Errors
    ///
    /// Always returns [`StorageError::UnsupportedOperation`].
    pub fn add_particles(
        &mut self,
        _keys: &[EntityKey],
        _attributes: &[&str],
        _values: &[Quantity],
    ) -> StorageResult<()> {
        Err(StorageError::UnsupportedOperation("adding points to a grid"))
    }

    /// Grids have a fixed set of points.
    ///
    /// # Errors
    ///
    /// Always returns [`StorageError::UnsupportedOperation`].
    pub fn remove_particles(&mut self, _keys: &[EntityKey]) -> StorageResult<()> {
        Err(StorageError::UnsupportedOperation("removing points from a grid"))
    }

    #[must_use]
    pub fn defined_attribute_names(&self) -> Vec<String> {
        self.registry.defined_attribute_names()
    }

    #[must_use]
    pub fn writable_attribute_names(&self) -> Vec<String> {
        self.registry.writable_attribute_names()
    }

    /// Copy every readable attribute of the whole grid out of the code.
    ///
    /// # Errors
    ///
    /// Returns the range function's or any getter's error.
    pub fn snapshot(&self) -> StorageResult<GridSnapshot> {
        let names = self.registry.readable_attribute_names();
        let attributes: Vec<&str> = names.iter().map(String::as_str).collect();
        let values = self.get_values(&GridSelection::All, &attributes)?;
        Ok(GridSnapshot {
            shape: self.shape()?,
            attributes: names.into_iter().zip(values).collect::<BTreeMap<_, _>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestGrid;

    fn storage(code: &TestGrid) -> InCodeGridStorage {
        InCodeGridStorage::builder(code.range())
            .getter(code.getter(&["rho"]))
            .getter(code.getter(&["rhovx", "rhovy"]))
            .setter(code.setter(&["rho"]))
            .setter(code.setter(&["rhovx", "rhovy"]))
            .build()
    }

    #[test]
    fn test_shape_from_inclusive_ranges() {
        let code = TestGrid::new(&[(0, 4), (0, 4), (0, 4)]);
        let grid = storage(&code);
        assert_eq!(grid.shape().unwrap(), vec![5, 5, 5]);
        assert_eq!(grid.len().unwrap(), 125);

        let offset = TestGrid::new(&[(1, 3), (10, 11)]);
        assert_eq!(storage(&offset).shape().unwrap(), vec![3, 2]);
    }

    #[test]
    fn test_get_all_has_grid_shape() {
        let code = TestGrid::new(&[(1, 2), (1, 3)]);
        code.put("rho", &[2, 1], 7.0);
        let grid = storage(&code);
        let values = grid.get_values(&GridSelection::All, &["rho"]).unwrap();
        assert_eq!(values[0].shape(), &[2, 3]);
        assert_eq!(values[0].as_floats(), Some(&[0.0, 0.0, 0.0, 7.0, 0.0, 0.0][..]));
    }

    #[test]
    fn test_point_selection_is_scalar() {
        let code = TestGrid::new(&[(0, 4), (0, 4), (0, 4)]);
        code.put("rho", &[4, 0, 2], 3.5);
        let grid = storage(&code);
        let values = grid.get_values(&GridSelection::Point(vec![-1, 0, 2]), &["rho"]).unwrap();
        assert!(values[0].shape().is_empty());
        assert_eq!(values[0].as_floats(), Some(&[3.5][..]));
    }

    #[test]
    fn test_slices_drop_indexed_dimensions() {
        let code = TestGrid::new(&[(0, 4), (0, 4), (0, 4)]);
        let grid = storage(&code);
        let selection = GridSelection::Slices(vec![DimSelection::Index(1), DimSelection::range(1, 3)]);
        let values = grid.get_values(&selection, &["rho"]).unwrap();
        assert_eq!(values[0].shape(), &[2, 5]);
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let code = TestGrid::new(&[(0, 4), (0, 4), (0, 4)]);
        let mut grid = storage(&code);
        let selection = GridSelection::Slices(vec![
            DimSelection::range(0, 2),
            DimSelection::Index(3),
            DimSelection::Index(4),
        ]);
        grid.set_values(&selection, &["rho"], &[Quantity::floats(vec![1.5, 2.5])]).unwrap();

        assert_eq!(code.value("rho", &[0, 3, 4]), 1.5);
        assert_eq!(code.value("rho", &[1, 3, 4]), 2.5);
        let values = grid.get_values(&selection, &["rho"]).unwrap();
        assert_eq!(values[0].as_floats(), Some(&[1.5, 2.5][..]));
    }

    #[test]
    fn test_positions_are_offset_by_range_start() {
        let code = TestGrid::new(&[(10, 12)]);
        let mut grid = storage(&code);
        grid.set_values(&GridSelection::Point(vec![0]), &["rho"], &[Quantity::floats(vec![9.0])])
            .unwrap();
        assert_eq!(code.value("rho", &[10]), 9.0);
    }

    #[test]
    fn test_mask_and_coordinates_are_one_dimensional() {
        let code = TestGrid::new(&[(0, 1), (0, 1)]);
        code.put("rho", &[0, 1], 1.0);
        code.put("rho", &[1, 0], 2.0);
        let grid = storage(&code);

        let mask = GridSelection::Mask(vec![false, true, true, false]);
        let values = grid.get_values(&mask, &["rho"]).unwrap();
        assert_eq!(values[0].shape(), &[2]);
        assert_eq!(values[0].as_floats(), Some(&[1.0, 2.0][..]));

        let coordinates = GridSelection::Coordinates(vec![vec![1, 0], vec![0, 1], vec![0, 0]]);
        let values = grid.get_values(&coordinates, &["rho"]).unwrap();
        assert_eq!(values[0].as_floats(), Some(&[2.0, 1.0, 0.0][..]));
    }

    #[test]
    fn test_reversed_slice() {
        let code = TestGrid::new(&[(0, 3)]);
        for i in 0..4 {
            code.put("rho", &[i], i as f64);
        }
        let grid = storage(&code);
        let selection = GridSelection::Slices(vec![DimSelection::Range {
            start: None,
            stop: None,
            step: -2,
        }]);
        let values = grid.get_values(&selection, &["rho"]).unwrap();
        assert_eq!(values[0].as_floats(), Some(&[3.0, 1.0][..]));
    }

    #[test]
    fn test_bad_selections_are_rejected() {
        let code = TestGrid::new(&[(0, 4), (0, 4)]);
        let grid = storage(&code);
        let cases = [
            GridSelection::Point(vec![5, 0]),
            GridSelection::Point(vec![0]),
            GridSelection::Mask(vec![true; 3]),
            GridSelection::Slices(vec![DimSelection::full(); 3]),
            GridSelection::Slices(vec![DimSelection::Range {
                start: None,
                stop: None,
                step: 0,
            }]),
        ];
        for selection in &cases {
            assert!(
                matches!(grid.get_values(selection, &["rho"]), Err(StorageError::InvalidSelection(_))),
                "{selection:?} accepted"
            );
        }
    }

    #[test]
    fn test_empty_selection_makes_no_attribute_calls() {
        let code = TestGrid::new(&[(0, 4)]);
        let mut grid = storage(&code);
        let empty = GridSelection::Slices(vec![DimSelection::range(3, 3)]);
        let values = grid.get_values(&empty, &["rho"]).unwrap();
        assert_eq!(values[0].shape(), &[0]);
        grid.set_values(&empty, &["rho"], &[Quantity::floats(vec![])]).unwrap();
        // only the range function was asked
        assert_eq!(code.calls(), 2);
    }

    #[test]
    fn test_partial_setter_cover_fails() {
        let code = TestGrid::new(&[(0, 1)]);
        let mut grid = storage(&code);
        let err = grid
            .set_values(&GridSelection::All, &["rhovx"], &[Quantity::floats(vec![0.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownWritableAttribute(_)));
    }

    #[test]
    fn test_grid_points_cannot_be_added_or_removed() {
        let code = TestGrid::new(&[(0, 1)]);
        let mut grid = storage(&code);
        assert!(matches!(
            grid.add_particles(&[EntityKey(1)], &[], &[]),
            Err(StorageError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            grid.remove_particles(&[EntityKey(1)]),
            Err(StorageError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_snapshot_covers_every_attribute() {
        let code = TestGrid::new(&[(0, 1), (0, 2)]);
        code.put("rhovy", &[1, 2], 4.0);
        let grid = storage(&code);
        let snapshot = grid.snapshot().unwrap();
        assert_eq!(snapshot.shape, vec![2, 3]);
        assert_eq!(snapshot.attributes.len(), 3);
        assert_eq!(snapshot.get("rhovy").unwrap().as_floats().unwrap()[5], 4.0);
    }

    #[test]
    fn test_shape_of_extreme_ranges() {
        assert_eq!(shape_of(&[(1, 3), (5, 4), (2, 0)]).unwrap(), vec![3, 0, 0]);
        assert!(matches!(
            shape_of(&[(i64::MIN, i64::MAX)]),
            Err(StorageError::InvalidSelection(_))
        ));
        assert!(matches!(
            shape_of(&[(0, i64::MAX)]),
            Err(StorageError::InvalidSelection(_))
        ));

        let grid = storage(&TestGrid::new(&[(i64::MIN, 0)]));
        assert!(matches!(grid.shape(), Err(StorageError::InvalidSelection(_))));
        assert!(matches!(
            grid.get_values(&GridSelection::All, &["rho"]),
            Err(StorageError::InvalidSelection(_))
        ));
    }
}
