//! Per-image, per-level storage.
//!
//! Pyramids are produced image by image but masks are built level by level
//! across all images. [`LevelTable`] stores both views in one row-major
//! allocation: a row is one image's pyramid, a column is one level across
//! the whole stack.

use crate::error::{Result, StackError};

#[derive(Debug, Clone)]
pub struct LevelTable<T> {
    images: usize,
    levels: usize,
    cells: Vec<T>,
}

impl<T> LevelTable<T> {
    /// Build a table from per-image rows. Every row must have `levels` cells.
    pub fn from_rows(rows: Vec<Vec<T>>, levels: usize) -> Result<Self> {
        let images = rows.len();
        let mut cells = Vec::with_capacity(images * levels);
        for (image, row) in rows.into_iter().enumerate() {
            if row.len() != levels {
                return Err(StackError::shape_mismatch(format!(
                    "image {} has {} levels, expected {}",
                    image,
                    row.len(),
                    levels
                )));
            }
            cells.extend(row);
        }
        Ok(Self {
            images,
            levels,
            cells,
        })
    }

    /// Build a table from per-level columns (each holding one cell per image).
    pub fn from_columns(columns: Vec<Vec<T>>, images: usize) -> Result<Self> {
        let levels = columns.len();
        let mut slots: Vec<Option<T>> = (0..images * levels).map(|_| None).collect();
        for (level, column) in columns.into_iter().enumerate() {
            if column.len() != images {
                return Err(StackError::shape_mismatch(format!(
                    "level {} has {} images, expected {}",
                    level,
                    column.len(),
                    images
                )));
            }
            for (image, cell) in column.into_iter().enumerate() {
                slots[image * levels + level] = Some(cell);
            }
        }
        Ok(Self {
            images,
            levels,
            cells: slots.into_iter().flatten().collect(),
        })
    }

    pub fn images(&self) -> usize {
        self.images
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn get(&self, image: usize, level: usize) -> &T {
        assert!(image < self.images && level < self.levels);
        &self.cells[image * self.levels + level]
    }

    /// One image's cells, finest level first.
    pub fn row(&self, image: usize) -> &[T] {
        let start = image * self.levels;
        &self.cells[start..start + self.levels]
    }

    /// One level's cells, in stack order.
    pub fn column(&self, level: usize) -> impl Iterator<Item = &T> + '_ {
        assert!(level < self.levels || self.images == 0);
        (0..self.images).map(move |image| &self.cells[image * self.levels + level])
    }

    /// Apply `f` to every cell, keeping the layout.
    pub fn try_map<U, E>(
        &self,
        mut f: impl FnMut(usize, usize, &T) -> std::result::Result<U, E>,
    ) -> std::result::Result<LevelTable<U>, E> {
        let mut cells = Vec::with_capacity(self.cells.len());
        for image in 0..self.images {
            for level in 0..self.levels {
                cells.push(f(image, level, self.get(image, level))?);
            }
        }
        Ok(LevelTable {
            images: self.images,
            levels: self.levels,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_and_columns_agree() -> Result<()> {
        let rows = vec![vec![(0, 0), (0, 1), (0, 2)], vec![(1, 0), (1, 1), (1, 2)]];
        let table = LevelTable::from_rows(rows, 3)?;
        assert_eq!(table.images(), 2);
        assert_eq!(table.levels(), 3);
        assert_eq!(table.row(1), &[(1, 0), (1, 1), (1, 2)]);
        assert_eq!(table.column(2).copied().collect::<Vec<_>>(), vec![(0, 2), (1, 2)]);

        let columns = (0..3).map(|k| vec![(0, k), (1, k)]).collect();
        let transposed = LevelTable::from_columns(columns, 2)?;
        for image in 0..2 {
            assert_eq!(transposed.row(image), table.row(image));
        }
        Ok(())
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let rows = vec![vec![1, 2], vec![3]];
        assert!(matches!(
            LevelTable::from_rows(rows, 2),
            Err(StackError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_zero_levels() -> Result<()> {
        let table: LevelTable<u8> = LevelTable::from_rows(vec![vec![], vec![]], 0)?;
        assert_eq!(table.images(), 2);
        assert!(table.row(1).is_empty());
        Ok(())
    }
}
