use std::ops::Index;

use crate::{Error, Result};

/// Fixed capacity array with a fill pointer.
///
/// Everything below `pointer` is live; slots at or beyond it hold defaults.
#[derive(Debug, Clone)]
pub struct PointerArray<T> {
    data: Vec<T>,
    pointer: usize,
}

impl<T: Clone + Default> PointerArray<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![T::default(); capacity],
            pointer: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn len(&self) -> usize {
        self.pointer
    }

    pub fn is_empty(&self) -> bool {
        self.pointer == 0
    }

    pub fn available(&self) -> usize {
        self.data.len() - self.pointer
    }

    pub fn write(&mut self, value: T) -> Result<()> {
        if self.pointer >= self.data.len() {
            return Err(Error::OutOfContext {
                capacity: self.data.len(),
                requested: self.pointer + 1,
            });
        }
        self.data[self.pointer] = value;
        self.pointer += 1;
        Ok(())
    }

    /// Writes every value or none of them.
    pub fn extend(&mut self, values: impl IntoIterator<Item = T>) -> Result<()> {
        let values: Vec<T> = values.into_iter().collect();
        if values.len() > self.available() {
            return Err(Error::OutOfContext {
                capacity: self.data.len(),
                requested: self.pointer + values.len(),
            });
        }
        for value in values {
            self.data[self.pointer] = value;
            self.pointer += 1;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    pub fn truncate(&mut self, len: usize) {
        if len >= self.pointer {
            return;
        }
        self.data[len..self.pointer]
            .iter_mut()
            .for_each(|x| *x = T::default());
        self.pointer = len;
    }

    /// Moves `[start, pointer)` down by `count`, dropping `[start - count, start)`.
    pub fn slide(&mut self, start: usize, count: usize) -> Result<()> {
        if count > start || start > self.pointer {
            return Err(Error::invariant(format!(
                "slide of {count} from {start} with pointer {}",
                self.pointer
            )));
        }
        if count == 0 {
            return Ok(());
        }
        self.data[start - count..self.pointer].rotate_left(count);
        let end = self.pointer;
        self.pointer -= count;
        self.data[self.pointer..end]
            .iter_mut()
            .for_each(|x| *x = T::default());
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn last(&self) -> Option<&T> {
        self.as_slice().last()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.pointer]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T> Index<usize> for PointerArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_until_full() {
        let mut array = PointerArray::<i32>::new(2);
        array.write(1).unwrap();
        array.write(2).unwrap();
        assert!(matches!(
            array.write(3),
            Err(Error::OutOfContext {
                capacity: 2,
                requested: 3
            })
        ));
        assert_eq!(array.as_slice(), &[1, 2]);
    }

    #[test]
    fn extend_is_all_or_nothing() {
        let mut array = PointerArray::<i32>::new(3);
        array.write(1).unwrap();
        assert!(array.extend([2, 3, 4]).is_err());
        assert_eq!(array.len(), 1);
        array.extend([2, 3]).unwrap();
        assert_eq!(array.available(), 0);
    }

    #[test]
    fn slide_compacts_left() {
        let mut array = PointerArray::<i32>::new(6);
        array.extend([1, 2, 3, 4, 5]).unwrap();
        array.slide(3, 2).unwrap();
        assert_eq!(array.as_slice(), &[1, 4, 5]);
        assert_eq!(array[3], 0);
        assert_eq!(array[4], 0);
        assert!(array.slide(1, 2).is_err());
    }

    #[test]
    fn clear_resets_stale_slots() {
        let mut array = PointerArray::<i32>::new(3);
        array.extend([7, 8]).unwrap();
        array.clear();
        assert!(array.is_empty());
        assert_eq!(array[0], 0);
    }

    #[test]
    fn iterates_live_slots_both_ways() {
        let mut array = PointerArray::<i32>::new(4);
        array.extend([1, 2, 3]).unwrap();
        assert_eq!(array.iter().rev().copied().collect::<Vec<_>>(), [3, 2, 1]);
        assert_eq!(array.iter().len(), 3);
    }
}
