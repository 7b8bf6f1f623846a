
//! Simple math utilities.

use std::convert::TryFrom;
use crate::error::{i32_to_usize, Result};

/// Simple two-dimensional vector of any numerical type.
/// Supports only the few operations the codecs need,
/// as this is used mainly as a data struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Vec2<T> (pub T, pub T);

impl<T> Vec2<T> {

    /// The first component of this vector, seen as a position.
    #[inline] pub fn x(self) -> T where T: Copy { self.0 }

    /// The second component of this vector, seen as a position.
    #[inline] pub fn y(self) -> T where T: Copy { self.1 }

    /// The first component of this vector, seen as a dimension.
    #[inline] pub fn width(self) -> T where T: Copy { self.0 }

    /// The second component of this vector, seen as a dimension.
    #[inline] pub fn height(self) -> T where T: Copy { self.1 }

    /// Maps both components of this vector to a new type.
    pub fn map<B>(self, map: impl Fn(T) -> B) -> Vec2<B> {
        Vec2(map(self.0), map(self.1))
    }

    /// Seeing this vector as a dimension (width and height),
    /// returns the area that the dimension contains (`width * height`).
    pub fn area(self) -> T where T: std::ops::Mul<T, Output = T> {
        self.0 * self.1
    }
}

impl Vec2<i32> {

    /// Try to convert to `Vec2<usize>`, returning an error on negative numbers.
    pub fn to_usize(self, error_message: &'static str) -> Result<Vec2<usize>> {
        let x = i32_to_usize(self.0, error_message)?;
        let y = i32_to_usize(self.1, error_message)?;
        Ok(Vec2(x, y))
    }
}

impl Vec2<usize> {

    /// Panics for values that do not fit into `i32`.
    pub fn to_i32(self) -> Vec2<i32> {
        let x = i32::try_from(self.0).expect("vector x coordinate too large");
        let y = i32::try_from(self.1).expect("vector y coordinate too large");
        Vec2(x, y)
    }
}

impl<T: std::ops::Add<T>> std::ops::Add<Vec2<T>> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn add(self, other: Vec2<T>) -> Self::Output {
        Vec2(self.0 + other.0, self.1 + other.1)
    }
}

impl<T: std::ops::Sub<T>> std::ops::Sub<Vec2<T>> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn sub(self, other: Vec2<T>) -> Self::Output {
        Vec2(self.0 - other.0, self.1 - other.1)
    }
}

impl<T: std::ops::Mul<T>> std::ops::Mul<Vec2<T>> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn mul(self, other: Vec2<T>) -> Self::Output {
        Vec2(self.0 * other.0, self.1 * other.1)
    }
}

impl<T> From<(T, T)> for Vec2<T> {
    fn from((x, y): (T, T)) -> Self { Vec2(x, y) }
}

impl<T> From<Vec2<T>> for (T, T) {
    fn from(vec2: Vec2<T>) -> Self { (vec2.0, vec2.1) }
}


/// Computes `floor(log2(x))`. Returns 0 where the argument is 0.
pub(crate) fn floor_log_2(mut number: u32) -> u32 {
    let mut log = 0;

    while number > 1 {
        log += 1;
        number >>= 1;
    }

    log
}

/// Computes `ceil(log2(x))`. Returns 0 where the argument is 0.
pub(crate) fn ceil_log_2(mut number: u32) -> u32 {
    let mut log = 0;
    let mut round_up = 0;

    while number > 1 {
        if number & 1 != 0 {
            round_up = 1;
        }

        log += 1;
        number >>= 1;
    }

    log + round_up
}


/// Round up or down in specific calculations.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RoundingMode {

    /// Round down.
    Down,

    /// Round up.
    Up,
}

impl RoundingMode {

    /// Compute `log2(number)`, rounded in this direction.
    pub(crate) fn log2(self, number: usize) -> usize {
        match self {
            RoundingMode::Down => self::floor_log_2(number as u32) as usize,
            RoundingMode::Up => self::ceil_log_2(number as u32) as usize,
        }
    }

    /// Divide positive numbers, rounding the result in this direction.
    pub(crate) fn divide(self, dividend: usize, divisor: usize) -> usize {
        match self {
            RoundingMode::Up => (dividend + divisor - 1) / divisor,
            RoundingMode::Down => dividend / divisor,
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log2(){
        assert_eq!(floor_log_2(1), 0);
        assert_eq!(ceil_log_2(1), 0);

        assert_eq!(floor_log_2(2), 1);
        assert_eq!(ceil_log_2(2), 1);

        assert_eq!(floor_log_2(3), 1);
        assert_eq!(ceil_log_2(3), 2);

        assert_eq!(floor_log_2(1024), 10);
        assert_eq!(ceil_log_2(1024), 10);

        assert_eq!(floor_log_2(1023), 9);
        assert_eq!(ceil_log_2(1023), 10);
    }

    #[test]
    fn rounded_division(){
        assert_eq!(RoundingMode::Down.divide(8, 2), 4);
        assert_eq!(RoundingMode::Up.divide(8, 2), 4);

        assert_eq!(RoundingMode::Down.divide(7, 2), 3);
        assert_eq!(RoundingMode::Up.divide(7, 2), 4);
    }
}
