use crate::error::{ErrorKind, Result};
use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Largest number of elements one matrix may hold. Kernel parameters index with `u32`.
pub const MAX_ELEMENTS: usize = 1 << 28;

/// Dimensions of a row-major matrix. `height` rows of `width` columns.
#[derive(Default, Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Shape {
    pub width: usize,
    pub height: usize,
}

impl Shape {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn rows(&self) -> usize {
        self.height
    }

    pub fn cols(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Reject shapes that have no elements or are too large to allocate.
    pub fn validate(&self) -> Result<()> {
        match self.width.checked_mul(self.height) {
            Some(0) => Err(ErrorKind::DimensionMismatch(format!(
                "matrix {self} has no elements"
            ))
            .into()),
            Some(n) if n <= MAX_ELEMENTS => Ok(()),
            _ => Err(ErrorKind::DimensionMismatch(format!(
                "matrix {self} exceeds {MAX_ELEMENTS} elements"
            ))
            .into()),
        }
    }

    pub fn transposed(&self) -> Shape {
        Shape::new(self.height, self.width)
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Input,
    Train,
    Intermediate,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub width: usize,
    pub height: usize,
    pub node_type: NodeType,
}

impl NodeSpec {
    pub fn new(width: usize, height: usize, node_type: NodeType) -> Self {
        Self {
            width,
            height,
            node_type,
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.width, self.height)
    }
}

/// How the value buffer of a fresh node is filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Init {
    #[default]
    Zero,
    Random,
    Identity,
    Data(Vec<f32>),
}

/// Roughly gaussian noise centered at zero, built from four uniform samples.
#[derive(Debug, Clone, Copy)]
pub struct CenteredNoise;

impl Distribution<f32> for CenteredNoise {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        let u = Uniform::new(0.0f32, 1.0f32);
        0.1 * (u.sample(rng) - u.sample(rng) + u.sample(rng) - u.sample(rng))
    }
}

impl Init {
    /// Host-side contents for a buffer of the given shape.
    pub fn materialize<R: Rng>(&self, shape: &Shape, rng: &mut R) -> Result<Array2<f32>> {
        let dims = (shape.rows(), shape.cols());
        match self {
            Init::Zero => Ok(Array2::zeros(dims)),
            Init::Random => Ok(Array2::random_using(dims, CenteredNoise, rng)),
            Init::Identity => {
                if !shape.is_square() {
                    return Err(ErrorKind::DimensionMismatch(format!(
                        "identity initialization needs a square matrix, got {shape}"
                    ))
                    .into());
                }
                Ok(Array2::eye(shape.rows()))
            }
            Init::Data(v) => {
                if v.len() != shape.len() {
                    return Err(ErrorKind::SizeMismatch {
                        got: v.len(),
                        shape: *shape,
                    }
                    .into());
                }
                Array2::from_shape_vec(dims, v.clone())
                    .map_err(|e| ErrorKind::DimensionMismatch(e.to_string()).into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_identity_requires_square() {
        let mut rng = StdRng::seed_from_u64(1);
        let eye = Init::Identity.materialize(&Shape::new(3, 3), &mut rng).unwrap();
        assert_eq!(eye[[1, 1]], 1.0);
        assert_eq!(eye[[1, 2]], 0.0);

        let err = Init::Identity
            .materialize(&Shape::new(2, 3), &mut rng)
            .unwrap_err();
        assert!(matches!(*err, ErrorKind::DimensionMismatch(_)));
    }

    #[test]
    fn test_data_length_checked() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = Init::Data(vec![1.0, 2.0, 3.0])
            .materialize(&Shape::new(2, 2), &mut rng)
            .unwrap_err();
        assert_eq!(
            *err,
            ErrorKind::SizeMismatch {
                got: 3,
                shape: Shape::new(2, 2)
            }
        );
    }

    #[test]
    fn test_random_is_small_and_centered() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = Init::Random
            .materialize(&Shape::new(100, 100), &mut rng)
            .unwrap();
        let mean = m.mean().unwrap();
        assert!(mean.abs() < 0.01, "mean {mean}");
        assert!(m.iter().all(|v| v.abs() <= 0.2));
    }

    #[test]
    fn test_validate_bounds_size() {
        assert!(Shape::new(3, 2).validate().is_ok());
        assert!(Shape::new(MAX_ELEMENTS, 1).validate().is_ok());
        for s in [
            Shape::new(0, 4),
            Shape::new(MAX_ELEMENTS + 1, 1),
            Shape::new(usize::MAX / 2, 3),
            Shape::new(usize::MAX, 2),
        ] {
            let err = s.validate().unwrap_err();
            assert!(matches!(*err, ErrorKind::DimensionMismatch(_)), "{s}");
        }
    }

    #[test]
    fn test_spec_wire_form() {
        let spec: NodeSpec =
            serde_json::from_str(r#"{"width": 2, "height": 4, "nodeType": "train"}"#).unwrap();
        assert_eq!(spec, NodeSpec::new(2, 4, NodeType::Train));
        assert_eq!(spec.shape().to_string(), "4x2");
    }
}
