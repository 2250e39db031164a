//! P-256 arithmetic surface and the decimal wire codec
//!
//! The protocol treats the curve as an additive group: point addition,
//! scalar multiplication, and an identity that behaves as zero. This module
//! wraps the `p256` crate behind the small surface the protocol needs and
//! owns the codec between curve types and the wire's arbitrary-precision
//! decimal integers (a point is an `[x, y]` pair of nonnegative integers
//! below the field modulus; a scalar is a single integer below the group
//! order).
//!
//! Every conversion out of wire form validates: coordinate pairs must name
//! a point on the curve, scalars must be reduced. Nothing downstream of
//! this module ever sees an invalid group element.

use std::str::FromStr;

use elliptic_curve::{
    bigint::Encoding,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    Field, PrimeField,
};
use num_bigint::BigUint;
use p256::{AffinePoint, EncodedPoint, FieldBytes, NistP256};
use rand_core::{CryptoRng, RngCore};
use serde_json::Number;

use crate::{Point, Scalar};

/// Errors surfaced by point/scalar construction and the wire codec.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CurveError {
    /// The coordinate pair does not name a point on P-256.
    #[error("coordinate pair is not a point on P-256")]
    NotOnCurve,
    /// An integer wider than the 256-bit field/order representation.
    #[error("integer does not fit in 256 bits")]
    IntegerTooLarge,
    /// The identity has no affine coordinates and cannot cross the wire.
    #[error("the identity point has no affine coordinates")]
    Identity,
    /// An integer outside `[0, n)` where `n` is the group order.
    #[error("integer is not a scalar modulo the curve order")]
    ScalarOutOfRange,
    /// A wire integer that is negative, fractional, or not a number.
    #[error("wire integer is not a nonnegative decimal integer")]
    BadWireInteger,
}

/// The standard P-256 base point.
#[inline]
pub fn generator() -> Point {
    Point::GENERATOR
}

/// The additive identity.
#[inline]
pub fn zero() -> Point {
    Point::IDENTITY
}

/// The prime group order `n`.
pub fn order() -> BigUint {
    BigUint::from_bytes_be(&<NistP256 as elliptic_curve::Curve>::ORDER.to_be_bytes())
}

/// Construct a point from affine coordinates, rejecting off-curve input.
pub fn point_from_coords(x: &BigUint, y: &BigUint) -> Result<Point, CurveError> {
    let encoded = EncodedPoint::from_affine_coordinates(&field_bytes(x)?, &field_bytes(y)?, false);
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(Point::from)
        .ok_or(CurveError::NotOnCurve)
}

/// Affine coordinates of a point. The identity is a codec error: it cannot
/// be represented as a coordinate pair.
pub fn point_coords(point: &Point) -> Result<(BigUint, BigUint), CurveError> {
    let encoded = point.to_affine().to_encoded_point(false);
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => Ok((
            BigUint::from_bytes_be(x.as_slice()),
            BigUint::from_bytes_be(y.as_slice()),
        )),
        _ => Err(CurveError::Identity),
    }
}

/// Interpret an integer as a scalar, rejecting values `>= n`.
pub fn scalar_from_biguint(value: &BigUint) -> Result<Scalar, CurveError> {
    let bytes = field_bytes(value)?;
    Option::<Scalar>::from(Scalar::from_repr(bytes)).ok_or(CurveError::ScalarOutOfRange)
}

/// The canonical integer form of a scalar.
pub fn scalar_to_biguint(scalar: &Scalar) -> BigUint {
    BigUint::from_bytes_be(scalar.to_repr().as_slice())
}

/// Sample a scalar uniformly from `[1, n−1]`.
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    loop {
        let candidate = Scalar::random(&mut *rng);
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}

/// Short hex digest of a point for log lines.
pub fn point_digest(point: &Point) -> String {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut digest = hex::encode(encoded.as_bytes());
    digest.truncate(16);
    digest
}

fn field_bytes(value: &BigUint) -> Result<FieldBytes, CurveError> {
    let raw = value.to_bytes_be();
    if raw.len() > 32 {
        return Err(CurveError::IntegerTooLarge);
    }
    let mut padded = [0u8; 32];
    padded[32 - raw.len()..].copy_from_slice(&raw);
    Ok(padded.into())
}

// ============================================================================
// Wire codec: curve types <-> arbitrary-precision JSON integers
// ============================================================================

pub(crate) fn biguint_to_number(value: &BigUint) -> Number {
    // A digit string is always a valid JSON number under arbitrary_precision.
    serde_json::from_str(&value.to_str_radix(10)).unwrap_or_else(|_| Number::from(0u64))
}

pub(crate) fn number_to_biguint(number: &Number) -> Result<BigUint, CurveError> {
    BigUint::from_str(&number.to_string()).map_err(|_| CurveError::BadWireInteger)
}

fn number_pair(point: &Point) -> Result<(Number, Number), CurveError> {
    let (x, y) = point_coords(point)?;
    Ok((biguint_to_number(&x), biguint_to_number(&y)))
}

fn point_from_numbers(x: &Number, y: &Number) -> Result<Point, CurveError> {
    point_from_coords(&number_to_biguint(x)?, &number_to_biguint(y)?)
}

/// Serde adapter: one point as a two-integer array.
pub mod point_pair {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Number;

    use crate::Point;

    /// Serialize a point as `[x, y]` decimal integers.
    pub fn serialize<S: Serializer>(point: &Point, serializer: S) -> Result<S::Ok, S::Error> {
        super::number_pair(point)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    /// Deserialize and validate an `[x, y]` pair.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Point, D::Error> {
        let (x, y) = <(Number, Number)>::deserialize(deserializer)?;
        super::point_from_numbers(&x, &y).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: a user-id-ordered list of points.
pub mod point_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Number;

    use crate::Point;

    /// Serialize points as a list of `[x, y]` pairs.
    pub fn serialize<S: Serializer>(points: &[Point], serializer: S) -> Result<S::Ok, S::Error> {
        points
            .iter()
            .map(|p| super::number_pair(p).map_err(serde::ser::Error::custom))
            .collect::<Result<Vec<_>, _>>()?
            .serialize(serializer)
    }

    /// Deserialize and validate a list of `[x, y]` pairs.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Point>, D::Error> {
        <Vec<(Number, Number)>>::deserialize(deserializer)?
            .iter()
            .map(|(x, y)| super::point_from_numbers(x, y).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Serde adapter: one scalar as a decimal integer.
pub mod scalar_dec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Number;

    use crate::Scalar;

    /// Serialize a scalar as a decimal integer.
    pub fn serialize<S: Serializer>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error> {
        super::biguint_to_number(&super::scalar_to_biguint(scalar)).serialize(serializer)
    }

    /// Deserialize and reduce-check a decimal integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        let number = Number::deserialize(deserializer)?;
        let value = super::number_to_biguint(&number).map_err(serde::de::Error::custom)?;
        super::scalar_from_biguint(&value).map_err(serde::de::Error::custom)
    }
}
