// src/field.rs
//! Signed fixed-point values encoded into the BN254 scalar field.
//!
//! The external circuit only works over unsigned field elements, so every
//! signed integer travels as a pair: the value mapped into `[0, P)` and an
//! explicit sign bit. The mapping is the circuit's, reproduced exactly:
//! `x >= 0` encodes as `x`, `x < 0` encodes as `P + x`, and the sign bit is
//! `1` whenever `x <= 0`. Zero carrying `sign = 1` is deliberate; the circuit
//! uses `m > 0 ? 0 : 1` and any deviation breaks proof verification.

use ark_bn254::Fr;
use ark_ff::{PrimeField, Zero};

/// Field element of the BN254 scalar field (the SNARK scalar field the
/// commitment digests and proofs are computed over).
pub type Felt = Fr;

/// Model weights in scaled-integer (fixed-point) space, row-major.
pub type Weights = Vec<Vec<i128>>;
/// Model bias in scaled-integer space.
pub type Bias = Vec<i128>;

pub fn u128_to_felt(x: u128) -> Felt {
    Felt::from(x)
}

pub fn u64_to_felt(x: u64) -> Felt {
    Felt::from(x)
}

/// Encode one signed integer as `(unsigned value in [0,P), sign bit)`.
pub fn encode_value(x: i128) -> (Felt, Felt) {
    let sign = if x > 0 { Felt::from(0u64) } else { Felt::from(1u64) };
    let value = if x >= 0 {
        u128_to_felt(x as u128)
    } else {
        -u128_to_felt(x.unsigned_abs())
    };
    (value, sign)
}

/// Inverse of [`encode_value`]: reconstruct the signed integer from the
/// unsigned representative and the sign bit.
pub fn decode_value(value: Felt, sign: Felt) -> i128 {
    if value.is_zero() {
        return 0;
    }
    if sign.is_zero() {
        felt_to_u128(value) as i128
    } else {
        -(felt_to_u128(-value) as i128)
    }
}

/// Scale a floating value by an integer precision factor and truncate toward
/// zero, matching the prover's fixed-point convention.
pub fn scale(x: f64, precision: u64) -> i128 {
    (x * precision as f64).trunc() as i128
}

pub fn encode_matrix(m: &[Vec<i128>]) -> (Vec<Vec<Felt>>, Vec<Vec<Felt>>) {
    let mut values = Vec::with_capacity(m.len());
    let mut signs = Vec::with_capacity(m.len());
    for row in m {
        let mut value_row = Vec::with_capacity(row.len());
        let mut sign_row = Vec::with_capacity(row.len());
        for &x in row {
            let (v, s) = encode_value(x);
            value_row.push(v);
            sign_row.push(s);
        }
        values.push(value_row);
        signs.push(sign_row);
    }
    (values, signs)
}

pub fn encode_vector(v: &[i128]) -> (Vec<Felt>, Vec<Felt>) {
    let mut values = Vec::with_capacity(v.len());
    let mut signs = Vec::with_capacity(v.len());
    for &x in v {
        let (val, s) = encode_value(x);
        values.push(val);
        signs.push(s);
    }
    (values, signs)
}

pub fn decode_matrix(values: &[Vec<Felt>], signs: &[Vec<Felt>]) -> Weights {
    values
        .iter()
        .zip(signs)
        .map(|(vr, sr)| vr.iter().zip(sr).map(|(&v, &s)| decode_value(v, s)).collect())
        .collect()
}

pub fn decode_vector(values: &[Felt], signs: &[Felt]) -> Bias {
    values
        .iter()
        .zip(signs)
        .map(|(&v, &s)| decode_value(v, s))
        .collect()
}

// The magnitudes handled here are fixed-point model parameters, far below
// 2^127; anything larger indicates a corrupted encoding and is a programmer
// error, so the conversion asserts instead of returning a Result.
fn felt_to_u128(x: Felt) -> u128 {
    let limbs = x.into_bigint().0;
    assert!(
        limbs[2] == 0 && limbs[3] == 0 && limbs[1] < (1u64 << 63),
        "field element does not fit a signed 128-bit magnitude"
    );
    (limbs[0] as u128) | ((limbs[1] as u128) << 64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::One;

    #[test]
    fn encode_decode_round_trip() {
        for x in [0i128, 1, -1, 42, -42, 1_000_000, -1_000_000, i64::MAX as i128] {
            let (v, s) = encode_value(x);
            assert_eq!(decode_value(v, s), x, "round trip failed for {}", x);
        }
    }

    #[test]
    fn zero_encodes_with_sign_one() {
        let (v, s) = encode_value(0);
        assert!(v.is_zero());
        assert!(s.is_one());
    }

    #[test]
    fn negative_values_wrap_into_the_field() {
        let (v, s) = encode_value(-5);
        assert!(s.is_one());
        // P - 5 + 5 == 0 in the field
        assert!((v + Felt::from(5u64)).is_zero());
    }

    #[test]
    fn matrix_round_trip() {
        let m: Weights = vec![vec![3, -7, 0], vec![-1, 12, 5]];
        let (values, signs) = encode_matrix(&m);
        assert_eq!(decode_matrix(&values, &signs), m);
    }

    #[test]
    fn scale_truncates_toward_zero() {
        assert_eq!(scale(1.279, 100), 127);
        assert_eq!(scale(-1.279, 100), -127);
        assert_eq!(scale(0.0, 10_000), 0);
        assert_eq!(scale(-0.00009, 10_000), 0);
    }
}
