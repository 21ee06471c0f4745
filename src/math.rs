// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sign-preserving integer division helpers used by the dependency
//! resolver and the repetition-vector adjustment. Divisors are positive.

pub(crate) fn floor_div(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    a.div_euclid(b)
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    (a + b - 1).div_euclid(b)
}

/// Remainder matching [`floor_div`]: always in `0..b`.
pub(crate) fn floor_rem(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    a.rem_euclid(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_div_negative_operand() {
        assert_eq!(floor_div(-1, 2), -1);
        assert_eq!(floor_div(-4, 2), -2);
        assert_eq!(floor_div(5, 2), 2);
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(5, 2), 3);
        assert_eq!(ceil_div(4, 2), 2);
        assert_eq!(ceil_div(-1, 2), 0);
        assert_eq!(ceil_div(0, 7), 0);
    }

    #[test]
    fn test_floor_rem_matches_floor_div() {
        for a in -7..7 {
            for b in 1..5 {
                assert_eq!(floor_div(a, b) * b + floor_rem(a, b), a);
            }
        }
    }
}
