//! The access path chosen by `best_index`, round-tripped to the cursor
//! through the protocol's `(index_number, index_string)` pair.
//!
//! Filter-argument layout is fixed: the `eq_parts` equality values come
//! first (in key-part order), then the lower bound, then the upper bound.

/// Bit layout of `index_number`.
const USE_INDEX: i32 = 1 << 0;
const DESCENDING: i32 = 1 << 1;
const POINT: i32 = 1 << 2;
const HAS_LOWER: i32 = 1 << 3;
const LOWER_STRICT: i32 = 1 << 4;
const HAS_UPPER: i32 = 1 << 5;
const UPPER_STRICT: i32 = 1 << 6;
const EQ_SHIFT: u32 = 8;

/// A range endpoint on the first key part after the equality prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeBound {
    pub strict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPath {
    /// Secondary index to scan; None scans the primary tree.
    pub index: Option<String>,
    /// Leading key parts consumed by equality constraints.
    pub eq_parts: usize,
    pub lower: Option<RangeBound>,
    pub upper: Option<RangeBound>,
    /// Emit rows in reverse tree order.
    pub descending: bool,
    /// Equality over the full key: a single-row lookup.
    pub point: bool,
}

impl AccessPath {
    /// Number of filter arguments this path consumes.
    pub fn arg_count(&self) -> usize {
        self.eq_parts + self.lower.is_some() as usize + self.upper.is_some() as usize
    }

    pub fn encode(&self) -> (i32, Option<String>) {
        let mut number = (self.eq_parts as i32) << EQ_SHIFT;
        if self.index.is_some() {
            number |= USE_INDEX;
        }
        if self.descending {
            number |= DESCENDING;
        }
        if self.point {
            number |= POINT;
        }
        if let Some(lower) = self.lower {
            number |= HAS_LOWER;
            if lower.strict {
                number |= LOWER_STRICT;
            }
        }
        if let Some(upper) = self.upper {
            number |= HAS_UPPER;
            if upper.strict {
                number |= UPPER_STRICT;
            }
        }
        (number, self.index.clone())
    }

    pub fn decode(number: i32, string: Option<&str>) -> Self {
        AccessPath {
            index: (number & USE_INDEX != 0).then(|| string.unwrap_or_default().to_string()),
            eq_parts: (number >> EQ_SHIFT) as usize,
            lower: (number & HAS_LOWER != 0).then(|| RangeBound {
                strict: number & LOWER_STRICT != 0,
            }),
            upper: (number & HAS_UPPER != 0).then(|| RangeBound {
                strict: number & UPPER_STRICT != 0,
            }),
            descending: number & DESCENDING != 0,
            point: number & POINT != 0,
        }
    }

    /// Human-readable form, used by explain output.
    pub fn describe(&self) -> String {
        let target = match &self.index {
            Some(index) => format!("index {index}"),
            None => "primary key".to_string(),
        };
        if self.point {
            format!("point lookup via {target}")
        } else if self.eq_parts > 0 || self.lower.is_some() || self.upper.is_some() {
            format!(
                "range scan via {target} (eq={}, lower={}, upper={}{})",
                self.eq_parts,
                self.lower.is_some(),
                self.upper.is_some(),
                if self.descending { ", desc" } else { "" },
            )
        } else if self.descending {
            format!("full scan via {target} (desc)")
        } else {
            format!("full scan via {target}")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let paths = [
            AccessPath::default(),
            AccessPath {
                index: Some("t_b".to_string()),
                eq_parts: 2,
                lower: Some(RangeBound { strict: true }),
                upper: Some(RangeBound { strict: false }),
                descending: true,
                point: false,
            },
            AccessPath {
                index: None,
                eq_parts: 1,
                lower: None,
                upper: None,
                descending: false,
                point: true,
            },
        ];
        for path in paths {
            let (number, string) = path.encode();
            assert_eq!(AccessPath::decode(number, string.as_deref()), path);
        }
    }
}
