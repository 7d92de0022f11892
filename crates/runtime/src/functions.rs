//! The built-in scalar and aggregate functions registered on every
//! database. Deliberately small: embedders register their own on top.

use std::sync::Arc;

use plan::{AggregateFunction, AggregateState, FunctionRegistry, ScalarFunction};
use plan::functions::ScalarBody;
use values::{compare, ops, SqlValue, TypeAffinity};

type FnResult<T> = std::result::Result<T, vtab::Error>;

fn sync_scalar(
    name: &str,
    arg_count: Option<usize>,
    returns: TypeAffinity,
    body: impl Fn(&[SqlValue]) -> FnResult<SqlValue> + Send + Sync + 'static,
) -> ScalarFunction {
    ScalarFunction {
        name: name.to_string(),
        arg_count,
        returns,
        body: ScalarBody::Sync(Arc::new(body)),
    }
}

pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register_scalar(sync_scalar(
        "lower",
        Some(1),
        TypeAffinity::Text,
        |args| {
            Ok(match args[0].as_str() {
                Some(text) => SqlValue::text(text.to_lowercase()),
                None => args[0].clone(),
            })
        },
    ));
    registry.register_scalar(sync_scalar(
        "upper",
        Some(1),
        TypeAffinity::Text,
        |args| {
            Ok(match args[0].as_str() {
                Some(text) => SqlValue::text(text.to_uppercase()),
                None => args[0].clone(),
            })
        },
    ));
    registry.register_scalar(sync_scalar(
        "length",
        Some(1),
        TypeAffinity::Integer,
        |args| {
            Ok(match &args[0] {
                SqlValue::Null => SqlValue::Null,
                SqlValue::Text(text) => SqlValue::Integer(text.chars().count() as i64),
                SqlValue::Blob(bytes) => SqlValue::Integer(bytes.len() as i64),
                other => SqlValue::Integer(other.to_string().len() as i64),
            })
        },
    ));
    registry.register_scalar(sync_scalar(
        "abs",
        Some(1),
        TypeAffinity::Numeric,
        |args| {
            Ok(match &args[0] {
                SqlValue::Null => SqlValue::Null,
                value => {
                    let negative = matches!(
                        compare(value, &SqlValue::Integer(0)),
                        std::cmp::Ordering::Less
                    );
                    if negative {
                        ops::neg(value)
                    } else {
                        value.clone()
                    }
                }
            })
        },
    ));
    registry.register_scalar(sync_scalar(
        "coalesce",
        None,
        TypeAffinity::Blob,
        |args| {
            Ok(args
                .iter()
                .find(|value| !value.is_null())
                .cloned()
                .unwrap_or(SqlValue::Null))
        },
    ));
    registry.register_scalar(sync_scalar(
        "nullif",
        Some(2),
        TypeAffinity::Blob,
        |args| {
            Ok(
                if !args[0].is_null()
                    && compare(&args[0], &args[1]) == std::cmp::Ordering::Equal
                {
                    SqlValue::Null
                } else {
                    args[0].clone()
                },
            )
        },
    ));
    registry.register_scalar(sync_scalar(
        "typeof",
        Some(1),
        TypeAffinity::Text,
        |args| Ok(SqlValue::text(args[0].type_name())),
    ));

    registry.register_aggregate(AggregateFunction {
        name: "count".to_string(),
        arg_count: None,
        returns: TypeAffinity::Integer,
        init: Arc::new(|| Box::new(CountState(0))),
    });
    registry.register_aggregate(AggregateFunction {
        name: "sum".to_string(),
        arg_count: Some(1),
        returns: TypeAffinity::Numeric,
        init: Arc::new(|| Box::new(SumState(None))),
    });
    registry.register_aggregate(AggregateFunction {
        name: "avg".to_string(),
        arg_count: Some(1),
        returns: TypeAffinity::Real,
        init: Arc::new(|| Box::new(AvgState { sum: 0.0, count: 0 })),
    });
    registry.register_aggregate(AggregateFunction {
        name: "min".to_string(),
        arg_count: Some(1),
        returns: TypeAffinity::Blob,
        init: Arc::new(|| Box::new(ExtremeState { best: None, want_max: false })),
    });
    registry.register_aggregate(AggregateFunction {
        name: "max".to_string(),
        arg_count: Some(1),
        returns: TypeAffinity::Blob,
        init: Arc::new(|| Box::new(ExtremeState { best: None, want_max: true })),
    });
}

/// count(*) steps once per row; count(x) skips Nulls.
struct CountState(i64);

impl AggregateState for CountState {
    fn step(&mut self, args: &[SqlValue]) -> FnResult<()> {
        if args.first().map(SqlValue::is_null) != Some(true) {
            self.0 += 1;
        }
        Ok(())
    }
    fn finish(self: Box<Self>) -> FnResult<SqlValue> {
        Ok(SqlValue::Integer(self.0))
    }
}

/// sum() is Null over an empty (or all-Null) input.
struct SumState(Option<SqlValue>);

impl AggregateState for SumState {
    fn step(&mut self, args: &[SqlValue]) -> FnResult<()> {
        let value = &args[0];
        if value.is_null() {
            return Ok(());
        }
        self.0 = Some(match &self.0 {
            None => value.clone(),
            Some(total) => ops::add(total, value),
        });
        Ok(())
    }
    fn finish(self: Box<Self>) -> FnResult<SqlValue> {
        Ok(self.0.unwrap_or(SqlValue::Null))
    }
}

struct AvgState {
    sum: f64,
    count: i64,
}

impl AggregateState for AvgState {
    fn step(&mut self, args: &[SqlValue]) -> FnResult<()> {
        if let Some(value) = args[0].as_f64() {
            self.sum += value;
            self.count += 1;
        }
        Ok(())
    }
    fn finish(self: Box<Self>) -> FnResult<SqlValue> {
        Ok(if self.count == 0 {
            SqlValue::Null
        } else {
            SqlValue::Float(self.sum / self.count as f64)
        })
    }
}

struct ExtremeState {
    best: Option<SqlValue>,
    want_max: bool,
}

impl AggregateState for ExtremeState {
    fn step(&mut self, args: &[SqlValue]) -> FnResult<()> {
        let value = &args[0];
        if value.is_null() {
            return Ok(());
        }
        let better = match &self.best {
            None => true,
            Some(best) => {
                let ordering = compare(value, best);
                if self.want_max {
                    ordering == std::cmp::Ordering::Greater
                } else {
                    ordering == std::cmp::Ordering::Less
                }
            }
        };
        if better {
            self.best = Some(value.clone());
        }
        Ok(())
    }
    fn finish(self: Box<Self>) -> FnResult<SqlValue> {
        Ok(self.best.unwrap_or(SqlValue::Null))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_aggregate(
        init: &Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync>,
        inputs: &[SqlValue],
    ) -> SqlValue {
        let mut state = init();
        for value in inputs {
            state.step(std::slice::from_ref(value)).unwrap();
        }
        state.finish().unwrap()
    }

    #[test]
    fn test_count_skips_nulls_with_argument() {
        let init: Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync> =
            Arc::new(|| Box::new(CountState(0)));
        let out = run_aggregate(
            &init,
            &[SqlValue::Integer(1), SqlValue::Null, SqlValue::Integer(2)],
        );
        assert_eq!(out, SqlValue::Integer(2));
    }

    #[test]
    fn test_sum_and_extremes() {
        let sum: Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync> =
            Arc::new(|| Box::new(SumState(None)));
        assert_eq!(run_aggregate(&sum, &[]), SqlValue::Null);
        assert_eq!(
            run_aggregate(&sum, &[SqlValue::Integer(2), SqlValue::Integer(3)]),
            SqlValue::Integer(5)
        );

        let min: Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync> =
            Arc::new(|| Box::new(ExtremeState { best: None, want_max: false }));
        assert_eq!(
            run_aggregate(&min, &[SqlValue::Integer(4), SqlValue::Integer(1)]),
            SqlValue::Integer(1)
        );
    }
}
