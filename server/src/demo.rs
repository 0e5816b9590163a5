//! # Demo Method Table
//!
//! The table `bridge-server` serves by default:
//! - `init`: pushes a `connected` update carrying the caller origin
//! - `echo(value)`: returns its first argument
//! - `getBalance(account)`: balance of a fixed demo account, as a string
//! - `sum(...numbers)`: adds numbers; any big integer argument makes the
//!   result a big integer
//! - `count(limit?)`: streams `[1]`, `[2]`, ... every 100 ms until canceled
//!   or `limit` is reached
//! - `fail(message?)`: always fails

use crate::table::{CallContext, MethodError, MethodTable};
use bridge_protocol::{Update, Value};
use num_bigint::BigInt;
use std::time::Duration;

const COUNT_INTERVAL: Duration = Duration::from_millis(100);

pub fn demo_table() -> MethodTable {
    MethodTable::new()
        .on_init(|ctx, _args| async move {
            let mut update = Update::new("connected");
            if let Some(origin) = ctx.origin {
                update = update.with_field("origin", origin);
            }
            ctx.updates.send(update).map_err(MethodError::failed)
        })
        .method("echo", |_, args| async move {
            Ok(args.into_iter().next().unwrap_or_default())
        })
        .method("getBalance", |_, args| async move {
            match args.first().and_then(Value::as_str) {
                Some("acc1") => Ok(Value::from("42")),
                Some(account) => Err(MethodError::failed(format!("unknown account: {account}"))),
                None => Err(MethodError::failed("account required")),
            }
        })
        .method("sum", |_, args| async move { sum(&args) })
        .method("count", count)
        .method("fail", |_, args| async move {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_owned();
            Err(MethodError::Failed(message))
        })
}

fn sum(args: &[Value]) -> Result<Value, MethodError> {
    let big = args.iter().any(|arg| arg.as_bigint().is_some());
    if !big {
        let mut total = 0.0;
        for arg in args {
            total += arg
                .as_f64()
                .ok_or_else(|| MethodError::failed("sum takes numbers only"))?;
        }
        return Ok(Value::Number(total));
    }

    let mut total = BigInt::from(0);
    for arg in args {
        match arg {
            Value::BigInt(n) => total += n,
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => total += *n as i64,
            _ => return Err(MethodError::failed("cannot mix fractions with big integers")),
        }
    }
    Ok(Value::BigInt(total))
}

async fn count(ctx: CallContext, args: Vec<Value>) -> Result<Value, MethodError> {
    let limit = args.first().and_then(Value::as_f64).map(|n| n as u64);
    let Some(progress) = ctx.progress() else {
        return Err(MethodError::failed("count needs a progress callback"));
    };

    let mut n: u64 = 0;
    loop {
        if progress.is_canceled() {
            return Ok(Value::from("canceled"));
        }
        if limit.is_some_and(|limit| n >= limit) {
            return Ok(Value::from("done"));
        }
        n += 1;
        progress
            .send(vec![Value::Number(n as f64)])
            .map_err(MethodError::failed)?;
        tokio::time::sleep(COUNT_INTERVAL).await;
    }
}
