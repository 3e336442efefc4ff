//! Scripted sessions run by the CLI subcommands.

use crate::config::CliConfig;
use crate::session::Session;
use anyhow::Result;
use chanrpc_core::{normalize_origin, Call, HandlerError, Value};
use std::time::Duration;

const DEMO_STEPS: i64 = 3;
const STALL_TIMEOUT: Duration = Duration::from_millis(50);

/// Walk through every kind of exchange once.
pub async fn demo(config: &CliConfig) -> Result<()> {
    let session = Session::open(config).await?;
    println!(
        "handshake complete: page {} <-> frame {}",
        session.parent.debug_id(),
        session.child.debug_id()
    );

    session
        .child
        .bind("job", |_, params| {
            let steps = params.get("steps").and_then(Value::as_i64).unwrap_or(1);
            let progress = params
                .get("onProgress")
                .and_then(Value::as_callback)
                .cloned()
                .ok_or("job needs an onProgress callback")?;
            for step in 1..=steps {
                progress.invoke(Value::object([("step", step), ("of", steps)]))?;
            }
            Ok(Value::from(format!("done after {} steps", steps)))
        })?
        .bind("log", |invocation, params| {
            println!("frame got notification from {}: {}", invocation.origin(), params);
            Ok(Value::Null)
        })?
        .bind("fail", |_, _| {
            Err(HandlerError::with_code("bad_input", "the demo always rejects this"))
        })?
        .bind("stall", |invocation, _| {
            if let Some(transaction) = invocation.transaction() {
                transaction.delay_return(true);
            }
            Ok(Value::Null)
        })?;

    let job = Call::new("job").params(Value::object([
        ("steps", Value::from(DEMO_STEPS)),
        (
            "onProgress",
            Value::callback(|p| {
                let step = p.get("step").and_then(Value::as_i64).unwrap_or_default();
                let of = p.get("of").and_then(Value::as_i64).unwrap_or_default();
                println!("progress {}/{}", step, of);
            }),
        ),
    ]));
    report("job", session.call_with(job, None).await?);

    session
        .parent
        .notify("log", Value::from("hello from the page"))?;

    report("fail", session.call("fail", Value::Null, None).await?);
    report(
        "stall",
        session
            .call("stall", Value::Null, Some(STALL_TIMEOUT))
            .await?,
    );

    session.close();
    Ok(())
}

/// Issue `count` echo calls and print each response.
pub async fn echo(config: &CliConfig, text: &str, count: usize) -> Result<()> {
    let session = Session::open(config).await?;
    session.child.bind("echo", |_, params| Ok(params))?;

    for n in 1..=count {
        match session.call("echo", text, None).await? {
            Ok(result) => println!("[{}] {}", n, result.unwrap_or_default()),
            Err(err) => println!("[{}] error: {}", n, err),
        }
    }
    session.close();
    Ok(())
}

/// Print the normalized form of `origin`.
pub fn check_origin(origin: &str) -> Result<()> {
    println!("{}", normalize_origin(origin)?);
    Ok(())
}

fn report(method: &str, outcome: Result<Option<Value>, chanrpc_core::RemoteError>) {
    match outcome {
        Ok(Some(result)) => println!("{} -> {}", method, result),
        Ok(None) => println!("{} -> (no result)", method),
        Err(err) if err.is_timeout() => println!("{} timed out: {}", method, err),
        Err(err) => println!("{} failed: {}", method, err),
    }
}
