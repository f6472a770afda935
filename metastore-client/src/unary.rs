//! Shared retry envelope for unary calls against the backend.

use std::future::Future;

use tokio::time::sleep;
use tracing::{error, warn};

use crate::backoff;
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::health::HealthGate;

/// Run `call` up to `options.operation_retry_times` times, sleeping a
/// uniform random duration scaled by the attempt number between tries.
///
/// Each attempt is given `grpc_timeout * attempt` as its deadline (the
/// closure receives the 1-based attempt for that). A tripped health gate
/// fails the call immediately without reaching the transport. With
/// `short_circuit_terminal`, errors the taxonomy marks terminal (unknown
/// backend errors and exceeded deadlines) are surfaced without further
/// retries.
pub(crate) async fn retry_unary<R, F, Fut>(
    op: &'static str,
    gate: &HealthGate,
    options: &TimeoutOptions,
    short_circuit_terminal: bool,
    mut call: F,
) -> Result<R>
where
    F: FnMut(u32) -> Fut + Send,
    Fut: Future<Output = std::result::Result<R, tonic::Status>> + Send,
{
    let mut attempt = 1u32;
    loop {
        if let Some(detail) = gate.tripped() {
            return Err(Error::FallBreak(format!("failed to call {op}: {detail}")));
        }
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(status) => {
                let err = Error::from_status(status);
                if short_circuit_terminal && err.is_terminal() {
                    error!(op, %err, "backend refused the call, not retrying");
                    return Err(err);
                }
                if attempt >= options.operation_retry_times {
                    error!(op, attempt, %err, "retries exhausted");
                    return Err(err);
                }
                warn!(op, attempt, %err, "call failed, backing off before retry");
                sleep(backoff::retry_delay(options, attempt)).await;
                attempt += 1;
            }
        }
    }
}
